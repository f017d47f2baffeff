// Deduplication stage - suppress double-capture of one request
//
// The same request can be visible twice: once at the proxy and once through
// the agent's own telemetry channel. A fingerprint over (method, host, path
// without query, body-prefix hash) identifies repeats inside a short window
// so only the first capture is appended. Fingerprints are derived and held
// in a bounded LRU; they are never persisted.

use crate::events::{EventPayload, TraceEvent};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};

/// Body bytes that participate in the fingerprint.
const FINGERPRINT_BODY_PREFIX: usize = 1024;

/// Derived request identity. Two requests with the same fingerprint inside
/// the window are considered one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint(u128);

impl RequestFingerprint {
    fn compute(method: &str, url: &str, body: Option<&str>) -> Self {
        // Split the URL into host + path-without-query; scheme and query
        // are excluded so proxy-observed and telemetry-observed forms align
        let without_scheme = url.split("://").nth(1).unwrap_or(url);
        let without_query = without_scheme.split('?').next().unwrap_or(without_scheme);

        let mut hasher = Sha256::new();
        hasher.update(method.as_bytes());
        hasher.update(b"\0");
        hasher.update(without_query.as_bytes());
        hasher.update(b"\0");
        if let Some(body) = body {
            let prefix = crate::util::truncate_utf8_safe(body, FINGERPRINT_BODY_PREFIX);
            hasher.update(prefix.as_bytes());
        }
        let digest = hasher.finalize();
        let mut first16 = [0u8; 16];
        first16.copy_from_slice(&digest[..16]);
        Self(u128::from_be_bytes(first16))
    }

    /// Fingerprint a request-shaped event; None for every other kind.
    pub fn of(event: &TraceEvent) -> Option<Self> {
        match &event.payload {
            EventPayload::HttpRequest { request } | EventPayload::AiRequest { request, .. } => {
                Some(Self::compute(
                    &request.method,
                    &request.url,
                    request.body.as_deref(),
                ))
            }
            _ => None,
        }
    }
}

/// Bounded LRU of recently seen fingerprints.
pub struct Deduper {
    window_ms: i64,
    capacity: usize,
    seen: HashMap<RequestFingerprint, i64>,
    order: VecDeque<RequestFingerprint>,
}

impl Deduper {
    pub fn new(capacity: usize, window_ms: u64) -> Self {
        Self {
            window_ms: window_ms as i64,
            capacity,
            seen: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// True when the event is a duplicate inside the window and should be
    /// dropped. Feeding the same request twice yields exactly one keep.
    pub fn is_duplicate(&mut self, event: &TraceEvent) -> bool {
        let Some(fingerprint) = RequestFingerprint::of(event) else {
            return false;
        };

        let now = event.timestamp;
        if let Some(&last_seen) = self.seen.get(&fingerprint) {
            if (now - last_seen).abs() <= self.window_ms {
                return true;
            }
        }

        self.insert(fingerprint, now);
        false
    }

    fn insert(&mut self, fingerprint: RequestFingerprint, timestamp: i64) {
        if self.seen.insert(fingerprint.clone(), timestamp).is_none() {
            self.order.push_back(fingerprint);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}
