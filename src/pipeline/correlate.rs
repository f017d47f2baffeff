// Correlation stage - pair responses with their requests
//
// Requests register their correlation id and timestamp; responses pick up
// `parent_correlation_id` (when the producer could not set it) and get
// `duration_ms` computed from the paired request. Entries expire so a
// request whose response never arrives cannot leak memory.

use crate::events::{EventPayload, TraceEvent};
use std::collections::HashMap;

/// How long a pending request is remembered.
const PENDING_TTL_MS: i64 = 600_000;

/// Sweep threshold: expired entries are collected once the map grows past
/// this many pending requests.
const SWEEP_THRESHOLD: usize = 512;

pub struct Correlator {
    pending: HashMap<String, i64>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Observe one event, filling response linkage in place.
    pub fn observe(&mut self, event: &mut TraceEvent) {
        let now = event.timestamp;
        match &mut event.payload {
            EventPayload::HttpRequest { .. } | EventPayload::AiRequest { .. } => {
                self.pending.insert(event.correlation_id.clone(), now);
                if self.pending.len() > SWEEP_THRESHOLD {
                    self.sweep(now);
                }
            }
            EventPayload::HttpResponse { response }
            | EventPayload::AiResponse { response, .. } => {
                if let Some(parent) = &response.parent_correlation_id {
                    if let Some(request_ts) = self.pending.remove(parent) {
                        if response.duration_ms.is_none() {
                            response.duration_ms = Some((now - request_ts).max(0));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn sweep(&mut self, now: i64) {
        self.pending.retain(|_, ts| now - *ts <= PENDING_TTL_MS);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Headers, RequestRecord, ResponseRecord};

    fn request(id: &str, timestamp: i64) -> TraceEvent {
        TraceEvent {
            timestamp,
            session_id: "s".into(),
            correlation_id: id.into(),
            payload: EventPayload::HttpRequest {
                request: RequestRecord {
                    method: "GET".into(),
                    url: "http://h/x".into(),
                    headers: Headers::new(),
                    body: None,
                    body_truncated: None,
                    body_original_size: None,
                },
            },
        }
    }

    fn response(parent: &str, timestamp: i64) -> TraceEvent {
        TraceEvent {
            timestamp,
            session_id: "s".into(),
            correlation_id: format!("{parent}-r"),
            payload: EventPayload::HttpResponse {
                response: ResponseRecord {
                    parent_correlation_id: Some(parent.into()),
                    status: 200,
                    headers: Headers::new(),
                    body: None,
                    body_truncated: None,
                    body_original_size: None,
                    truncated: None,
                    duration_ms: None,
                    error: None,
                },
            },
        }
    }

    #[test]
    fn test_duration_computed_from_paired_request() {
        let mut correlator = Correlator::new();
        let mut req = request("r1", 1_000);
        correlator.observe(&mut req);

        let mut resp = response("r1", 1_250);
        correlator.observe(&mut resp);

        if let EventPayload::HttpResponse { response } = &resp.payload {
            assert_eq!(response.duration_ms, Some(250));
        } else {
            panic!("payload kind changed");
        }
    }

    #[test]
    fn test_existing_duration_preserved() {
        let mut correlator = Correlator::new();
        let mut req = request("r1", 1_000);
        correlator.observe(&mut req);

        let mut resp = response("r1", 1_250);
        if let EventPayload::HttpResponse { response } = &mut resp.payload {
            response.duration_ms = Some(99);
        }
        correlator.observe(&mut resp);

        if let EventPayload::HttpResponse { response } = &resp.payload {
            assert_eq!(response.duration_ms, Some(99));
        }
    }

    #[test]
    fn test_unmatched_response_left_alone() {
        let mut correlator = Correlator::new();
        let mut resp = response("never-seen", 1_000);
        correlator.observe(&mut resp);
        if let EventPayload::HttpResponse { response } = &resp.payload {
            assert_eq!(response.duration_ms, None);
        }
    }

    #[test]
    fn test_expired_pending_requests_swept() {
        let mut correlator = Correlator::new();
        for i in 0..SWEEP_THRESHOLD + 1 {
            let mut req = request(&format!("r{i}"), 0);
            req.timestamp = if i == SWEEP_THRESHOLD {
                // This late arrival triggers the sweep of all stale entries
                PENDING_TTL_MS + 1_000
            } else {
                0
            };
            correlator.observe(&mut req);
        }
        assert_eq!(correlator.pending_len(), 1);
    }
}
