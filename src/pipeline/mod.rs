//! Event pipeline: validate -> redact -> dedupe -> correlate -> order -> append
//!
//! One worker task owns the session log. Producers (proxy, telemetry,
//! supervisor) push events through a bounded queue with `try_send`; when the
//! queue is full they drop the event and the overflow is surfaced as an
//! `error` event, never as blocked traffic.
//!
//! The worker holds at most one ordering window of events in memory. On each
//! flush the window is sorted by timestamp (ties keep arrival order), folded
//! into the running summary, serialized, and appended to the log with one
//! fsync per batch. Append failures retry with exponential backoff; if the
//! backlog outgrows its cap the session degrades to `failed` and subsequent
//! events are dropped.

pub mod correlate;
pub mod dedupe;
pub mod redact;

use crate::config::Config;
use crate::error::ErrorCode;
use crate::events::{EventPayload, SessionSummary, TraceEvent};
use crate::store::SessionLog;
use crate::util::now_millis;
use correlate::Correlator;
use dedupe::Deduper;
use redact::Redactor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Message accepted by the worker.
enum PipelineMsg {
    Event(TraceEvent),
    /// Drain the ordering window and reply with the current summary.
    Flush(oneshot::Sender<SessionSummary>),
}

/// Outcome returned when the worker drains and exits.
#[derive(Debug)]
pub struct PipelineResult {
    pub summary: SessionSummary,
    /// True when append gave up and events were lost.
    pub failed: bool,
}

/// Producer-side handle. Cheap to clone; all submission is non-blocking.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<PipelineMsg>,
    session_id: Arc<str>,
    dropped: Arc<AtomicU64>,
    /// Code reported when this producer's events are dropped on overflow:
    /// the proxy reports EventBufferOverflow, everything else the queue's
    /// own PipelineOverflow.
    overflow_code: ErrorCode,
}

impl PipelineHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// A clone of this handle that reports overflow under `code`.
    pub fn with_overflow_code(&self, code: ErrorCode) -> Self {
        let mut handle = self.clone();
        handle.overflow_code = code;
        handle
    }

    /// Stamp a payload with the session id, a fresh correlation id, and the
    /// current wall clock.
    pub fn make_event(&self, payload: EventPayload) -> TraceEvent {
        TraceEvent {
            timestamp: now_millis(),
            session_id: self.session_id.to_string(),
            correlation_id: crate::events::generate_correlation_id(),
            payload,
        }
    }

    /// Non-blocking submit; drops the event when the queue is full.
    ///
    /// Overflow is counted, and once the queue accepts traffic again a
    /// single `error` event reports how many events were lost.
    pub fn emit(&self, event: TraceEvent) {
        match self.tx.try_send(PipelineMsg::Event(event)) {
            Ok(()) => {
                let lost = self.dropped.swap(0, Ordering::Relaxed);
                if lost > 0 {
                    let overflow = self.make_event(EventPayload::Error {
                        code: self.overflow_code,
                        message: format!("event queue overflow, {lost} event(s) dropped"),
                        context: None,
                    });
                    // Best effort; if this one is also dropped the counter
                    // picks it back up
                    if self.tx.try_send(PipelineMsg::Event(overflow)).is_err() {
                        self.dropped.fetch_add(lost + 1, Ordering::Relaxed);
                    }
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("pipeline queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("pipeline closed, dropping event");
            }
        }
    }

    /// Shorthand: stamp and emit.
    pub fn emit_payload(&self, payload: EventPayload) {
        let event = self.make_event(payload);
        self.emit(event);
    }

    /// Drain everything queued so far and return the summary snapshot.
    pub async fn flush(&self) -> Option<SessionSummary> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx.send(PipelineMsg::Flush(ack_tx)).await.ok()?;
        ack_rx.await.ok()
    }
}

/// Start the worker task that owns `log`.
pub fn spawn(
    config: Arc<Config>,
    log: SessionLog,
    session_id: String,
) -> (PipelineHandle, JoinHandle<PipelineResult>) {
    let (tx, rx) = mpsc::channel(config.pipeline_queue_size);
    let handle = PipelineHandle {
        tx,
        session_id: Arc::from(session_id.as_str()),
        dropped: Arc::new(AtomicU64::new(0)),
        overflow_code: ErrorCode::PipelineOverflow,
    };

    let worker = PipelineWorker {
        redactor: Redactor::from_config(&config),
        deduper: Deduper::new(config.dedupe_lru_size, config.dedupe_window_ms),
        correlator: Correlator::new(),
        config,
        session_id,
        log,
        window: Vec::new(),
        backlog: Vec::new(),
        last_appended_ts: 0,
        summary: SessionSummary::default(),
        session_ended: false,
        failed: false,
    };

    let join = tokio::spawn(worker.run(rx));
    (handle, join)
}

struct PipelineWorker {
    config: Arc<Config>,
    session_id: String,
    log: SessionLog,
    redactor: Redactor,
    deduper: Deduper,
    correlator: Correlator,
    /// Current ordering window, in arrival order.
    window: Vec<TraceEvent>,
    /// Serialized lines whose append failed, awaiting retry.
    backlog: Vec<String>,
    last_appended_ts: i64,
    summary: SessionSummary,
    session_ended: bool,
    failed: bool,
}

impl PipelineWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<PipelineMsg>) -> PipelineResult {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.order_window_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(PipelineMsg::Event(event)) => {
                        self.ingest(event);
                        if self.window.len() >= self.config.batch_max_events {
                            self.flush().await;
                        }
                    }
                    Some(PipelineMsg::Flush(ack)) => {
                        self.flush().await;
                        let _ = ack.send(self.summary.clone());
                    }
                    None => break,
                },
                _ = ticker.tick() => self.flush().await,
            }
        }

        // Producers are gone; drain whatever is left
        self.flush().await;
        PipelineResult {
            summary: self.summary,
            failed: self.failed,
        }
    }

    /// Stages 1-4. Ordering and append happen at flush.
    fn ingest(&mut self, event: TraceEvent) {
        // Invariant: nothing is accepted after session_end is appended
        if self.session_ended || self.failed {
            return;
        }

        // 1. Validate; a bad event becomes an error event, never a crash
        let event = match self.validate(event) {
            Ok(event) => event,
            Err(event) => event,
        };

        // 2. Redact on a structural copy
        let mut event = self.redactor.apply(&event);

        // 3. Dedupe proxy-vs-telemetry double capture
        if self.deduper.is_duplicate(&event) {
            tracing::trace!("dropping duplicate request capture");
            return;
        }

        // 4. Correlate response linkage
        self.correlator.observe(&mut event);

        self.window.push(event);
    }

    /// Required fields: a positive timestamp, the owning session's id, and a
    /// correlation id. Anything else is replaced by an `error` event.
    fn validate(&self, event: TraceEvent) -> Result<TraceEvent, TraceEvent> {
        let mut problems = Vec::new();
        if event.timestamp <= 0 {
            problems.push("timestamp");
        }
        if event.session_id != self.session_id {
            problems.push("session_id");
        }
        if event.correlation_id.is_empty() {
            problems.push("correlation_id");
        }
        if problems.is_empty() {
            return Ok(event);
        }
        Err(TraceEvent {
            timestamp: now_millis(),
            session_id: self.session_id.clone(),
            correlation_id: crate::events::generate_correlation_id(),
            payload: EventPayload::Error {
                code: ErrorCode::EventInvalid,
                message: format!(
                    "rejected {} event: invalid {}",
                    event.payload.kind(),
                    problems.join(", ")
                ),
                context: None,
            },
        })
    }

    /// Stages 5-6: sort the window, serialize, append with fsync.
    async fn flush(&mut self) {
        if self.window.is_empty() && self.backlog.is_empty() {
            return;
        }

        // Stable sort: equal timestamps keep pipeline arrival order
        self.window.sort_by_key(|event| event.timestamp);

        let mut lines = std::mem::take(&mut self.backlog);
        for mut event in self.window.drain(..) {
            // An event arriving after its window has been appended is
            // clamped forward so log timestamps never go backwards
            if event.timestamp < self.last_appended_ts {
                event.timestamp = self.last_appended_ts;
            }
            self.last_appended_ts = event.timestamp;

            self.summary.record(&event);
            if matches!(event.payload, EventPayload::SessionEnd { .. }) {
                self.session_ended = true;
            }

            match serde_json::to_string(&event) {
                Ok(line) => lines.push(line),
                Err(e) => tracing::error!("unserializable event dropped: {e}"),
            }
        }

        if lines.is_empty() {
            return;
        }

        if let Err(error) = self.append_with_retry(&lines).await {
            tracing::error!("event log append failed after retries: {error}");
            self.backlog = lines;
            if self.backlog.len() > self.config.pipeline_overflow_cap {
                // Session degrades to failed; record the condition as the
                // final line if the log ever becomes writable again
                self.failed = true;
                self.backlog.truncate(self.config.pipeline_overflow_cap);
                let last_words = TraceEvent {
                    timestamp: now_millis(),
                    session_id: self.session_id.clone(),
                    correlation_id: crate::events::generate_correlation_id(),
                    payload: EventPayload::Error {
                        code: ErrorCode::LogWriteFailed,
                        message: "log append failing persistently, session marked failed".into(),
                        context: Some(error.to_string()),
                    },
                };
                if let Ok(line) = serde_json::to_string(&last_words) {
                    self.backlog.push(line);
                }
            }
        }
    }

    async fn append_with_retry(&mut self, lines: &[String]) -> std::io::Result<()> {
        let mut delay = Duration::from_millis(50);
        let attempts = self.config.append_retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.log.append_batch(lines) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        "append attempt {}/{} failed: {e}",
                        attempt + 1,
                        attempts
                    );
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| std::io::Error::other("append failed")))
    }
}
