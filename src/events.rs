// Events that flow from the proxy and telemetry channel into the pipeline
//
// Every record in the session log is one of these. The closed `kind` set is
// a tagged enum so validators pattern-match the variant and serializers emit
// the line format directly; schema and code cannot drift apart.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Headers as captured for the log: sorted keys, single string values.
///
/// A BTreeMap keeps serialization order deterministic so re-serializing a
/// parsed log yields field-for-field equal JSON.
pub type Headers = BTreeMap<String, String>;

/// One timestamped record in the session log.
///
/// `timestamp` is wall-clock milliseconds since the Unix epoch, derived from
/// a monotonic reference at capture time so in-session ordering survives
/// clock adjustments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    pub timestamp: i64,
    pub session_id: String,
    pub correlation_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// The closed set of event kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// Session lifecycle: first event in every log.
    SessionStart {
        prompt: String,
        agent_version: String,
        working_directory: String,
        tags: Vec<String>,
        config_snapshot: serde_json::Value,
    },

    /// Session lifecycle: last event when the session terminates cleanly.
    SessionEnd {
        duration_ms: i64,
        status: SessionStatus,
        summary: SessionSummary,
    },

    /// A plain HTTP exchange not classified as AI.
    HttpRequest {
        #[serde(flatten)]
        request: RequestRecord,
    },

    HttpResponse {
        #[serde(flatten)]
        response: ResponseRecord,
    },

    /// An exchange with a recognized AI provider.
    AiRequest {
        provider: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        /// First 16 hex chars of SHA-256 of the API key header, if present.
        /// The key itself never reaches the log.
        #[serde(skip_serializing_if = "Option::is_none")]
        api_key_hash: Option<String>,
        #[serde(flatten)]
        request: RequestRecord,
    },

    AiResponse {
        provider: String,
        model: String,
        usage: TokenUsage,
        /// Null when the pricing table has no (provider, model) entry.
        cost: Option<CostRecord>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rate_limit: Option<RateLimitInfo>,
        #[serde(flatten)]
        response: ResponseRecord,
    },

    /// A CONNECT tunnel the proxy could not terminate; metadata only.
    HttpsConnect {
        host: String,
        port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    WsConnection {
        url: String,
        state: WsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<i64>,
    },

    WsMessage {
        direction: WsDirection,
        size_bytes: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body_truncated: Option<bool>,
    },

    /// Reported by the agent's telemetry channel; never synthesized.
    ToolExecution {
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        success: Option<bool>,
    },

    FileOperation {
        operation: String,
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        size_bytes: Option<u64>,
    },

    BashCommand {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<i64>,
    },

    /// Captured internal error; never fatal to the session.
    Error {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
}

impl EventPayload {
    /// The `kind` tag this payload serializes under.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::SessionStart { .. } => "session_start",
            EventPayload::SessionEnd { .. } => "session_end",
            EventPayload::HttpRequest { .. } => "http_request",
            EventPayload::HttpResponse { .. } => "http_response",
            EventPayload::AiRequest { .. } => "ai_request",
            EventPayload::AiResponse { .. } => "ai_response",
            EventPayload::HttpsConnect { .. } => "https_connect",
            EventPayload::WsConnection { .. } => "ws_connection",
            EventPayload::WsMessage { .. } => "ws_message",
            EventPayload::ToolExecution { .. } => "tool_execution",
            EventPayload::FileOperation { .. } => "file_operation",
            EventPayload::BashCommand { .. } => "bash_command",
            EventPayload::Error { .. } => "error",
        }
    }

    /// True for the request-shaped kinds the deduplicator fingerprints.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            EventPayload::HttpRequest { .. } | EventPayload::AiRequest { .. }
        )
    }
}

/// Shared request fields for `http_request` / `ai_request`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_original_size: Option<u64>,
}

/// Shared response fields for `http_response` / `ai_response`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_correlation_id: Option<String>,
    pub status: u16,
    pub headers: Headers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_original_size: Option<u64>,
    /// Set when the stream ended before the declared body completed
    /// (client disconnect, upstream reset, forced shutdown).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminal status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Aborted => "aborted",
        }
    }
}

/// WebSocket connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WsState {
    Connecting,
    Open,
    Closed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WsDirection {
    Sent,
    Received,
}

/// How the token figures were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenMethod {
    /// Parsed from the provider's usage field in the response body.
    Exact,
    /// Computed by the local deterministic estimator.
    Approximate,
    /// ceil(chars / 4) heuristic, used when nothing better is available.
    Fallback,
}

/// Token usage for one AI exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub method: TokenMethod,
    // Prompt caching figures, when the provider reports them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64, method: TokenMethod) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
            method,
            cache_creation_tokens: None,
            cache_read_tokens: None,
        }
    }
}

/// Monetary cost for one AI exchange. All figures rounded to 5 decimals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostRecord {
    pub input: f64,
    pub output: f64,
    pub total: f64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/// Rate limit figures parsed from provider response headers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RateLimitInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_limit: Option<u64>,
}

impl RateLimitInfo {
    pub fn is_empty(&self) -> bool {
        self.requests_remaining.is_none()
            && self.requests_limit.is_none()
            && self.tokens_remaining.is_none()
            && self.tokens_limit.is_none()
    }
}

/// Per-session totals for `session_end.summary` and the session index.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub total_requests: u64,
    pub ai_requests: u64,
    pub file_ops: u64,
    pub total_cost: Option<f64>,
    pub tokens: TokenTotals,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
}

impl SessionSummary {
    /// Fold one appended event into the running totals.
    ///
    /// First pass of the two-phase metric calculation: base per-exchange
    /// figures come from the events themselves; nothing here re-reads
    /// earlier summary state.
    pub fn record(&mut self, event: &TraceEvent) {
        match &event.payload {
            EventPayload::HttpRequest { .. } => {
                self.total_requests += 1;
            }
            EventPayload::AiRequest { .. } => {
                self.total_requests += 1;
                self.ai_requests += 1;
            }
            EventPayload::FileOperation { .. } => {
                self.file_ops += 1;
            }
            EventPayload::AiResponse { usage, cost, .. } => {
                self.tokens.input += usage.input_tokens;
                self.tokens.output += usage.output_tokens;
                if let Some(cost) = cost {
                    *self.total_cost.get_or_insert(0.0) += cost.total;
                    if self.currency.is_none() {
                        self.currency = Some(cost.currency.clone());
                    }
                }
            }
            _ => {}
        }
    }
}

/// Generate a unique correlation id: millisecond timestamp plus a process
/// counter, so ids are sortable and never collide within a run.
pub fn generate_correlation_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let count = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}-{}", crate::util::now_millis(), count)
}
