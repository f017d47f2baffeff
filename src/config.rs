// Configuration for the capture engine
//
// All bounds, patterns, and paths are read once at startup into an immutable
// Config value threaded through components by reference. Precedence:
// CLI flags > environment variables > built-in defaults.

use crate::error::TraceError;
use serde::Serialize;
use std::path::PathBuf;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Marker substituted for every redacted value.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Environment variable carrying the session id into the child.
pub const ENV_SESSION_ID: &str = "AGENT_TRACE_SESSION_ID";
/// Environment variable exposing the telemetry socket path to the child.
pub const ENV_TELEMETRY: &str = "AGENT_TRACE_TELEMETRY";
/// Honored from our own environment: trace directory override.
pub const ENV_TRACE_DIR: &str = "AGENT_TRACE_DIR";
/// Honored from our own environment: disable tracing entirely.
pub const ENV_DISABLE: &str = "AGENT_TRACE_DISABLE";
/// Honored from our own environment: HTML renderer executable override.
pub const ENV_RENDERER: &str = "AGENT_TRACE_RENDERER";

/// Output verbosity, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
    Debug,
}

/// Immutable application configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Root output directory for sessions and the index
    pub trace_dir: PathBuf,

    /// Capture non-AI requests with bodies too (otherwise headers only)
    pub capture_all_requests: bool,

    /// Per-direction body capture cap in bytes
    pub max_body_size: usize,

    /// Human label for the session
    pub session_name: Option<String>,

    /// Reuse a caller-supplied session id instead of generating one
    pub session_id: Option<String>,

    /// User-supplied session tags
    pub tags: Vec<String>,

    /// Invoke the HTML renderer after finalize
    pub generate_html: bool,

    /// Open the generated HTML in the platform opener
    pub open_html: bool,

    pub verbosity: Verbosity,

    pub capture_request_bodies: bool,
    pub capture_response_bodies: bool,

    /// Header names whose values are replaced by the redaction marker
    pub sensitive_header_names: Vec<String>,

    /// Regex sources matched against captured bodies; matches are replaced
    pub sensitive_body_patterns: Vec<String>,

    /// Upstream request timeout
    pub upstream_timeout_ms: u64,

    /// Idle CONNECT tunnel timeout
    pub idle_tunnel_timeout_ms: u64,

    /// Fixed proxy port; 0 lets the OS choose
    pub proxy_port: u16,

    /// Per-host leaf certificate cache size
    pub leaf_cache_size: usize,

    /// Pin upstream hosts to fixed socket addresses, bypassing DNS.
    /// Used for offline runs and mock upstreams in the test harness.
    pub resolve_overrides: Vec<(String, std::net::SocketAddr)>,

    // Pipeline tuning
    pub pipeline_queue_size: usize,
    pub dedupe_window_ms: u64,
    pub dedupe_lru_size: usize,
    pub order_window_ms: u64,
    pub batch_max_events: usize,
    pub append_retry_attempts: u32,
    /// Events held in memory after append gives up, before the session fails
    pub pipeline_overflow_cap: usize,

    /// Shutdown drain budget for the proxy
    pub grace_ms: u64,

    /// Extra pricing table files merged over the bundled one, in order
    pub pricing_paths: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trace_dir: PathBuf::from("./.trace"),
            capture_all_requests: false,
            max_body_size: 1_048_576,
            session_name: None,
            session_id: None,
            tags: Vec::new(),
            generate_html: true,
            open_html: false,
            verbosity: Verbosity::Normal,
            capture_request_bodies: true,
            capture_response_bodies: true,
            sensitive_header_names: default_sensitive_headers(),
            sensitive_body_patterns: default_body_patterns(),
            upstream_timeout_ms: 300_000,
            idle_tunnel_timeout_ms: 120_000,
            proxy_port: 0,
            leaf_cache_size: 64,
            resolve_overrides: Vec::new(),
            pipeline_queue_size: 1024,
            dedupe_window_ms: 2_000,
            dedupe_lru_size: 1024,
            order_window_ms: 100,
            batch_max_events: 64,
            append_retry_attempts: 3,
            pipeline_overflow_cap: 4096,
            grace_ms: 5_000,
            pricing_paths: Vec::new(),
        }
    }
}

/// Header names redacted by default. Matching is case-insensitive.
fn default_sensitive_headers() -> Vec<String> {
    [
        "authorization",
        "proxy-authorization",
        "x-api-key",
        "api-key",
        "x-auth-token",
        "x-goog-api-key",
        "cookie",
        "set-cookie",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Body patterns redacted by default: common API key shapes.
fn default_body_patterns() -> Vec<String> {
    [
        r"sk-[A-Za-z0-9_-]{16,}",
        r"(?i)bearer\s+[A-Za-z0-9._~+/-]{16,}=*",
        r"ghp_[A-Za-z0-9]{36}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
    /// Apply overrides honored from our own environment.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(ENV_TRACE_DIR) {
            if !dir.is_empty() {
                self.trace_dir = PathBuf::from(dir);
            }
        }
    }

    /// True when `AGENT_TRACE_DISABLE` asks us to run the child untraced.
    pub fn tracing_disabled() -> bool {
        matches!(
            std::env::var(ENV_DISABLE).as_deref(),
            Ok("1") | Ok("true") | Ok("yes")
        )
    }

    /// Validate user-facing bounds; bad values reject at startup with a
    /// human message (ConfigInvalid).
    pub fn validate(&self) -> Result<(), TraceError> {
        if self.max_body_size == 0 {
            return Err(TraceError::ConfigInvalid(
                "--max-body-size must be at least 1 byte".into(),
            ));
        }
        if self.pipeline_queue_size == 0 {
            return Err(TraceError::ConfigInvalid(
                "pipeline queue size must be non-zero".into(),
            ));
        }
        if self.dedupe_lru_size == 0 {
            return Err(TraceError::ConfigInvalid(
                "dedupe LRU size must be non-zero".into(),
            ));
        }
        if let Some(id) = &self.session_id {
            if id.is_empty()
                || !id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(TraceError::ConfigInvalid(format!(
                    "--session id `{id}` must be non-empty and URL-safe \
                     (alphanumeric, `-`, `_`)"
                )));
            }
        }
        for pattern in &self.sensitive_body_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(TraceError::ConfigInvalid(format!(
                    "bad sensitive body pattern `{pattern}`: {e}"
                )));
            }
        }
        Ok(())
    }

    /// JSON snapshot recorded in `session_start.config_snapshot`.
    ///
    /// Configuration holds no secrets (patterns and header names are not
    /// sensitive themselves), so the snapshot is the whole value plus the
    /// tokenizer identity used for approximate counting.
    pub fn snapshot(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "tokenizer".to_string(),
                serde_json::Value::String(crate::tokens::TOKENIZER_ID.to_string()),
            );
            obj.insert(
                "version".to_string(),
                serde_json::Value::String(VERSION.to_string()),
            );
        }
        value
    }
}
