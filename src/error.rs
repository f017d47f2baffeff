// Error taxonomy - stable codes that surface in `error` events and in
// process exit messages.
//
// The proxy and pipeline recover locally where possible and emit `error`
// events carrying one of these codes; only startup and finalization
// failures reach the user as process errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes carried by `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    ProxyBindError,
    TlsTerminationFailed,
    UpstreamConnectFailed,
    BodyTruncated,
    EventBufferOverflow,
    PipelineOverflow,
    LogWriteFailed,
    ChildSpawnFailed,
    PathEscape,
    ConfigInvalid,
    EventInvalid,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ProxyBindError => "ProxyBindError",
            ErrorCode::TlsTerminationFailed => "TlsTerminationFailed",
            ErrorCode::UpstreamConnectFailed => "UpstreamConnectFailed",
            ErrorCode::BodyTruncated => "BodyTruncated",
            ErrorCode::EventBufferOverflow => "EventBufferOverflow",
            ErrorCode::PipelineOverflow => "PipelineOverflow",
            ErrorCode::LogWriteFailed => "LogWriteFailed",
            ErrorCode::ChildSpawnFailed => "ChildSpawnFailed",
            ErrorCode::PathEscape => "PathEscape",
            ErrorCode::ConfigInvalid => "ConfigInvalid",
            ErrorCode::EventInvalid => "EventInvalid",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failures for the capture engine.
///
/// Startup failures (bind, spawn, config) abort the run with exit code 2;
/// everything else is recovered locally and reported as an `error` event.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("cannot bind proxy on {addr}: {source}")]
    ProxyBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS termination failed for {host}: {reason}")]
    TlsTermination { host: String, reason: String },

    #[error("upstream connection failed for {url}: {reason}")]
    UpstreamConnect { url: String, reason: String },

    #[error("event log write failed: {0}")]
    LogWrite(#[source] std::io::Error),

    #[error("cannot start agent `{command}`: {source}")]
    ChildSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("path `{path}` escapes the trace root")]
    PathEscape { path: String },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl TraceError {
    /// The stable code that represents this failure in the event log.
    pub fn code(&self) -> ErrorCode {
        match self {
            TraceError::ProxyBind { .. } => ErrorCode::ProxyBindError,
            TraceError::TlsTermination { .. } => ErrorCode::TlsTerminationFailed,
            TraceError::UpstreamConnect { .. } => ErrorCode::UpstreamConnectFailed,
            TraceError::LogWrite(_) => ErrorCode::LogWriteFailed,
            TraceError::ChildSpawn { .. } => ErrorCode::ChildSpawnFailed,
            TraceError::PathEscape { .. } => ErrorCode::PathEscape,
            TraceError::ConfigInvalid(_) => ErrorCode::ConfigInvalid,
        }
    }
}
