// Agent telemetry channel - tool/file/shell activity reported by the agent
//
// The supervisor listens on a unix socket whose path is handed to the child
// via AGENT_TRACE_TELEMETRY. An agent that knows the protocol connects and
// writes one JSON record per line; each becomes a tool_execution,
// file_operation, or bash_command event and runs through the same pipeline
// as proxy traffic (the deduplicator guards against double capture). An
// agent that never connects costs nothing: these events are only ever
// reported, never synthesized.

use crate::events::EventPayload;
use crate::pipeline::PipelineHandle;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;

/// One line of the telemetry protocol.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TelemetryRecord {
    ToolExecution {
        tool_name: String,
        #[serde(default)]
        input: Option<serde_json::Value>,
        #[serde(default)]
        output: Option<serde_json::Value>,
        #[serde(default)]
        duration_ms: Option<i64>,
        #[serde(default)]
        success: Option<bool>,
    },
    FileOperation {
        operation: String,
        path: String,
        #[serde(default)]
        size_bytes: Option<u64>,
    },
    BashCommand {
        command: String,
        #[serde(default)]
        exit_code: Option<i32>,
        #[serde(default)]
        duration_ms: Option<i64>,
    },
}

impl From<TelemetryRecord> for EventPayload {
    fn from(record: TelemetryRecord) -> Self {
        match record {
            TelemetryRecord::ToolExecution {
                tool_name,
                input,
                output,
                duration_ms,
                success,
            } => EventPayload::ToolExecution {
                tool_name,
                input,
                output,
                duration_ms,
                success,
            },
            TelemetryRecord::FileOperation {
                operation,
                path,
                size_bytes,
            } => EventPayload::FileOperation {
                operation,
                path,
                size_bytes,
            },
            TelemetryRecord::BashCommand {
                command,
                exit_code,
                duration_ms,
            } => EventPayload::BashCommand {
                command,
                exit_code,
                duration_ms,
            },
        }
    }
}

/// Listening channel; dropping it without [`TelemetryChannel::stop`] leaves
/// the socket file behind, so the supervisor stops it during finalize.
pub struct TelemetryChannel {
    path: PathBuf,
    join: JoinHandle<()>,
}

impl TelemetryChannel {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tear the listener down and remove the socket file.
    pub async fn stop(self) {
        self.join.abort();
        let _ = self.join.await;
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Start listening. Returns None on platforms without unix sockets or when
/// binding fails; the session continues without the channel either way.
pub fn start(path: PathBuf, events: PipelineHandle) -> Option<TelemetryChannel> {
    #[cfg(unix)]
    {
        let listener = match tokio::net::UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::debug!("telemetry channel unavailable: {e}");
                return None;
            }
        };
        let join = tokio::spawn(accept_loop(listener, events));
        Some(TelemetryChannel { path, join })
    }
    #[cfg(not(unix))]
    {
        let _ = (path, events);
        None
    }
}

#[cfg(unix)]
async fn accept_loop(listener: tokio::net::UnixListener, events: PipelineHandle) {
    // Readers live in a JoinSet so aborting this task tears them down too;
    // a lingering reader would otherwise hold the pipeline open past finalize
    let mut readers = tokio::task::JoinSet::new();
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                readers.spawn(read_records(stream, events.clone()));
            }
            Err(e) => {
                tracing::debug!("telemetry accept error: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
        while readers.try_join_next().is_some() {}
    }
}

#[cfg(unix)]
async fn read_records(stream: tokio::net::UnixStream, events: PipelineHandle) {
    use tokio::io::AsyncBufReadExt;

    let reader = tokio::io::BufReader::new(stream);
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<TelemetryRecord>(line) {
                    Ok(record) => events.emit_payload(record.into()),
                    Err(e) => tracing::debug!("ignoring malformed telemetry line: {e}"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("telemetry read error: {e}");
                break;
            }
        }
    }
}
