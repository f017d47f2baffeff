// Session supervisor - owns the lifecycle end to end
//
// created -> starting -> running -> finalizing -> terminated, with an
// aborting branch on signals or unrecoverable failure. The child is not
// spawned until the proxy is ready; the supervisor's exit code is always the
// child's; a tracing failure after startup never changes the agent's
// visible behavior.

use crate::config::{Config, ENV_RENDERER, ENV_SESSION_ID, ENV_TELEMETRY};
use crate::error::TraceError;
use crate::events::{EventPayload, SessionStatus, SessionSummary};
use crate::pipeline::{self, PipelineHandle};
use crate::pricing::PricingTable;
use crate::proxy;
use crate::session::Session;
use crate::store::FileStore;
use crate::telemetry::{self, TelemetryChannel};
use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Exit code when tracing cannot start at all.
pub const EXIT_TRACE_FAILURE: i32 = 2;

/// Window in which a second SIGINT skips the drain.
const SECOND_SIGINT_WINDOW: Duration = Duration::from_secs(2);

/// Run one traced session around `command`. Returns the child's exit code.
pub async fn run(config: Config, command: Vec<String>) -> Result<i32> {
    if command.is_empty() {
        return Err(TraceError::ConfigInvalid(
            "no agent command given; usage: agent-trace [options] -- <command> [args...]".into(),
        )
        .into());
    }
    if Config::tracing_disabled() {
        tracing::debug!("tracing disabled by environment, running child untraced");
        return run_untraced(&command).await;
    }

    let config = Arc::new(config);

    // -- created: identity, directories, frozen config ---------------------
    let store = FileStore::create(&config.trace_dir)?;
    let pricing = Arc::new(PricingTable::load(&config.pricing_paths)?);
    let agent_version = probe_agent_version(&command[0]).await;
    let mut session = Session::create(&config, agent_version);
    let file_stem = session.file_stem();
    tracing::debug!("session {} created", session.id);

    // -- starting: log open, pipeline up, session_start emitted ------------
    let log = store.open_session_log(&file_stem)?;
    let (events, pipeline_join) = pipeline::spawn(config.clone(), log, session.id.clone());

    if let Err(e) = store.write_config_snapshot(&config.snapshot()) {
        tracing::warn!("config snapshot not persisted: {e}");
    }

    let prompt = command.get(1..).unwrap_or_default().join(" ");
    events.emit_payload(EventPayload::SessionStart {
        prompt,
        agent_version: session.agent_version.clone(),
        working_directory: session.working_directory.clone(),
        tags: session.tags.clone(),
        config_snapshot: config.snapshot(),
    });

    let proxy = proxy::start(config.clone(), pricing, events.clone()).await?;
    let proxy_port = proxy.port;

    let ca_path = store.ca_cert_path(&file_stem);
    std::fs::write(&ca_path, &proxy.ca_cert_pem).context("publishing session CA certificate")?;

    let telemetry = telemetry::start(store.telemetry_socket_path(&file_stem), events.clone());

    startup_line(&config, &session, proxy_port, &store, &file_stem);

    // -- running: spawn the child with capture environment ------------------
    let mut child = match spawn_child(&command, proxy_port, &ca_path, &session.id, &telemetry) {
        Ok(child) => child,
        Err(e) => {
            // Finalize the (empty) session, then surface the startup failure
            tracing::error!("{e}");
            session.status = SessionStatus::Failed;
            finalize(
                &config, &store, &session, events, pipeline_join, proxy, telemetry, &file_stem,
            )
            .await;
            return Err(e.into());
        }
    };

    let status = supervise_child(&mut child, &mut session).await;
    session.status = status;

    // -- finalizing ----------------------------------------------------------
    let exit_code = child
        .wait()
        .await
        .map(exit_code_of)
        .unwrap_or(EXIT_TRACE_FAILURE);

    let summary = finalize(
        &config, &store, &session, events, pipeline_join, proxy, telemetry, &file_stem,
    )
    .await;
    summary_line(&config, &session, &summary, &store, &file_stem);

    // -- terminated ----------------------------------------------------------
    Ok(exit_code)
}

/// Plain passthrough for AGENT_TRACE_DISABLE.
async fn run_untraced(command: &[String]) -> Result<i32> {
    let status = Command::new(&command[0])
        .args(&command[1..])
        .status()
        .await
        .map_err(|source| TraceError::ChildSpawn {
            command: command[0].clone(),
            source,
        })?;
    Ok(exit_code_of(status))
}

/// Ask the agent for its version string; silent fallback when it has no
/// --version or takes too long.
async fn probe_agent_version(binary: &str) -> String {
    let probe = Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output();
    match tokio::time::timeout(Duration::from_secs(2), probe).await {
        Ok(Ok(output)) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or("unknown")
            .trim()
            .to_string(),
        _ => "unknown".to_string(),
    }
}

fn spawn_child(
    command: &[String],
    proxy_port: u16,
    ca_path: &Path,
    session_id: &str,
    telemetry: &Option<TelemetryChannel>,
) -> Result<Child, TraceError> {
    let proxy_url = format!("http://127.0.0.1:{proxy_port}");

    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..])
        .env("HTTP_PROXY", &proxy_url)
        .env("HTTPS_PROXY", &proxy_url)
        .env("http_proxy", &proxy_url)
        .env("https_proxy", &proxy_url)
        // CA bundle for whichever runtime the agent is built on
        .env("NODE_EXTRA_CA_CERTS", ca_path)
        .env("SSL_CERT_FILE", ca_path)
        .env("CURL_CA_BUNDLE", ca_path)
        .env("REQUESTS_CA_BUNDLE", ca_path)
        .env(ENV_SESSION_ID, session_id);
    if let Some(channel) = telemetry {
        cmd.env(ENV_TELEMETRY, channel.path());
    }

    cmd.spawn().map_err(|source| TraceError::ChildSpawn {
        command: command[0].clone(),
        source,
    })
}

/// Wait for the child while watching signals. Returns the terminal status
/// the session should record.
async fn supervise_child(child: &mut Child, session: &mut Session) -> SessionStatus {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return wait_only(child).await,
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return wait_only(child).await,
        };

        tokio::select! {
            _ = child.wait() => SessionStatus::Completed,
            _ = sigint.recv() => {
                tracing::debug!("SIGINT received, aborting session {}", session.id);
                // The terminal delivers SIGINT to the child too; give it a
                // moment, a second SIGINT inside the window skips the drain
                tokio::select! {
                    _ = child.wait() => {}
                    _ = sigint.recv() => {
                        tracing::debug!("second SIGINT, exiting without drain");
                        let _ = child.start_kill();
                        std::process::exit(130);
                    }
                    _ = tokio::time::sleep(SECOND_SIGINT_WINDOW) => {
                        let _ = child.start_kill();
                    }
                }
                SessionStatus::Aborted
            }
            _ = sigterm.recv() => {
                tracing::debug!("SIGTERM received, aborting session {}", session.id);
                let _ = child.start_kill();
                SessionStatus::Aborted
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = session;
        wait_only(child).await
    }
}

async fn wait_only(child: &mut Child) -> SessionStatus {
    let _ = child.wait().await;
    SessionStatus::Completed
}

/// Drain, mark, close, index. Never fails the caller; tracing problems stay
/// tracing problems.
#[allow(clippy::too_many_arguments)]
async fn finalize(
    config: &Arc<Config>,
    store: &FileStore,
    session: &Session,
    events: PipelineHandle,
    pipeline_join: tokio::task::JoinHandle<pipeline::PipelineResult>,
    proxy: proxy::ProxyHandle,
    telemetry: Option<TelemetryChannel>,
    file_stem: &str,
) -> SessionSummary {
    if let Some(channel) = telemetry {
        channel.stop().await;
    }
    proxy.stop(Duration::from_millis(config.grace_ms)).await;

    // Everything captured is in the queue now; settle it, then append the
    // end marker as the final line
    let summary = events.flush().await.unwrap_or_default();
    events.emit_payload(EventPayload::SessionEnd {
        duration_ms: session.elapsed_ms(),
        status: session.status,
        summary: summary.clone(),
    });
    drop(events);

    let mut status = session.status;
    match pipeline_join.await {
        Ok(result) if result.failed => {
            tracing::error!("event log degraded, marking session failed");
            status = SessionStatus::Failed;
        }
        Ok(_) => {}
        Err(e) => tracing::error!("pipeline task panicked: {e}"),
    }

    let mut entry = session.index_entry(&summary);
    entry.status = status;
    if let Err(e) = store.update_index(entry) {
        tracing::error!("session index not updated: {e}");
    }

    // CA certificate was only needed while the child ran
    let _ = std::fs::remove_file(store.ca_cert_path(file_stem));

    if config.generate_html {
        render_html(config, store, file_stem).await;
    }

    summary
}

/// Hand the finished log to the external renderer when one is installed.
/// Interface: `<renderer> <log.jsonl> <out.html>`.
async fn render_html(config: &Arc<Config>, store: &FileStore, file_stem: &str) {
    let renderer = std::env::var(ENV_RENDERER).unwrap_or_else(|_| "agent-trace-render".into());
    let log_path = store
        .root()
        .join("sessions")
        .join(format!("{file_stem}.jsonl"));
    let html_path = store.html_path(file_stem);

    let result = Command::new(&renderer)
        .arg(&log_path)
        .arg(&html_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match result {
        Ok(status) if status.success() => {
            tracing::debug!("rendered {}", html_path.display());
            if config.open_html {
                open_in_browser(&html_path);
            }
        }
        Ok(status) => tracing::debug!("renderer exited with {status}"),
        Err(_) => tracing::debug!("no HTML renderer installed ({renderer}), skipping"),
    }
}

fn open_in_browser(path: &Path) {
    #[cfg(target_os = "macos")]
    let opener = "open";
    #[cfg(not(target_os = "macos"))]
    let opener = "xdg-open";

    let _ = std::process::Command::new(opener)
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().unwrap_or_else(|| {
            // Terminated by signal: conventional 128 + signo
            128 + status.signal().unwrap_or(1)
        })
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(1)
    }
}

fn startup_line(
    config: &Config,
    session: &Session,
    port: u16,
    store: &FileStore,
    file_stem: &str,
) {
    if config.verbosity >= crate::config::Verbosity::Normal {
        eprintln!(
            "agent-trace: session {} capturing on 127.0.0.1:{} -> {}",
            session.id,
            port,
            store
                .root()
                .join("sessions")
                .join(format!("{file_stem}.jsonl"))
                .display()
        );
    }
}

fn summary_line(
    config: &Config,
    session: &Session,
    summary: &SessionSummary,
    store: &FileStore,
    file_stem: &str,
) {
    if config.verbosity >= crate::config::Verbosity::Normal {
        let cost = match (&summary.total_cost, &summary.currency) {
            (Some(cost), Some(currency)) => format!("{cost:.4} {currency}"),
            _ => "n/a".into(),
        };
        eprintln!(
            "agent-trace: session {} {}: {} requests ({} ai), tokens {}/{}, cost {} -> {}",
            session.id,
            session.status.as_str(),
            summary.total_requests,
            summary.ai_requests,
            summary.tokens.input,
            summary.tokens.output,
            cost,
            store
                .root()
                .join("sessions")
                .join(format!("{file_stem}.jsonl"))
                .display()
        );
    }
}
