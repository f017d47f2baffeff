// agent-trace - session capture proxy for AI coding agents
//
// Launches an unmodified agent binary with its HTTP(S) traffic routed
// through an in-process interception proxy, and writes a causally-linked
// JSONL event log per session. The process exit code is always the child's;
// only a tracing failure that prevents startup exits 2.

use agent_trace::cli::{log_filter, Cli};
use agent_trace::config::Verbosity;
use agent_trace::supervisor;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

// The proxy serves all connections on one cooperative scheduler; only the
// agent itself runs in another OS process
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (config, command) = cli.into_config();

    // RUST_LOG wins over the verbosity flags; diagnostics go to stderr so
    // the child's stdout stays clean even when shared
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| log_filter(config.verbosity).into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = config.validate() {
        print_fatal(&config.verbosity, &e.to_string());
        return ExitCode::from(supervisor::EXIT_TRACE_FAILURE as u8);
    }

    match supervisor::run(config, command).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            print_fatal(&Verbosity::Normal, &format!("{e:#}"));
            ExitCode::from(supervisor::EXIT_TRACE_FAILURE as u8)
        }
    }
}

fn print_fatal(verbosity: &Verbosity, message: &str) {
    if *verbosity != Verbosity::Quiet {
        eprintln!("agent-trace: {message}");
    }
}
