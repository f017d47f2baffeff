// CLI surface - flags, environment, and the child command line
//
// Invocation: agent-trace [options] [--] <command> [args...]
// Everything after the options (or after `--`) is the agent invocation,
// forwarded untouched. Flags override environment, environment overrides
// defaults.

use crate::config::{Config, Verbosity, VERSION};
use clap::Parser;
use std::path::PathBuf;

/// Record and replay-browse everything an AI coding agent does on the wire.
#[derive(Debug, Parser)]
#[command(name = "agent-trace")]
#[command(version = VERSION)]
#[command(about = "Session capture proxy for AI coding agents", long_about = None)]
pub struct Cli {
    /// Root output directory for session logs and the index
    #[arg(long, value_name = "PATH")]
    pub trace_dir: Option<PathBuf>,

    /// Capture non-AI requests with bodies too
    #[arg(long = "include-all", alias = "include-all-requests")]
    pub include_all: bool,

    /// Per-direction body capture cap in bytes
    #[arg(long, value_name = "BYTES")]
    pub max_body_size: Option<usize>,

    /// Human label for this session
    #[arg(long, value_name = "NAME")]
    pub session_name: Option<String>,

    /// Reuse this session id instead of generating one
    #[arg(long = "session", value_name = "ID")]
    pub session_id: Option<String>,

    /// Tag the session (repeatable)
    #[arg(long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,

    /// Invoke the HTML renderer after the session ends (default)
    #[arg(long)]
    pub generate_html: bool,

    /// Skip the HTML renderer
    #[arg(long, conflicts_with = "generate_html")]
    pub no_generate_html: bool,

    /// Open the generated HTML when the session ends
    #[arg(long)]
    pub open: bool,

    /// Per-event diagnostics on stderr
    #[arg(long)]
    pub debug: bool,

    /// More progress output
    #[arg(long, conflicts_with = "debug")]
    pub verbose: bool,

    /// No tracing output at all
    #[arg(long, conflicts_with_all = ["debug", "verbose"])]
    pub quiet: bool,

    /// The agent command to run under capture
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Cli {
    /// Merge defaults <- environment <- flags into the immutable config,
    /// and split off the child command line.
    pub fn into_config(self) -> (Config, Vec<String>) {
        let mut config = Config::default();
        config.apply_env();

        if let Some(trace_dir) = self.trace_dir {
            config.trace_dir = trace_dir;
        }
        if self.include_all {
            config.capture_all_requests = true;
        }
        if let Some(max_body_size) = self.max_body_size {
            config.max_body_size = max_body_size;
        }
        config.session_name = self.session_name;
        config.session_id = self.session_id;
        config.tags = self.tags;
        if self.generate_html {
            config.generate_html = true;
        }
        if self.no_generate_html {
            config.generate_html = false;
        }
        config.open_html = self.open;
        config.verbosity = if self.quiet {
            Verbosity::Quiet
        } else if self.debug {
            Verbosity::Debug
        } else if self.verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        };

        // A pricing table dropped into the trace dir rides along
        let local_pricing = config.trace_dir.join("pricing.toml");
        if local_pricing.exists() {
            config.pricing_paths.push(local_pricing);
        }

        (config, self.command)
    }
}

/// The tracing filter for a verbosity level; RUST_LOG still wins.
pub fn log_filter(verbosity: Verbosity) -> String {
    match verbosity {
        Verbosity::Quiet => "off".into(),
        Verbosity::Normal => "agent_trace=warn".into(),
        Verbosity::Verbose => "agent_trace=info".into(),
        Verbosity::Debug => "agent_trace=debug".into(),
    }
}
