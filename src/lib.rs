// agent-trace - session capture proxy for AI coding agents
//
// This crate wraps an unmodified agent binary, routes its outbound HTTP(S)
// traffic through an in-process interception proxy, and records every
// exchange as a structured, append-only JSONL event log.
//
// Architecture:
// - Supervisor: owns the session lifecycle, spawns the agent child process
// - Proxy engine (hyper + rustls): terminates CONNECT tunnels with a
//   session CA, captures request/response bodies, emits events
// - Event pipeline: validate -> redact -> dedupe -> correlate -> order -> append
// - File store: session directories, JSONL log with fsync, atomic index
// - Classifier + pricing: recognize AI providers, account tokens and cost

pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod pricing;
pub mod proxy;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod tokens;
pub mod util;
