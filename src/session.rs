// Session model - the top-level unit of capture
//
// Created exactly once at supervisor start, mutated only by the supervisor,
// finalized exactly once on exit. Duration math uses a monotonic reference;
// wall-clock timestamps are for display and the log only.

use crate::config::Config;
use crate::events::{SessionStatus, SessionSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Generate a unique, URL-safe session id.
/// Format: YYYYMMDD-HHMMSS-XXXX (timestamp + 4 random hex chars)
pub fn generate_session_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    // RandomState gives us a random value without adding a dependency
    let random = RandomState::new().build_hasher().finish();
    let short_hash = format!("{:04x}", random & 0xFFFF);

    format!("{}-{}", timestamp, short_hash)
}

/// Live session state owned by the supervisor.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub started_at: DateTime<Utc>,
    /// Monotonic reference for duration math
    pub started_mono: Instant,
    pub working_directory: String,
    pub agent_version: String,
    pub status: SessionStatus,
}

impl Session {
    /// Allocate a new session from config (reusing a caller-supplied id when
    /// one was given).
    pub fn create(config: &Config, agent_version: String) -> Self {
        let id = config
            .session_id
            .clone()
            .unwrap_or_else(generate_session_id);
        let working_directory = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| String::from("."));

        Self {
            id,
            name: config.session_name.clone(),
            tags: config.tags.clone(),
            started_at: Utc::now(),
            started_mono: Instant::now(),
            working_directory,
            agent_version,
            status: SessionStatus::Active,
        }
    }

    /// Milliseconds elapsed since session start, monotonic.
    pub fn elapsed_ms(&self) -> i64 {
        self.started_mono.elapsed().as_millis() as i64
    }

    /// The file stem shared by this session's log and HTML output:
    /// `YYYY-MM-DD_HH-mm-ss_session-<id>`.
    pub fn file_stem(&self) -> String {
        format!(
            "{}_session-{}",
            self.started_at.format("%Y-%m-%d_%H-%M-%S"),
            self.id
        )
    }

    /// Build the index entry for this session at finalize time.
    pub fn index_entry(&self, summary: &SessionSummary) -> IndexEntry {
        IndexEntry {
            id: self.id.clone(),
            name: self.name.clone(),
            started_at: self.started_at.to_rfc3339(),
            ended_at: Some(Utc::now().to_rfc3339()),
            status: self.status,
            total_requests: summary.total_requests,
            total_cost: summary.total_cost,
            currency: summary.currency.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// One row of `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    pub status: SessionStatus,
    pub total_requests: u64,
    pub total_cost: Option<f64>,
    pub currency: Option<String>,
    pub tags: Vec<String>,
}
