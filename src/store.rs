// File store - all filesystem I/O behind one facade
//
// Layout under the configured root:
//
//   <trace-dir>/
//     sessions/
//       YYYY-MM-DD_HH-mm-ss_session-<id>.jsonl
//       YYYY-MM-DD_HH-mm-ss_session-<id>.html     (renderer output)
//     index.json                                  (atomic replace)
//     config.json                                 (last merged config)
//
// The event log is append-only; batches are fsynced. The index is replaced
// by temp-file rename so readers never observe a half-written document.

use crate::error::TraceError;
use crate::session::IndexEntry;
use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Facade over the trace directory. Every component that touches disk goes
/// through here; paths resolving outside the root fail with PathEscape.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Prepare the root and `sessions/` directory.
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("sessions"))
            .with_context(|| format!("creating trace directory {}", root.display()))?;
        // Canonicalize after creation so the escape check compares real paths
        let root = root
            .canonicalize()
            .with_context(|| format!("resolving trace directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path under the root, rejecting traversal.
    ///
    /// Only plain path segments are accepted; `..`, absolute paths, and
    /// prefix components all fail with PathEscape before touching disk.
    fn resolve(&self, relative: &str) -> Result<PathBuf, TraceError> {
        let mut normalized = self.root.clone();
        for component in Path::new(relative).components() {
            use std::path::Component;
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(TraceError::PathEscape {
                        path: relative.to_string(),
                    })
                }
            }
        }
        if !normalized.starts_with(&self.root) {
            return Err(TraceError::PathEscape {
                path: relative.to_string(),
            });
        }
        Ok(normalized)
    }

    /// Open (create or append) the event log for a session.
    pub fn open_session_log(&self, file_stem: &str) -> Result<SessionLog> {
        let path = self
            .resolve(&format!("sessions/{file_stem}.jsonl"))
            .context("session log path")?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening session log {}", path.display()))?;
        Ok(SessionLog { file, path })
    }

    /// Path the HTML renderer is expected to produce for a session.
    pub fn html_path(&self, file_stem: &str) -> PathBuf {
        self.root.join("sessions").join(format!("{file_stem}.html"))
    }

    /// Path where the session CA certificate is published for the child.
    pub fn ca_cert_path(&self, file_stem: &str) -> PathBuf {
        self.root
            .join("sessions")
            .join(format!("{file_stem}.ca.pem"))
    }

    /// Path of the telemetry socket for a session.
    pub fn telemetry_socket_path(&self, file_stem: &str) -> PathBuf {
        self.root
            .join("sessions")
            .join(format!("{file_stem}.telemetry.sock"))
    }

    /// Read the current index, tolerating absence.
    pub fn read_index(&self) -> Vec<IndexEntry> {
        let path = self.root.join("index.json");
        match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("index.json is malformed ({}), starting fresh", e);
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }

    /// Insert or replace one session's entry and atomically swap the index.
    pub fn update_index(&self, entry: IndexEntry) -> Result<()> {
        let mut entries = self.read_index();
        match entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        let serialized =
            serde_json::to_string_pretty(&entries).context("serializing session index")?;
        self.replace_file("index.json", serialized.as_bytes())
    }

    /// Persist the merged config snapshot next to the index.
    pub fn write_config_snapshot(&self, snapshot: &serde_json::Value) -> Result<()> {
        let serialized =
            serde_json::to_string_pretty(snapshot).context("serializing config snapshot")?;
        self.replace_file("config.json", serialized.as_bytes())
    }

    /// Write-temp + rename so readers never see partial content.
    fn replace_file(&self, name: &str, contents: &[u8]) -> Result<()> {
        let final_path = self.resolve(name).context("store path")?;
        let temp_path = self.root.join(format!(".{name}.tmp"));
        {
            let mut temp = File::create(&temp_path)
                .with_context(|| format!("creating {}", temp_path.display()))?;
            temp.write_all(contents).context("writing temp file")?;
            temp.sync_data().context("syncing temp file")?;
        }
        fs::rename(&temp_path, &final_path)
            .with_context(|| format!("replacing {}", final_path.display()))?;
        Ok(())
    }
}

/// Append handle for one session's JSONL log, owned by the pipeline.
#[derive(Debug)]
pub struct SessionLog {
    file: File,
    path: PathBuf,
}

impl SessionLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one batch of serialized events and fsync once at the batch
    /// boundary.
    pub fn append_batch(&mut self, lines: &[String]) -> std::io::Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut buffer = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            buffer.push_str(line);
            buffer.push('\n');
        }
        self.file.write_all(buffer.as_bytes())?;
        self.file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionStatus;

    fn entry(id: &str) -> IndexEntry {
        IndexEntry {
            id: id.into(),
            name: None,
            started_at: "2025-06-12T09:15:00Z".into(),
            ended_at: None,
            status: SessionStatus::Completed,
            total_requests: 1,
            total_cost: None,
            currency: None,
            tags: vec![],
        }
    }

    #[test]
    fn test_create_makes_sessions_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(dir.path()).unwrap();
        assert!(store.root().join("sessions").is_dir());
    }

    #[test]
    fn test_append_batch_writes_newline_terminated_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(dir.path()).unwrap();
        let mut log = store.open_session_log("2025-06-12_09-15-00_session-x").unwrap();

        log.append_batch(&["{\"a\":1}".into(), "{\"b\":2}".into()])
            .unwrap();
        log.append_batch(&["{\"c\":3}".into()]).unwrap();

        let contents = fs::read_to_string(log.path()).unwrap();
        assert_eq!(contents, "{\"a\":1}\n{\"b\":2}\n{\"c\":3}\n");
    }

    #[test]
    fn test_index_update_is_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(dir.path()).unwrap();

        store.update_index(entry("one")).unwrap();
        store.update_index(entry("two")).unwrap();
        let mut updated = entry("one");
        updated.total_requests = 9;
        store.update_index(updated).unwrap();

        let index = store.read_index();
        assert_eq!(index.len(), 2);
        assert_eq!(index.iter().find(|e| e.id == "one").unwrap().total_requests, 9);
    }

    #[test]
    fn test_index_replace_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(dir.path()).unwrap();
        store.update_index(entry("one")).unwrap();
        assert!(!store.root().join(".index.json.tmp").exists());
        assert!(store.root().join("index.json").exists());
    }

    #[test]
    fn test_path_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(dir.path()).unwrap();
        let err = store.resolve("../outside.jsonl").unwrap_err();
        assert!(matches!(err, TraceError::PathEscape { .. }));
        let err = store.resolve("/etc/passwd").unwrap_err();
        assert!(matches!(err, TraceError::PathEscape { .. }));
    }

    #[test]
    fn test_malformed_index_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(dir.path()).unwrap();
        fs::write(store.root().join("index.json"), "not json").unwrap();
        assert!(store.read_index().is_empty());
    }
}
