//! Queue Persistence (C7, §4.7): durable snapshot of the active task set,
//! written so a CLI invocation (a fresh process, no in-memory queue to
//! inherit) can pick up where the last one left off, and so a long-lived
//! embedder can survive a crash.
//!
//! Atomic write: serialize to a sibling temp file, fsync, rename over the
//! real path, mirroring `resume_store`'s commit pattern. On load, any task
//! still mid-flight when the snapshot was taken (STARTING or DOWNLOADING) is
//! rewritten to PAUSED — nothing resumes a transfer it never saw fail or
//! complete — and any task already in a terminal state is dropped, since the
//! history ledger is its permanent record from here on.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{Task, TaskState};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshotFile {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
}

impl QueueSnapshotFile {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { version: SCHEMA_VERSION, exported_at: Utc::now(), tasks }
    }
}

/// Atomically writes the given tasks to `path`.
pub fn save_queue_state(path: &Path, tasks: &[Task]) -> Result<()> {
    let snapshot = QueueSnapshotFile::new(tasks.to_vec());
    let json = serde_json::to_vec_pretty(&snapshot).context("failed to serialize queue state")?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let tmp_path = sibling_tmp_path(path);
    {
        let mut f = std::fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        f.write_all(&json)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename {} to {}", tmp_path.display(), path.display()))?;
    Ok(())
}

/// Loads the queue state at `path`, applying the crash-recovery rewrite.
/// Returns an empty vec if no file exists yet. A schema-version mismatch is a
/// loud failure rather than a silent discard: unlike a corrupt resume
/// record, losing the active queue silently would surprise the user with
/// downloads that simply vanished.
pub fn load_queue_state(path: &Path) -> Result<Vec<Task>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context(format!("failed to read {}", path.display())),
    };

    let snapshot: QueueSnapshotFile =
        serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))?;

    if snapshot.version != SCHEMA_VERSION {
        anyhow::bail!(
            "queue state at {} has schema version {}, expected {}",
            path.display(),
            snapshot.version,
            SCHEMA_VERSION
        );
    }

    let tasks = snapshot
        .tasks
        .into_iter()
        .filter(|t| !t.state.is_terminal())
        .map(|mut t| {
            if matches!(t.state, TaskState::Starting | TaskState::Downloading) {
                t.state = TaskState::Paused;
                t.pending_since = None;
            }
            t
        })
        .collect();
    Ok(tasks)
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let mut o = path.as_os_str().to_owned();
    o.push(".tmp");
    PathBuf::from(o)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn task(id: i64, state: TaskState) -> Task {
        let now = Utc::now();
        Task {
            id,
            url: "https://example.com/a".into(),
            destination: PathBuf::from("/tmp/a"),
            priority: 5,
            effective_priority: 5,
            created_at_wall: now,
            updated_at_wall: now,
            pending_since: Some(now),
            seq: id as u64,
            state,
            progress: Default::default(),
            attempt: 0,
            max_attempts: 3,
            next_eligible_at: None,
            host: "example.com".into(),
            last_error: None,
            options: HashMap::new(),
            resume_state_ref: None,
        }
    }

    #[test]
    fn save_then_load_roundtrips_nonterminal_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue_state.json");
        let tasks = vec![task(1, TaskState::Pending), task(2, TaskState::Paused)];
        save_queue_state(&path, &tasks).unwrap();

        let loaded = load_queue_state(&path).unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn load_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(load_queue_state(&path).unwrap().is_empty());
    }

    #[test]
    fn load_rewrites_inflight_tasks_to_paused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue_state.json");
        let tasks = vec![task(1, TaskState::Starting), task(2, TaskState::Downloading)];
        save_queue_state(&path, &tasks).unwrap();

        let loaded = load_queue_state(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|t| t.state == TaskState::Paused));
    }

    #[test]
    fn load_drops_terminal_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue_state.json");
        let tasks = vec![
            task(1, TaskState::Completed),
            task(2, TaskState::Failed),
            task(3, TaskState::Cancelled),
            task(4, TaskState::Pending),
        ];
        save_queue_state(&path, &tasks).unwrap();

        let loaded = load_queue_state(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, 4);
    }

    #[test]
    fn schema_mismatch_is_a_loud_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue_state.json");
        let bad = serde_json::json!({
            "version": 999,
            "exported_at": Utc::now().to_rfc3339(),
            "tasks": [],
        });
        std::fs::write(&path, serde_json::to_vec(&bad).unwrap()).unwrap();
        assert!(load_queue_state(&path).is_err());
    }
}
