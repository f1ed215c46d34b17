//! SQLite-backed history ledger implementation.

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::time::{SystemTime, UNIX_EPOCH};

use super::types::{HistoryEntry, TerminalState};
use crate::queue::task::TaskId;

/// Handle to the SQLite-backed history ledger.
///
/// The database file is stored under the XDG state directory:
/// `~/.local/state/ddm/history.db` on Debian.
#[derive(Clone)]
pub struct ResumeDb {
    pub(crate) pool: Pool<Sqlite>,
}

impl ResumeDb {
    /// Open (or create) the default history database and run migrations.
    pub async fn open_default() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("ddm")?;
        let state_dir = xdg_dirs.get_state_home();
        let db_path = state_dir.join("history.db");

        tokio::fs::create_dir_all(&state_dir).await?;

        let uri = format!("sqlite://{}", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&uri)
            .await?;

        let db = ResumeDb { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        // Append-only: rows are inserted once, on terminal transition, and
        // never updated or deleted by the engine itself.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                task_id INTEGER PRIMARY KEY,
                url TEXT NOT NULL,
                destination TEXT NOT NULL,
                final_state TEXT NOT NULL,
                bytes_total INTEGER,
                attempts INTEGER NOT NULL,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                terminal_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a task's terminal disposition. Per §3's invariant, each task
    /// appears at most once; a second record for the same `task_id` is
    /// rejected rather than silently overwriting history.
    pub async fn record_terminal(&self, entry: &HistoryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO history (
                task_id, url, destination, final_state, bytes_total,
                attempts, last_error, created_at, terminal_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(entry.task_id)
        .bind(&entry.url)
        .bind(&entry.destination)
        .bind(entry.final_state.as_str())
        .bind(entry.bytes_total.map(|v| v as i64))
        .bind(entry.attempts as i64)
        .bind(&entry.last_error)
        .bind(entry.created_at)
        .bind(entry.terminal_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// List history entries, most recently terminal first.
    pub async fn list_history(&self, limit: i64) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, url, destination, final_state, bytes_total,
                   attempts, last_error, created_at, terminal_at
            FROM history
            ORDER BY terminal_at DESC, task_id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let final_state_str: String = row.get("final_state");
            let Some(final_state) = TerminalState::from_str(&final_state_str) else {
                continue;
            };
            out.push(HistoryEntry {
                task_id: row.get("task_id"),
                url: row.get("url"),
                destination: row.get("destination"),
                final_state,
                bytes_total: row.get::<Option<i64>, _>("bytes_total").map(|v| v as u64),
                attempts: row.get::<i64, _>("attempts") as u32,
                last_error: row.get("last_error"),
                created_at: row.get("created_at"),
                terminal_at: row.get("terminal_at"),
            });
        }

        Ok(out)
    }

    /// Fetch a single task's history entry, if it has terminated.
    pub async fn get_history(&self, task_id: TaskId) -> Result<Option<HistoryEntry>> {
        let row = sqlx::query(
            r#"
            SELECT task_id, url, destination, final_state, bytes_total,
                   attempts, last_error, created_at, terminal_at
            FROM history
            WHERE task_id = ?1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let final_state_str: String = row.get("final_state");
        let Some(final_state) = TerminalState::from_str(&final_state_str) else {
            return Ok(None);
        };

        Ok(Some(HistoryEntry {
            task_id: row.get("task_id"),
            url: row.get("url"),
            destination: row.get("destination"),
            final_state,
            bytes_total: row.get::<Option<i64>, _>("bytes_total").map(|v| v as u64),
            attempts: row.get::<i64, _>("attempts") as u32,
            last_error: row.get("last_error"),
            created_at: row.get("created_at"),
            terminal_at: row.get("terminal_at"),
        }))
    }
}

pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Open an in-memory database for tests (no disk I/O). Used by the engine's
/// own tests and by `resume_db::tests`.
#[cfg(test)]
pub(crate) async fn open_memory() -> Result<ResumeDb> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    let db = ResumeDb { pool };
    db.migrate().await?;
    Ok(db)
}
