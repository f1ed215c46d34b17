//! Types for the history ledger.

use crate::queue::task::TaskId;

/// The three terminal states a task can leave the active set in. A narrower
/// type than `queue::task::TaskState` because only terminal transitions are
/// ever written to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Completed,
    Failed,
    Cancelled,
}

impl TerminalState {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalState::Completed => "COMPLETED",
            TerminalState::Failed => "FAILED",
            TerminalState::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "COMPLETED" => Some(TerminalState::Completed),
            "FAILED" => Some(TerminalState::Failed),
            "CANCELLED" => Some(TerminalState::Cancelled),
            _ => None,
        }
    }
}

/// One row of the history ledger: the final disposition of a task, written
/// exactly once, at the moment it leaves the active set.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub task_id: TaskId,
    pub url: String,
    pub destination: String,
    pub final_state: TerminalState,
    pub bytes_total: Option<u64>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub terminal_at: i64,
}
