//! Task data model (§3): identity, state, progress, and the scheduling key
//! used to order the priority queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

pub type TaskId = i64;

/// The only states a task may be in; transitions between them are validated
/// by `TaskState::can_transition_to` rather than left to caller discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Starting,
    Downloading,
    Paused,
    RetryWait,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Starting => "STARTING",
            TaskState::Downloading => "DOWNLOADING",
            TaskState::Paused => "PAUSED",
            TaskState::RetryWait => "RETRY_WAIT",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }

    /// Whether `self -> to` is one of the permitted transitions in §4.6's table.
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        match (self, to) {
            (Pending, Starting) => true,
            (Starting, Downloading) => true,
            (Downloading, Completed) => true,
            (Downloading, Failed) => true,
            (Downloading, RetryWait) => true,
            (RetryWait, Pending) => true,
            (Paused, Pending) => true,
            (Pending | Starting | Downloading | RetryWait, Paused) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskProgress {
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub throughput_bps: f64,
}

/// A queued or in-flight download. The queue exclusively owns tasks; the
/// executor (the coordinator, C4) receives a handle and reports progress and
/// terminal outcome back through the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub url: String,
    pub destination: PathBuf,
    /// 1-10, higher is sooner.
    pub priority: u8,
    /// priority + accumulated aging bonus, capped at 10.
    pub effective_priority: u8,
    pub created_at_wall: DateTime<Utc>,
    pub updated_at_wall: DateTime<Utc>,
    /// When the task most recently entered PENDING; drives priority aging.
    pub pending_since: Option<DateTime<Utc>>,
    /// Monotonically increasing insertion sequence, used only to break ties
    /// when two tasks share a `created_at_wall` value (clock resolution).
    pub seq: u64,
    pub state: TaskState,
    pub progress: TaskProgress,
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// Normalized host (scheme + lowercase hostname, no port); see §6.3.
    pub host: String,
    pub last_error: Option<String>,
    /// Opaque type-specific options passed through to the handler.
    pub options: HashMap<String, String>,
    pub resume_state_ref: Option<PathBuf>,
}

/// The ordering key the scheduler sorts on: effective priority descending,
/// then creation order ascending (strict FIFO tiebreak). Implements `Ord` so
/// that a max-`BinaryHeap<SchedulingKey>` pops the next-runnable task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingKey {
    pub effective_priority: u8,
    pub created_at_wall: DateTime<Utc>,
    pub seq: u64,
    pub task_id: TaskId,
}

impl Task {
    pub fn scheduling_key(&self) -> SchedulingKey {
        SchedulingKey {
            effective_priority: self.effective_priority,
            created_at_wall: self.created_at_wall,
            seq: self.seq,
            task_id: self.id,
        }
    }
}

impl PartialOrd for SchedulingKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SchedulingKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.effective_priority
            .cmp(&other.effective_priority)
            // Earlier created_at sorts "greater" so it pops first from a max-heap.
            .then_with(|| other.created_at_wall.cmp(&self.created_at_wall))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
