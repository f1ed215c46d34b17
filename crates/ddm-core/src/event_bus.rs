//! Thread-safe publish/subscribe event bus with a validated snapshot
//! contract (C8).
//!
//! Subscribers register a handler closure; emission clones the current
//! subscriber list before calling out so a handler that panics, or that adds
//! or removes a subscription from inside its own callback, cannot corrupt
//! the bus or affect any other subscriber.

use crate::queue::task::{Task, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Validated, publishable view of a task. Field names and set are exactly
/// the required keys of the event schema; serializing this type always
/// produces a value `validate_snapshot` accepts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub state: String,
    pub priority: u8,
    pub effective_priority: u8,
    pub host: String,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub throughput_bps: f64,
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_eligible_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub fn build_task_snapshot(task: &Task) -> TaskSnapshot {
    TaskSnapshot {
        task_id: task.id,
        state: task.state.as_str().to_string(),
        priority: task.priority,
        effective_priority: task.effective_priority,
        host: task.host.clone(),
        bytes_downloaded: task.progress.bytes_downloaded,
        bytes_total: task.progress.bytes_total,
        throughput_bps: task.progress.throughput_bps,
        attempt: task.attempt,
        max_attempts: task.max_attempts,
        next_eligible_at: task.next_eligible_at.map(|t| t.to_rfc3339()),
        last_error: task.last_error.clone(),
        created_at: task.created_at_wall.to_rfc3339(),
        updated_at: task.updated_at_wall.to_rfc3339(),
    }
}

const REQUIRED_KEYS: &[&str] = &[
    "task_id",
    "state",
    "priority",
    "effective_priority",
    "host",
    "bytes_downloaded",
    "bytes_total",
    "throughput_bps",
    "attempt",
    "max_attempts",
    "next_eligible_at",
    "last_error",
    "created_at",
    "updated_at",
];

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("missing required key: {0}")]
    MissingKey(&'static str),
    #[error("key {0} has unexpected type")]
    WrongType(&'static str),
    #[error("snapshot is not a JSON object")]
    NotAnObject,
}

/// Check that `value` has every required key of the task snapshot schema
/// with the expected semantic type. Invalid snapshots must never reach a
/// subscriber.
pub fn validate_snapshot(value: &Value) -> Result<(), SnapshotError> {
    let obj = value.as_object().ok_or(SnapshotError::NotAnObject)?;
    for key in REQUIRED_KEYS {
        let v = obj.get(*key).ok_or(SnapshotError::MissingKey(key))?;
        let ok = match *key {
            "task_id" | "priority" | "effective_priority" | "bytes_downloaded"
            | "bytes_total" | "attempt" | "max_attempts" => v.is_u64() || v.is_i64(),
            "throughput_bps" => v.is_number(),
            "state" | "host" | "created_at" | "updated_at" => v.is_string(),
            "next_eligible_at" | "last_error" => v.is_string() || v.is_null(),
            _ => true,
        };
        if !ok {
            return Err(SnapshotError::WrongType(key));
        }
    }
    Ok(())
}

/// A validated, publishable view of queue-wide status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueStatusSnapshot {
    pub active_downloads: usize,
    pub pending: usize,
    pub retry_wait: usize,
    pub paused: usize,
}

#[derive(Debug, Clone)]
pub enum Event {
    TaskAdded(TaskSnapshot),
    TaskUpdated(TaskSnapshot),
    QueueStatus(QueueStatusSnapshot),
}

/// Whether a `TASK_UPDATED` event is a state transition (always delivered)
/// or a progress tick (subject to per-task throttling).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Transition,
    Progress,
}

type Handler = dyn Fn(&Event) + Send + Sync;

struct Subscription {
    id: u64,
    handler: Arc<Handler>,
}

/// Thread-safe topic bus for `TASK_ADDED`, `TASK_UPDATED`, `QUEUE_STATUS`.
pub struct EventBus {
    subscribers: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    progress_throttle: Duration,
    last_progress_emit: Mutex<HashMap<TaskId, Instant>>,
}

pub struct SubscriptionId(u64);

impl EventBus {
    pub fn new(progress_throttle: Duration) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            progress_throttle,
            last_progress_emit: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler. Safe to call from inside another handler's
    /// callback (emission works off a snapshot of the subscriber list).
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().unwrap().push(Subscription {
            id,
            handler: Arc::new(handler),
        });
        SubscriptionId(id)
    }

    /// Safe to call from inside a handler's own callback.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().unwrap().retain(|s| s.id != id.0);
    }

    fn deliver(&self, event: Event) {
        let handlers: Vec<Arc<Handler>> = self
            .subscribers
            .read()
            .unwrap()
            .iter()
            .map(|s| Arc::clone(&s.handler))
            .collect();
        for h in handlers {
            // A subscriber's handler must not be able to take down the
            // emitter or any other subscriber.
            let _ = catch_unwind(AssertUnwindSafe(|| h(&event)));
        }
    }

    pub fn emit_task_added(&self, snapshot: TaskSnapshot) {
        self.deliver(Event::TaskAdded(snapshot));
    }

    /// Emit a `TASK_UPDATED` event. Transitions are always delivered;
    /// progress ticks are throttled to at most one per `progress_throttle`
    /// per task.
    pub fn emit_task_updated(&self, snapshot: TaskSnapshot, kind: UpdateKind) {
        if kind == UpdateKind::Progress {
            let now = Instant::now();
            let mut last = self.last_progress_emit.lock().unwrap();
            if let Some(prev) = last.get(&snapshot.task_id) {
                if now.duration_since(*prev) < self.progress_throttle {
                    return;
                }
            }
            last.insert(snapshot.task_id, now);
        }
        self.deliver(Event::TaskUpdated(snapshot));
    }

    pub fn emit_queue_status(&self, snapshot: QueueStatusSnapshot) {
        self.deliver(Event::QueueStatus(snapshot));
    }

    /// Forget throttle state for a task once it leaves the active set.
    pub fn forget_task(&self, task_id: TaskId) {
        self.last_progress_emit.lock().unwrap().remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_snapshot() -> TaskSnapshot {
        TaskSnapshot {
            task_id: 1,
            state: "PENDING".to_string(),
            priority: 5,
            effective_priority: 5,
            host: "example.com".to_string(),
            bytes_downloaded: 0,
            bytes_total: 100,
            throughput_bps: 0.0,
            attempt: 0,
            max_attempts: 3,
            next_eligible_at: None,
            last_error: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn valid_snapshot_passes_validation() {
        let snap = sample_snapshot();
        let value = serde_json::to_value(&snap).unwrap();
        assert!(validate_snapshot(&value).is_ok());
    }

    #[test]
    fn missing_key_is_rejected() {
        let mut value = serde_json::to_value(sample_snapshot()).unwrap();
        value.as_object_mut().unwrap().remove("throughput_bps");
        assert!(matches!(
            validate_snapshot(&value),
            Err(SnapshotError::MissingKey("throughput_bps"))
        ));
    }

    #[test]
    fn wrong_type_is_rejected() {
        let mut value = serde_json::to_value(sample_snapshot()).unwrap();
        value["state"] = json!(123);
        assert!(matches!(
            validate_snapshot(&value),
            Err(SnapshotError::WrongType("state"))
        ));
    }

    #[test]
    fn emission_reaches_all_subscribers() {
        let bus = EventBus::new(Duration::from_millis(250));
        let counter = Arc::new(AtomicU64::new(0));
        let c1 = Arc::clone(&counter);
        let c2 = Arc::clone(&counter);
        bus.subscribe(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        bus.subscribe(move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit_task_added(sample_snapshot());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_subscriber_does_not_stop_delivery_to_others() {
        let bus = EventBus::new(Duration::from_millis(250));
        let counter = Arc::new(AtomicU64::new(0));
        let c2 = Arc::clone(&counter);
        bus.subscribe(|_| panic!("boom"));
        bus.subscribe(move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit_task_added(sample_snapshot());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_future_delivery() {
        let bus = EventBus::new(Duration::from_millis(250));
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        let id = bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit_task_added(sample_snapshot());
        bus.unsubscribe(id);
        bus.emit_task_added(sample_snapshot());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn progress_updates_are_throttled_but_transitions_are_not() {
        let bus = EventBus::new(Duration::from_secs(60));
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit_task_updated(sample_snapshot(), UpdateKind::Progress);
        bus.emit_task_updated(sample_snapshot(), UpdateKind::Progress);
        assert_eq!(counter.load(Ordering::SeqCst), 1, "second progress tick should be throttled");
        bus.emit_task_updated(sample_snapshot(), UpdateKind::Transition);
        assert_eq!(counter.load(Ordering::SeqCst), 2, "transitions are never coalesced");
    }
}
