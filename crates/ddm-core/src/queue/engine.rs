//! Queue + Scheduler (C6, §4.6): priority ordering with FIFO tiebreak, the
//! concurrency governor, pause/resume/cancel, retry timing, and priority
//! aging. This is the single in-process owner of every `Task`; nothing else
//! mutates task state directly.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::task::{Task, TaskId, TaskProgress, TaskState};
use crate::errors::ErrorKind;
use crate::event_bus::{build_task_snapshot, EventBus, QueueStatusSnapshot, UpdateKind};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::url_model::normalized_host;

/// The subset of `DdmConfig` the scheduling step needs, kept narrow so this
/// module doesn't depend on the whole config type.
#[derive(Debug, Clone, Copy)]
pub struct SchedulingConfig {
    pub max_active_downloads: usize,
    pub per_host_enabled: bool,
    pub per_host_max_active: usize,
    pub priority_aging_enabled: bool,
    pub priority_aging_step: u8,
    pub priority_aging_interval: Duration,
    pub max_priority: u8,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            max_active_downloads: 2,
            per_host_enabled: false,
            per_host_max_active: 2,
            priority_aging_enabled: false,
            priority_aging_step: 1,
            priority_aging_interval: Duration::from_secs(60),
            max_priority: 10,
        }
    }
}

/// One task selected by `scheduling_step`, carrying everything the
/// dispatcher needs to invoke the coordinator (C4) without looking the task
/// back up.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub id: TaskId,
    pub url: String,
    pub destination: std::path::PathBuf,
    pub options: std::collections::HashMap<String, String>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub cancel: Arc<AtomicBool>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("no such task: {0}")]
    NotFound(TaskId),
    #[error("task {0} cannot transition from {1} to {2}")]
    InvalidTransition(TaskId, &'static str, &'static str),
}

struct Inner {
    tasks: HashMap<TaskId, Task>,
    cancel_tokens: HashMap<TaskId, Arc<AtomicBool>>,
    last_aged_at: HashMap<TaskId, DateTime<Utc>>,
    next_id: TaskId,
    next_seq: u64,
}

/// The Queue + Scheduler. Thread-safe; every mutation takes the single lock,
/// does O(1)-ish work, and emits through the event bus before releasing it so
/// observers see transitions in the exact order they happened.
pub struct Queue {
    inner: Mutex<Inner>,
    bus: Arc<EventBus>,
}

impl Queue {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                cancel_tokens: HashMap::new(),
                last_aged_at: HashMap::new(),
                next_id: 1,
                next_seq: 0,
            }),
            bus,
        }
    }

    /// Rehydrate a queue from a previously persisted (and crash-recovery
    /// rewritten) task list, e.g. on CLI startup.
    pub fn from_tasks(bus: Arc<EventBus>, tasks: Vec<Task>) -> Self {
        let queue = Self::new(bus);
        {
            let mut inner = queue.inner.lock().unwrap();
            for t in tasks {
                inner.next_id = inner.next_id.max(t.id + 1);
                inner.next_seq = inner.next_seq.max(t.seq + 1);
                if t.state == TaskState::Pending {
                    inner.last_aged_at.insert(t.id, t.pending_since.unwrap_or(t.created_at_wall));
                }
                inner.tasks.insert(t.id, t);
            }
        }
        queue
    }

    /// Enqueue a new task. Emits `TASK_ADDED`. Corresponds to the `— ->
    /// PENDING` transition in §4.6's table.
    pub fn enqueue(
        &self,
        url: String,
        destination: std::path::PathBuf,
        priority: u8,
        max_attempts: u32,
        options: std::collections::HashMap<String, String>,
    ) -> Result<TaskId, anyhow::Error> {
        let priority = priority.clamp(1, 10);
        let host = normalized_host(&url)?;
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let task = Task {
            id,
            url,
            destination,
            priority,
            effective_priority: priority,
            created_at_wall: now,
            updated_at_wall: now,
            pending_since: Some(now),
            seq,
            state: TaskState::Pending,
            progress: TaskProgress::default(),
            attempt: 0,
            max_attempts: max_attempts.max(1),
            next_eligible_at: None,
            host,
            last_error: None,
            options,
            resume_state_ref: None,
        };
        inner.last_aged_at.insert(id, now);
        let snap = build_task_snapshot(&task);
        inner.tasks.insert(id, task);
        drop(inner);
        self.bus.emit_task_added(snap);
        Ok(id)
    }

    pub fn get_snapshot(&self, id: TaskId) -> Option<crate::event_bus::TaskSnapshot> {
        self.inner.lock().unwrap().tasks.get(&id).map(build_task_snapshot)
    }

    pub fn list_snapshots(&self) -> Vec<crate::event_bus::TaskSnapshot> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<&Task> = inner.tasks.values().collect();
        tasks.sort_by_key(|t| t.id);
        tasks.iter().map(|t| build_task_snapshot(t)).collect()
    }

    pub fn all_tasks(&self) -> Vec<Task> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<Task> = inner.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        self.inner.lock().unwrap().tasks.get(&id).cloned()
    }

    /// Whether any task is still active (will ever need a scheduling
    /// decision): PENDING, STARTING, DOWNLOADING, or RETRY_WAIT. A CLI-style
    /// one-shot runner loops `scheduling_step` until this goes false.
    pub fn has_active_work(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.tasks.values().any(|t| {
            matches!(
                t.state,
                TaskState::Pending | TaskState::Starting | TaskState::Downloading | TaskState::RetryWait
            )
        })
    }

    fn transition(inner: &mut Inner, bus: &EventBus, id: TaskId, to: TaskState) -> Result<(), QueueError> {
        let task = inner.tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if !task.state.can_transition_to(to) {
            return Err(QueueError::InvalidTransition(id, task.state.as_str(), to.as_str()));
        }
        task.state = to;
        task.updated_at_wall = Utc::now();
        if to == TaskState::Pending {
            task.pending_since = Some(task.updated_at_wall);
            inner.last_aged_at.insert(id, task.updated_at_wall);
        } else {
            task.pending_since = None;
        }
        let snap = build_task_snapshot(task);
        bus.emit_task_updated(snap, UpdateKind::Transition);
        Ok(())
    }

    /// Pause request (§4.6): any non-terminal task moves to PAUSED. If the
    /// task is currently downloading, the caller is responsible for tearing
    /// down the coordinator; the cancel token registered at dispatch time is
    /// flipped here so a running segment worker observes it at the next
    /// checkpoint.
    pub fn pause(&self, id: TaskId) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(token) = inner.cancel_tokens.get(&id) {
            token.store(true, Ordering::Relaxed);
        }
        Self::transition(&mut inner, &self.bus, id, TaskState::Paused)
    }

    /// Resume request: PAUSED -> PENDING. The scheduler may re-dispatch it on
    /// the next `scheduling_step`; the coordinator resumes from the resume
    /// record left on disk.
    pub fn resume(&self, id: TaskId) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner.cancel_tokens.remove(&id);
        Self::transition(&mut inner, &self.bus, id, TaskState::Pending)
    }

    /// Cancel request: immediate, from any non-terminal state.
    pub fn cancel(&self, id: TaskId) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(token) = inner.cancel_tokens.get(&id) {
            token.store(true, Ordering::Relaxed);
        }
        inner.cancel_tokens.remove(&id);
        Self::transition(&mut inner, &self.bus, id, TaskState::Cancelled)
    }

    /// Runs one scheduling step (§4.6): ages priorities, promotes expired
    /// RETRY_WAIT tasks, then selects runnable candidates under the
    /// concurrency governor and transitions them PENDING -> STARTING,
    /// returning what the dispatcher needs to invoke C4 for each.
    pub fn scheduling_step(&self, cfg: &SchedulingConfig) -> Vec<Dispatch> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();

        if cfg.priority_aging_enabled {
            let due: Vec<TaskId> = inner
                .tasks
                .values()
                .filter(|t| t.state == TaskState::Pending)
                .filter(|t| {
                    let last = inner.last_aged_at.get(&t.id).copied().unwrap_or(t.created_at_wall);
                    now.signed_duration_since(last).to_std().unwrap_or_default() >= cfg.priority_aging_interval
                })
                .map(|t| t.id)
                .collect();
            for id in due {
                if let Some(task) = inner.tasks.get_mut(&id) {
                    task.effective_priority = (task.effective_priority + cfg.priority_aging_step).min(cfg.max_priority);
                    task.updated_at_wall = now;
                    inner.last_aged_at.insert(id, now);
                }
            }
        }

        let expired: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| t.state == TaskState::RetryWait)
            .filter(|t| t.next_eligible_at.map(|at| at <= now).unwrap_or(false))
            .map(|t| t.id)
            .collect();
        for id in expired {
            let _ = Self::transition(&mut inner, &self.bus, id, TaskState::Pending);
        }

        let downloading_total = inner.tasks.values().filter(|t| t.state == TaskState::Downloading).count();
        let mut downloading_per_host: HashMap<String, usize> = HashMap::new();
        for t in inner.tasks.values().filter(|t| t.state == TaskState::Downloading) {
            *downloading_per_host.entry(t.host.clone()).or_insert(0) += 1;
        }

        let mut candidates: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .cloned()
            .collect();
        candidates.sort_by_key(|t| std::cmp::Reverse(t.scheduling_key()));

        let mut dispatches = Vec::new();
        let mut slots_used = downloading_total;
        let mut host_slots_used = downloading_per_host;
        let mut seen_hosts_this_round: HashSet<String> = HashSet::new();
        let _ = &mut seen_hosts_this_round;

        for candidate in candidates {
            if slots_used >= cfg.max_active_downloads {
                break;
            }
            if cfg.per_host_enabled {
                let used = host_slots_used.get(&candidate.host).copied().unwrap_or(0);
                if used >= cfg.per_host_max_active {
                    continue;
                }
            }

            if Self::transition(&mut inner, &self.bus, candidate.id, TaskState::Starting).is_err() {
                continue;
            }
            slots_used += 1;
            *host_slots_used.entry(candidate.host.clone()).or_insert(0) += 1;

            let cancel = Arc::new(AtomicBool::new(false));
            inner.cancel_tokens.insert(candidate.id, Arc::clone(&cancel));

            dispatches.push(Dispatch {
                id: candidate.id,
                url: candidate.url.clone(),
                destination: candidate.destination.clone(),
                options: candidate.options.clone(),
                attempt: candidate.attempt,
                max_attempts: candidate.max_attempts,
                cancel,
            });
        }

        drop(inner);
        self.emit_queue_status();
        dispatches
    }

    /// STARTING -> DOWNLOADING: first byte received, or the 1s fallback
    /// timeout elapsed (the dispatcher decides which fired; this call is the
    /// same either way).
    pub fn mark_downloading(&self, id: TaskId) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        Self::transition(&mut inner, &self.bus, id, TaskState::Downloading)
    }

    /// Records a progress tick without changing state. Subject to the event
    /// bus's own progress throttling; never coalesced with a transition.
    pub fn record_progress(&self, id: TaskId, bytes_downloaded: u64, bytes_total: u64, throughput_bps: f64) {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(&id) else { return };
        if task.state != TaskState::Downloading {
            return;
        }
        task.progress.bytes_downloaded = bytes_downloaded;
        task.progress.bytes_total = bytes_total;
        task.progress.throughput_bps = throughput_bps;
        task.updated_at_wall = Utc::now();
        let snap = build_task_snapshot(task);
        drop(inner);
        self.bus.emit_task_updated(snap, UpdateKind::Progress);
    }

    /// DOWNLOADING -> COMPLETED: successful commit.
    pub fn complete(&self, id: TaskId) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner.cancel_tokens.remove(&id);
        self.bus.forget_task(id);
        Self::transition(&mut inner, &self.bus, id, TaskState::Completed)
    }

    /// Reports a download failure and applies the retry policy (§4.6,
    /// §7): a retryable kind with attempts remaining moves to RETRY_WAIT with
    /// a jittered backoff delay (honoring a server `Retry-After` hint when
    /// larger); otherwise the task is terminally FAILED. Returns the state
    /// the task ended up in.
    pub fn fail_or_retry(
        &self,
        id: TaskId,
        kind: ErrorKind,
        message: String,
        policy: &RetryPolicy,
        retry_after: Option<Duration>,
    ) -> Result<TaskState, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner.cancel_tokens.remove(&id);
        let task = inner.tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        task.attempt += 1;
        task.last_error = Some(message);
        let attempt = task.attempt;

        let decision = policy.decide_with_retry_after(attempt, kind, retry_after);
        let final_state = match decision {
            RetryDecision::NoRetry => TaskState::Failed,
            RetryDecision::RetryAfter(_) if attempt >= task.max_attempts => TaskState::Failed,
            RetryDecision::RetryAfter(delay) => {
                task.next_eligible_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
                TaskState::RetryWait
            }
        };
        if final_state == TaskState::Completed {
            unreachable!();
        }
        if final_state == TaskState::Failed {
            self.bus.forget_task(id);
        }
        Self::transition(&mut inner, &self.bus, id, final_state)?;
        Ok(final_state)
    }

    fn emit_queue_status(&self) {
        let inner = self.inner.lock().unwrap();
        let mut snap = QueueStatusSnapshot { active_downloads: 0, pending: 0, retry_wait: 0, paused: 0 };
        for t in inner.tasks.values() {
            match t.state {
                TaskState::Downloading => snap.active_downloads += 1,
                TaskState::Pending => snap.pending += 1,
                TaskState::RetryWait => snap.retry_wait += 1,
                TaskState::Paused => snap.paused += 1,
                _ => {}
            }
        }
        drop(inner);
        self.bus.emit_queue_status(snap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration as StdDuration;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new(StdDuration::from_millis(250)))
    }

    fn enqueue(q: &Queue, url: &str, priority: u8) -> TaskId {
        q.enqueue(url.to_string(), PathBuf::from("/tmp/x"), priority, 3, Default::default())
            .unwrap()
    }

    #[test]
    fn higher_priority_dispatches_first() {
        let q = Queue::new(bus());
        let low_a = enqueue(&q, "https://a.example/1", 5);
        let _low_b = enqueue(&q, "https://a.example/2", 5);
        let high = enqueue(&q, "https://a.example/3", 9);

        let cfg = SchedulingConfig { max_active_downloads: 1, ..Default::default() };
        let d1 = q.scheduling_step(&cfg);
        assert_eq!(d1.len(), 1);
        assert_eq!(d1[0].id, high);

        q.mark_downloading(high).unwrap();
        q.complete(high).unwrap();
        let d2 = q.scheduling_step(&cfg);
        assert_eq!(d2[0].id, low_a, "equal-priority FIFO tiebreak by creation order");
    }

    #[test]
    fn concurrency_governor_caps_active_downloads() {
        let q = Queue::new(bus());
        for i in 0..5 {
            enqueue(&q, &format!("https://a.example/{i}"), 5);
        }
        let cfg = SchedulingConfig { max_active_downloads: 2, ..Default::default() };
        let dispatched = q.scheduling_step(&cfg);
        assert_eq!(dispatched.len(), 2);
        // Nothing more should be selectable until one of the two finishes.
        let more = q.scheduling_step(&cfg);
        assert!(more.is_empty());
    }

    #[test]
    fn per_host_cap_limits_concurrent_downloads_per_host() {
        let q = Queue::new(bus());
        for i in 0..4 {
            enqueue(&q, &format!("https://a.example/{i}"), 5);
        }
        for i in 0..4 {
            enqueue(&q, &format!("https://b.example/{i}"), 5);
        }
        let cfg = SchedulingConfig {
            max_active_downloads: 4,
            per_host_enabled: true,
            per_host_max_active: 1,
            ..Default::default()
        };
        let dispatched = q.scheduling_step(&cfg);
        assert_eq!(dispatched.len(), 2, "one per host even though global cap allows 4");
        let hosts: HashSet<String> = dispatched
            .iter()
            .map(|d| url::Url::parse(&d.url).unwrap().host_str().unwrap().to_string())
            .collect();
        assert_eq!(hosts.len(), 2);
    }

    #[test]
    fn host_key_strips_port_for_the_concurrency_cap() {
        let q = Queue::new(bus());
        enqueue(&q, "https://example.com:8001/a", 5);
        enqueue(&q, "https://example.com:9001/b", 5);
        let cfg = SchedulingConfig {
            max_active_downloads: 4,
            per_host_enabled: true,
            per_host_max_active: 1,
            ..Default::default()
        };
        let dispatched = q.scheduling_step(&cfg);
        assert_eq!(dispatched.len(), 1, "same host, different ports, must share the cap");
    }

    #[test]
    fn retryable_failure_moves_to_retry_wait_with_increasing_deadlines() {
        let q = Queue::new(bus());
        let id = enqueue(&q, "https://a.example/1", 5);
        let cfg = SchedulingConfig { max_active_downloads: 1, ..Default::default() };
        q.scheduling_step(&cfg);
        q.mark_downloading(id).unwrap();

        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: StdDuration::from_millis(10),
            jitter: crate::retry::JitterMode::None,
            ..RetryPolicy::default()
        };
        let state = q
            .fail_or_retry(id, ErrorKind::Network, "reset".into(), &policy, None)
            .unwrap();
        assert_eq!(state, TaskState::RetryWait);
        let first_deadline = q.get_snapshot(id).unwrap().next_eligible_at;
        assert!(first_deadline.is_some());
    }

    #[test]
    fn attempts_exhausted_fails_terminally() {
        let q = Queue::new(bus());
        let id = enqueue(&q, "https://a.example/1", 5);
        let cfg = SchedulingConfig { max_active_downloads: 1, ..Default::default() };
        q.scheduling_step(&cfg);
        q.mark_downloading(id).unwrap();

        let policy = RetryPolicy {
            max_attempts: 1,
            jitter: crate::retry::JitterMode::None,
            ..RetryPolicy::default()
        };
        let state = q
            .fail_or_retry(id, ErrorKind::Network, "reset".into(), &policy, None)
            .unwrap();
        assert_eq!(state, TaskState::Failed);
    }

    #[test]
    fn checksum_mismatch_never_retries_even_with_attempts_remaining() {
        let q = Queue::new(bus());
        let id = enqueue(&q, "https://a.example/1", 5);
        let cfg = SchedulingConfig { max_active_downloads: 1, ..Default::default() };
        q.scheduling_step(&cfg);
        q.mark_downloading(id).unwrap();

        let policy = RetryPolicy::default();
        let state = q
            .fail_or_retry(id, ErrorKind::ChecksumMismatch, "digest mismatch".into(), &policy, None)
            .unwrap();
        assert_eq!(state, TaskState::Failed);
    }

    #[test]
    fn pause_then_resume_round_trips_through_pending() {
        let q = Queue::new(bus());
        let id = enqueue(&q, "https://a.example/1", 5);
        let cfg = SchedulingConfig { max_active_downloads: 1, ..Default::default() };
        q.scheduling_step(&cfg);
        q.mark_downloading(id).unwrap();
        q.pause(id).unwrap();
        assert_eq!(q.get_snapshot(id).unwrap().state, "PAUSED");
        q.resume(id).unwrap();
        assert_eq!(q.get_snapshot(id).unwrap().state, "PENDING");
    }

    #[test]
    fn cancel_is_immediate_from_any_nonterminal_state() {
        let q = Queue::new(bus());
        let id = enqueue(&q, "https://a.example/1", 5);
        q.cancel(id).unwrap();
        assert_eq!(q.get_snapshot(id).unwrap().state, "CANCELLED");
        assert!(q.cancel(id).is_err(), "cancel from a terminal state is not permitted");
    }

    #[test]
    fn priority_aging_promotes_effective_priority_after_interval() {
        let q = Queue::new(bus());
        let id = enqueue(&q, "https://a.example/1", 3);
        // Force the "pending long enough" condition by back-dating last_aged_at.
        {
            let mut inner = q.inner.lock().unwrap();
            inner.last_aged_at.insert(id, Utc::now() - chrono::Duration::seconds(120));
        }
        let cfg = SchedulingConfig {
            max_active_downloads: 0,
            priority_aging_enabled: true,
            priority_aging_step: 2,
            priority_aging_interval: StdDuration::from_secs(60),
            ..Default::default()
        };
        q.scheduling_step(&cfg);
        assert_eq!(q.get_snapshot(id).unwrap().effective_priority, 5);
    }

    #[test]
    fn retry_wait_promotes_to_pending_once_eligible() {
        let q = Queue::new(bus());
        let id = enqueue(&q, "https://a.example/1", 5);
        {
            let mut inner = q.inner.lock().unwrap();
            let t = inner.tasks.get_mut(&id).unwrap();
            t.state = TaskState::RetryWait;
            t.next_eligible_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
        let cfg = SchedulingConfig { max_active_downloads: 0, ..Default::default() };
        q.scheduling_step(&cfg);
        assert_eq!(q.get_snapshot(id).unwrap().state, "PENDING");
    }
}
