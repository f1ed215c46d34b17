//! Wires the queue (C6), the event bus's task state (via `Queue` itself),
//! and the coordinator (C4) together: the actual run loop a CLI invocation
//! or a long-lived embedder drives.
//!
//! One `Dispatcher` owns the ambient resources a dispatched download needs
//! that aren't part of the task itself — the global bandwidth limiter and
//! the global connection budget — and translates each `Dispatch` the queue
//! hands out into one `downloader::download` call plus the queue/ledger
//! bookkeeping around it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::DdmConfig;
use crate::downloader::{self, DownloadError, DownloadRequest, ModeSelection};
use crate::queue::{Dispatch, Queue, SchedulingConfig, TaskId, TaskState};
use crate::resume_db::{HistoryEntry, ResumeDb, TerminalState};
use crate::token_bucket::{LimiterChain, TokenBucket};

use super::budget::GlobalConnectionBudget;

pub struct Dispatcher {
    queue: Arc<Queue>,
    history: ResumeDb,
    cfg: DdmConfig,
    global_limiter: Option<Arc<TokenBucket>>,
    budget: Arc<GlobalConnectionBudget>,
}

impl Dispatcher {
    pub fn new(queue: Arc<Queue>, history: ResumeDb, cfg: DdmConfig) -> Self {
        let global_limiter = if cfg.enable_bandwidth_limiting && cfg.global_bandwidth_limit_bps > 0 {
            Some(Arc::new(TokenBucket::new(cfg.global_bandwidth_limit_bps)))
        } else {
            None
        };
        let budget = Arc::new(GlobalConnectionBudget::new(cfg.max_total_connections));
        Self { queue, history, cfg, global_limiter, budget }
    }

    fn scheduling_config(&self) -> SchedulingConfig {
        SchedulingConfig {
            max_active_downloads: self.cfg.max_active_downloads,
            per_host_enabled: self.cfg.per_host_enabled,
            per_host_max_active: self.cfg.per_host_max_active,
            priority_aging_enabled: self.cfg.priority_aging_enabled,
            priority_aging_step: self.cfg.priority_aging_step.min(u8::MAX as u32) as u8,
            priority_aging_interval: Duration::from_secs_f64(self.cfg.priority_aging_interval_s.max(0.0)),
            max_priority: 10,
        }
    }

    /// Runs scheduling ticks until no task is PENDING/STARTING/DOWNLOADING/
    /// RETRY_WAIT, persisting the queue snapshot to `persistence_path` after
    /// every batch of dispatched downloads settles. A CLI command that needs
    /// the queue to survive past this process calls this with `Some(path)`
    /// regardless of `cfg.persist_queue` — that toggle only governs whether a
    /// long-lived embedder mirrors its in-memory queue to disk on its own.
    pub async fn run_until_drained(&self, persistence_path: Option<&std::path::Path>) -> anyhow::Result<()> {
        loop {
            let dispatched = self.queue.scheduling_step(&self.scheduling_config());
            if dispatched.is_empty() {
                if !self.queue.has_active_work() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }

            let mut handles = Vec::with_capacity(dispatched.len());
            for d in dispatched {
                handles.push(self.spawn_dispatch(d));
            }
            for h in handles {
                let _ = h.await;
            }

            if let Some(path) = persistence_path {
                let tasks = self.queue.all_tasks();
                crate::queue::persistence::save_queue_state(path, &tasks)?;
            }
        }
        Ok(())
    }

    fn spawn_dispatch(&self, d: Dispatch) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let history = self.history.clone();
        let cfg = self.cfg.clone();
        let global_limiter = self.global_limiter.clone();
        let budget = Arc::clone(&self.budget);

        tokio::spawn(async move {
            let reserved = budget.reserve(cfg.max_connections);
            let result = run_one(&queue, &cfg, global_limiter, &d).await;
            budget.release(reserved);

            match result {
                Ok(()) => {
                    let _ = queue.complete(d.id);
                    record_terminal(&history, &d, TerminalState::Completed, 0).await;
                }
                Err(e) => {
                    let kind = e.kind();
                    let retry_after = e.retry_after();
                    let mut policy = cfg.retry_policy();
                    if !cfg.retry_enabled {
                        policy.max_attempts = 1;
                    }
                    match queue.fail_or_retry(d.id, kind, e.to_string(), &policy, retry_after) {
                        Ok(TaskState::Failed) => {
                            record_terminal(&history, &d, TerminalState::Failed, d.attempt + 1).await;
                        }
                        _ => {}
                    }
                }
            }
        })
    }
}

async fn run_one(
    queue: &Arc<Queue>,
    cfg: &DdmConfig,
    global_limiter: Option<Arc<TokenBucket>>,
    d: &Dispatch,
) -> Result<(), DownloadError> {
    let per_task_bucket = if cfg.enable_bandwidth_limiting && cfg.per_task_bandwidth_limit_bps > 0 {
        Some(TokenBucket::new(cfg.per_task_bandwidth_limit_bps))
    } else {
        None
    };
    let limiter = Arc::new(LimiterChain { global: global_limiter, per_task: per_task_bucket });

    let mode_selection = ModeSelection {
        multi_connection_threshold_bytes: cfg.multi_connection_threshold_bytes,
        min_segment_size_bytes: cfg.min_segment_size_bytes,
        max_connections: cfg.max_connections,
    };

    let bytes_total = probe_total_size(&d.url).await;

    let id = d.id;
    let marked_downloading = Arc::new(AtomicBool::new(false));
    let bytes_so_far = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let on_bytes: Arc<dyn Fn(u64) + Send + Sync> = {
        let queue = Arc::clone(queue);
        let marked_downloading = Arc::clone(&marked_downloading);
        let bytes_so_far = Arc::clone(&bytes_so_far);
        Arc::new(move |n: u64| {
            if !marked_downloading.swap(true, Ordering::Relaxed) {
                let _ = queue.mark_downloading(id);
            }
            let total = bytes_so_far.fetch_add(n, Ordering::Relaxed) + n;
            let elapsed = start.elapsed().as_secs_f64();
            let throughput = if elapsed > 0.0 { total as f64 / elapsed } else { 0.0 };
            queue.record_progress(id, total, bytes_total, throughput);
        })
    };

    let req = DownloadRequest {
        url: d.url.clone(),
        custom_headers: HashMap::new(),
        destination: d.destination.clone(),
        mode_selection,
        retry_policy: cfg.retry_policy(),
        limiter,
        cancel: Arc::clone(&d.cancel),
        verify_sha256: d.options.get("sha256").cloned(),
        on_bytes,
        ui_progress: None,
        ui_progress_interval: Duration::from_millis(cfg.progress_throttle_ms),
    };

    tokio::task::spawn_blocking(move || downloader::download(&req))
        .await
        .map_err(|e| DownloadError::Setup(anyhow::anyhow!("download task panicked: {e}")))?
        .map(|_| ())
}

/// A cheap, best-effort HEAD probe purely to seed the progress snapshot's
/// `bytes_total` before the coordinator's own (authoritative) probe runs.
/// Failure here never aborts the download; it just leaves progress reporting
/// without a denominator until the coordinator's ticker would have reported one.
async fn probe_total_size(url: &str) -> u64 {
    let url = url.to_string();
    tokio::task::spawn_blocking(move || {
        crate::fetch_head::probe(&url, &HashMap::new())
            .ok()
            .and_then(|h| h.content_length)
            .unwrap_or(0)
    })
    .await
    .unwrap_or(0)
}

async fn record_terminal(history: &ResumeDb, d: &Dispatch, final_state: TerminalState, attempts: u32) {
    let entry = HistoryEntry {
        task_id: d.id,
        url: d.url.clone(),
        destination: d.destination.display().to_string(),
        final_state,
        bytes_total: None,
        attempts: attempts.max(d.attempt),
        last_error: None,
        created_at: crate::resume_db::db::unix_timestamp(),
        terminal_at: crate::resume_db::db::unix_timestamp(),
    };
    if let Err(e) = history.record_terminal(&entry).await {
        tracing::warn!(task_id = d.id, error = %e, "failed to record history entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use std::path::PathBuf;

    #[tokio::test]
    async fn dispatcher_settles_a_failing_task_to_failed_and_records_history() {
        let bus = Arc::new(EventBus::new(Duration::from_millis(250)));
        let queue = Arc::new(Queue::new(bus));
        let id = queue
            .enqueue(
                "http://127.0.0.1:1/unreachable".to_string(),
                PathBuf::from("/tmp/nonexistent-ddm-test-file"),
                5,
                1,
                HashMap::new(),
            )
            .unwrap();

        let history = crate::resume_db::db::open_memory().await.unwrap();
        let mut cfg = DdmConfig::default();
        cfg.retry_max_attempts = 1;
        let dispatcher = Dispatcher::new(Arc::clone(&queue), history.clone(), cfg);

        dispatcher.run_until_drained(None).await.unwrap();

        let snap = queue.get_snapshot(id).unwrap();
        assert_eq!(snap.state, "FAILED");
        let recorded = history.get_history(id).await.unwrap();
        assert!(recorded.is_some());
    }
}
