//! Loads and saves the queue snapshot (C7) around a CLI invocation.
//!
//! Each `ddm` invocation is a fresh process with no in-memory queue to
//! inherit, so every command that touches the queue loads the snapshot,
//! mutates it, and saves it back before exiting — regardless of
//! `cfg.persist_queue`, which instead governs whether a long-lived embedder
//! mirrors its own in-memory queue to disk on its own schedule.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ddm_core::config::DdmConfig;
use ddm_core::event_bus::EventBus;
use ddm_core::queue::{load_queue_state, save_queue_state, Queue};

pub fn load(cfg: &DdmConfig) -> Result<Arc<Queue>> {
    let path = cfg.resolved_queue_state_path()?;
    let tasks = load_queue_state(&path)?;
    let bus = Arc::new(EventBus::new(Duration::from_millis(cfg.progress_throttle_ms)));
    Ok(Arc::new(Queue::from_tasks(bus, tasks)))
}

pub fn save(cfg: &DdmConfig, queue: &Queue) -> Result<()> {
    let path = cfg.resolved_queue_state_path()?;
    save_queue_state(&path, &queue.all_tasks())
}
