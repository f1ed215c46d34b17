//! `ddm run` – drain the queue, dispatching every PENDING/RETRY_WAIT task
//! until nothing is left runnable.

use anyhow::Result;
use ddm_core::config::DdmConfig;
use ddm_core::resume_db::ResumeDb;
use ddm_core::scheduler::Dispatcher;

use super::queue_io;

pub async fn run_scheduler(cfg: &DdmConfig, db: &ResumeDb, jobs: Option<usize>) -> Result<()> {
    let mut cfg = cfg.clone();
    if let Some(jobs) = jobs {
        cfg.max_active_downloads = jobs.max(1);
    }

    let queue = queue_io::load(&cfg)?;
    let path = cfg.resolved_queue_state_path()?;

    let dispatcher = Dispatcher::new(std::sync::Arc::clone(&queue), db.clone(), cfg);
    dispatcher.run_until_drained(Some(&path)).await?;

    if queue.list_snapshots().is_empty() {
        println!("No queued tasks.");
    } else {
        tracing::info!("run settled all runnable tasks");
    }
    Ok(())
}
