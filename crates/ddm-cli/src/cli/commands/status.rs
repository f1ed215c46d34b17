//! `ddm status` – show the in-memory queue plus recent terminal history.

use anyhow::Result;
use ddm_core::config::DdmConfig;
use ddm_core::resume_db::ResumeDb;

use super::queue_io;

pub async fn run_status(cfg: &DdmConfig, db: &ResumeDb) -> Result<()> {
    let queue = queue_io::load(cfg)?;
    let snapshots = queue.list_snapshots();

    if snapshots.is_empty() {
        println!("No active tasks.");
    } else {
        println!("{:<6} {:<12} {:<4} {:<10} {}", "ID", "STATE", "PRI", "BYTES", "URL");
        for s in snapshots {
            println!(
                "{:<6} {:<12} {:<4} {:<10} {}",
                s.task_id,
                s.state,
                s.effective_priority,
                format!("{}/{}", s.bytes_downloaded, s.bytes_total),
                s.host,
            );
        }
    }

    let history = db.list_history(20).await?;
    if !history.is_empty() {
        println!();
        println!("Recent history:");
        println!("{:<6} {:<10} {:<6} {}", "ID", "STATE", "TRIES", "URL");
        for h in history {
            println!("{:<6} {:<10} {:<6} {}", h.task_id, h.final_state.as_str(), h.attempts, h.url);
        }
    }

    Ok(())
}
