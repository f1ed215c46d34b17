//! `ddm pause <id>` – pause a task.

use anyhow::Result;
use ddm_core::config::DdmConfig;

use super::queue_io;

pub async fn run_pause(cfg: &DdmConfig, id: i64) -> Result<()> {
    let queue = queue_io::load(cfg)?;
    queue.pause(id)?;
    queue_io::save(cfg, &queue)?;
    println!("paused task {id}");
    Ok(())
}
