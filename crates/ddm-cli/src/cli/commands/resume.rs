//! `ddm resume <id>` – resume a paused task.

use anyhow::Result;
use ddm_core::config::DdmConfig;

use super::queue_io;

pub async fn run_resume(cfg: &DdmConfig, id: i64) -> Result<()> {
    let queue = queue_io::load(cfg)?;
    queue.resume(id)?;
    queue_io::save(cfg, &queue)?;
    println!("resumed task {id}");
    Ok(())
}
