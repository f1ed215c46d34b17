//! `ddm remove <id>` – cancel a task and drop it from the queue.

use anyhow::Result;
use ddm_core::config::DdmConfig;

use super::queue_io;

pub async fn run_remove(cfg: &DdmConfig, id: i64, delete_files: bool) -> Result<()> {
    let queue = queue_io::load(cfg)?;
    let task = queue.get_task(id);
    queue.cancel(id)?;
    queue_io::save(cfg, &queue)?;

    if delete_files {
        if let Some(task) = task {
            let _ = std::fs::remove_file(&task.destination);
            let mut resume_sidecar = task.destination.clone().into_os_string();
            resume_sidecar.push(".resume");
            let _ = std::fs::remove_file(resume_sidecar);
        }
    }

    println!("removed task {id}");
    Ok(())
}
