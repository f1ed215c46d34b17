//! `ddm add <url>` – enqueue a new download task.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use ddm_core::config::DdmConfig;

use super::queue_io;

pub async fn run_add(cfg: &DdmConfig, url: &str, download_dir: Option<&Path>, priority: u8) -> Result<()> {
    let queue = queue_io::load(cfg)?;

    let dir = match download_dir {
        Some(d) => d.to_path_buf(),
        None => std::env::current_dir()?,
    };
    let filename = ddm_core::url_model::derive_filename(url, None);
    let destination: PathBuf = dir.join(filename);

    let id = queue.enqueue(
        url.to_string(),
        destination,
        priority,
        cfg.retry_max_attempts,
        HashMap::new(),
    )?;

    queue_io::save(cfg, &queue)?;
    println!("added task {id}");
    Ok(())
}
