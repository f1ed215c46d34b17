//! CLI for the DDM download manager.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ddm_core::config;
use ddm_core::resume_db::ResumeDb;
use std::path::Path;

use commands::{run_add, run_checksum, run_pause, run_remove, run_resume, run_scheduler, run_status};

/// Top-level CLI for the DDM download manager.
#[derive(Debug, Parser)]
#[command(name = "ddm")]
#[command(about = "DDM: high-throughput segmented download manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Enqueue a new download task.
    Add {
        /// Direct HTTP/HTTPS URL to download.
        url: String,
        /// Directory where the file will be saved (default: current directory).
        #[arg(long, value_name = "DIR")]
        download_dir: Option<std::path::PathBuf>,
        /// Scheduling priority, 1-10, higher runs sooner.
        #[arg(long, default_value = "5")]
        priority: u8,
    },

    /// Drain the queue: dispatch every runnable task until none are left.
    Run {
        /// Override the configured concurrency cap for this run.
        #[arg(long, value_name = "N")]
        jobs: Option<usize>,
    },

    /// Show the queue and recent history.
    Status,

    /// Pause a task by ID. It will not be dispatched until resumed.
    Pause {
        /// Task identifier.
        id: i64,
    },

    /// Resume a paused task by its ID.
    Resume {
        /// Task identifier.
        id: i64,
    },

    /// Cancel a task by ID and drop it from the queue.
    Remove {
        /// Task identifier.
        id: i64,
        /// Also delete the task's destination file (and its `.resume` sidecar) from disk.
        #[arg(long)]
        delete_files: bool,
    },

    /// Compute SHA-256 of a file (e.g. after download).
    Checksum {
        /// Path to the file.
        path: String,
    },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Add { url, download_dir, priority } => {
                run_add(&cfg, &url, download_dir.as_deref(), priority).await?
            }
            CliCommand::Run { jobs } => {
                let db = ResumeDb::open_default().await?;
                run_scheduler(&cfg, &db, jobs).await?;
            }
            CliCommand::Status => {
                let db = ResumeDb::open_default().await?;
                run_status(&cfg, &db).await?
            }
            CliCommand::Pause { id } => run_pause(&cfg, id).await?,
            CliCommand::Resume { id } => run_resume(&cfg, id).await?,
            CliCommand::Remove { id, delete_files } => run_remove(&cfg, id, delete_files).await?,
            CliCommand::Checksum { path } => run_checksum(Path::new(&path)).await?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
