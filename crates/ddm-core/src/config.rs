//! Global configuration loaded from `~/.config/ddm/config.toml`.

use crate::retry::JitterMode;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Jitter mode as configured on disk; mirrors `crate::retry::JitterMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterModeConfig {
    None,
    Full,
    Proportional,
}

impl Default for JitterModeConfig {
    fn default() -> Self {
        JitterModeConfig::Proportional
    }
}

impl From<JitterModeConfig> for JitterMode {
    fn from(j: JitterModeConfig) -> Self {
        match j {
            JitterModeConfig::None => JitterMode::None,
            JitterModeConfig::Full => JitterMode::Full,
            JitterModeConfig::Proportional => JitterMode::Proportional,
        }
    }
}

/// Global configuration, covering connection/segment tuning, bandwidth
/// shaping, the concurrency governor, retry policy, priority aging, and
/// queue persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DdmConfig {
    // --- Connection / segment tuning (C4 mode selection) ---
    /// Cap on segments per download (default 4, range 1-16).
    pub max_connections: usize,
    /// Minimum size to consider multi-mode.
    pub multi_connection_threshold_bytes: u64,
    /// Lower bound on a segment.
    pub min_segment_size_bytes: u64,
    /// Per-read transfer granularity.
    pub chunk_size_bytes: usize,

    // --- Global connection budget (ambient; independent of per-task segment count) ---
    pub max_total_connections: usize,
    pub max_connections_per_host: usize,

    // --- Bandwidth shaping (C2) ---
    pub enable_bandwidth_limiting: bool,
    pub global_bandwidth_limit_bps: u64,
    pub per_task_bandwidth_limit_bps: u64,

    // --- Concurrency governor (C6) ---
    pub max_active_downloads: usize,
    pub per_host_enabled: bool,
    pub per_host_max_active: usize,

    // --- Retry policy ---
    pub retry_enabled: bool,
    pub retry_max_attempts: u32,
    pub retry_backoff_base_s: f64,
    pub retry_backoff_max_s: f64,
    pub retry_jitter_mode: JitterModeConfig,

    // --- Priority aging ---
    pub priority_aging_enabled: bool,
    pub priority_aging_step: u32,
    pub priority_aging_interval_s: f64,

    // --- Queue persistence (C7) ---
    pub persist_queue: bool,
    pub queue_state_path: String,

    // --- Progress / event throttling (C8) ---
    pub progress_throttle_ms: u64,
}

impl Default for DdmConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            multi_connection_threshold_bytes: 8 * 1024 * 1024,
            min_segment_size_bytes: 1024 * 1024,
            chunk_size_bytes: 64 * 1024,

            max_total_connections: 64,
            max_connections_per_host: 16,

            enable_bandwidth_limiting: false,
            global_bandwidth_limit_bps: 0,
            per_task_bandwidth_limit_bps: 0,

            max_active_downloads: 2,
            per_host_enabled: false,
            per_host_max_active: 2,

            retry_enabled: false,
            retry_max_attempts: 3,
            retry_backoff_base_s: 0.25,
            retry_backoff_max_s: 30.0,
            retry_jitter_mode: JitterModeConfig::Proportional,

            priority_aging_enabled: false,
            priority_aging_step: 1,
            priority_aging_interval_s: 60.0,

            persist_queue: false,
            queue_state_path: "data/queue_state.json".to_string(),

            progress_throttle_ms: 250,
        }
    }
}

impl DdmConfig {
    pub fn retry_policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: std::time::Duration::from_secs_f64(self.retry_backoff_base_s.max(0.0)),
            max_delay: std::time::Duration::from_secs_f64(self.retry_backoff_max_s.max(0.0)),
            jitter: self.retry_jitter_mode.into(),
        }
    }

    /// Resolve `queue_state_path` against the XDG state directory when relative.
    pub fn resolved_queue_state_path(&self) -> Result<PathBuf> {
        let p = PathBuf::from(&self.queue_state_path);
        if p.is_absolute() {
            return Ok(p);
        }
        let xdg_dirs = xdg::BaseDirectories::with_prefix("ddm")?;
        Ok(xdg_dirs.get_state_home().join("ddm").join(p))
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("ddm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<DdmConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = DdmConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!(path = %path.display(), "created default config");
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: DdmConfig = toml::from_str(&data)?;
    Ok(cfg)
}
