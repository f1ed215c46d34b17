//! Integration test: local HTTP server with Range support, multi-segment
//! download via the coordinator (no queue/scheduler involved — this exercises
//! `downloader::download` directly against a real socket).

mod common;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use ddm_core::config::DdmConfig;
use ddm_core::downloader::{self, DownloadRequest, ModeSelection};
use ddm_core::token_bucket::LimiterChain;
use tempfile::tempdir;

fn request(cfg: &DdmConfig, url: String, destination: std::path::PathBuf) -> DownloadRequest {
    DownloadRequest {
        url,
        custom_headers: HashMap::new(),
        destination,
        mode_selection: ModeSelection {
            multi_connection_threshold_bytes: cfg.multi_connection_threshold_bytes,
            min_segment_size_bytes: cfg.min_segment_size_bytes,
            max_connections: cfg.max_connections,
        },
        retry_policy: cfg.retry_policy(),
        limiter: Arc::new(LimiterChain { global: None, per_task: None }),
        cancel: Arc::new(AtomicBool::new(false)),
        verify_sha256: None,
        on_bytes: Arc::new(|_| {}),
        ui_progress: None,
        ui_progress_interval: Duration::from_millis(250),
    }
}

#[tokio::test]
async fn multi_segment_download_completes_and_file_matches() {
    let body: Vec<u8> = (0u8..100).cycle().take(64 * 1024).collect();
    let url = common::range_server::start(body.clone());

    let download_dir = tempdir().unwrap();
    let destination = download_dir.path().join("download.bin");

    let mut cfg = DdmConfig::default();
    cfg.multi_connection_threshold_bytes = 1024;
    cfg.min_segment_size_bytes = 4096;
    let req = request(&cfg, url, destination.clone());

    let outcome = tokio::task::spawn_blocking(move || downloader::download(&req))
        .await
        .unwrap()
        .expect("multi-segment download");

    assert_eq!(outcome.bytes_downloaded, body.len() as u64);
    assert_eq!(outcome.total_size, Some(body.len() as u64));
    let content = std::fs::read(&destination).unwrap();
    assert_eq!(content.len(), body.len(), "file size must match");
    assert_eq!(content, body, "file content must match");
}

#[tokio::test]
async fn head_blocked_falls_back_to_range_probe_and_completes() {
    let body: Vec<u8> = (0u8..100).cycle().take(32 * 1024).collect();
    let url = common::range_server::start_with_options(
        body.clone(),
        common::range_server::RangeServerOptions {
            head_allowed: false,
            support_ranges: true,
            advertise_ranges: true,
        },
    );

    let download_dir = tempdir().unwrap();
    let destination = download_dir.path().join("download.bin");

    let cfg = DdmConfig::default();
    let req = request(&cfg, url, destination.clone());

    tokio::task::spawn_blocking(move || downloader::download(&req))
        .await
        .unwrap()
        .expect("download despite HEAD being blocked");

    let content = std::fs::read(&destination).unwrap();
    assert_eq!(content, body);
}

#[tokio::test]
async fn no_range_server_falls_back_to_single_stream_get() {
    let body: Vec<u8> = (0u8..100).cycle().take(32 * 1024).collect();
    let url = common::range_server::start_with_options(
        body.clone(),
        common::range_server::RangeServerOptions {
            head_allowed: true,
            support_ranges: false,
            advertise_ranges: false,
        },
    );

    let download_dir = tempdir().unwrap();
    let destination = download_dir.path().join("download.bin");

    let cfg = DdmConfig::default();
    let req = request(&cfg, url, destination.clone());

    tokio::task::spawn_blocking(move || downloader::download(&req))
        .await
        .unwrap()
        .expect("single-stream fallback");

    let content = std::fs::read(&destination).unwrap();
    assert_eq!(content, body);
}
