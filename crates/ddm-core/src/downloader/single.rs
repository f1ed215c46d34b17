//! Single-stream HTTP GET downloader (non-Range fallback, §4.4 mode selection).
//!
//! Writes the response body sequentially to storage starting at `resume_offset`.

use super::DownloadError;
use crate::storage::StorageWriter;
use crate::token_bucket::LimiterChain;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Downloads a URL with a single GET, writing sequentially to `storage`
/// starting at `resume_offset` (0 for a fresh download). Returns the number
/// of bytes written this call.
pub(super) fn download_single(
    url: &str,
    custom_headers: &HashMap<String, String>,
    storage: &StorageWriter,
    resume_offset: u64,
    expected_len: Option<u64>,
    limiter: &LimiterChain,
    cancel: &Arc<AtomicBool>,
    on_bytes: &(dyn Fn(u64) + Send + Sync),
) -> Result<u64, DownloadError> {
    let written = Arc::new(AtomicU64::new(0));
    let written_cb = Arc::clone(&written);
    let retry_after: Arc<Mutex<Option<Duration>>> = Arc::new(Mutex::new(None));
    let retry_after_cb = Arc::clone(&retry_after);
    let cancelled_cb = Arc::clone(cancel);
    let storage = storage.clone();

    let mut easy = curl::easy::Easy::new();
    easy.url(url).map_err(DownloadError::curl)?;
    easy.follow_location(true).map_err(DownloadError::curl)?;
    easy.max_redirections(10).map_err(DownloadError::curl)?;
    if resume_offset > 0 {
        easy.range(&format!("{}-", resume_offset))
            .map_err(DownloadError::curl)?;
    }
    easy.connect_timeout(Duration::from_secs(30))
        .map_err(DownloadError::curl)?;
    easy.low_speed_limit(1024).map_err(DownloadError::curl)?;
    easy.low_speed_time(Duration::from_secs(60))
        .map_err(DownloadError::curl)?;
    easy.timeout(Duration::from_secs(3600))
        .map_err(DownloadError::curl)?;

    let mut list = curl::easy::List::new();
    for (k, v) in custom_headers {
        list.append(&format!("{}: {}", k.trim(), v.trim()))
            .map_err(DownloadError::curl)?;
    }
    if !custom_headers.is_empty() {
        easy.http_headers(list).map_err(DownloadError::curl)?;
    }

    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(move |line| {
                if let Some(d) = super::parse_retry_after_header(line) {
                    *retry_after_cb.lock().unwrap() = Some(d);
                }
                true
            })
            .map_err(DownloadError::curl)?;
        transfer
            .write_function(move |data| {
                if cancelled_cb.load(Ordering::Relaxed) {
                    return Ok(0);
                }
                limiter.consume(data.len() as u64);
                let off = written_cb.fetch_add(data.len() as u64, Ordering::Relaxed);
                match storage.write_at(resume_offset + off, data) {
                    Ok(()) => {
                        on_bytes(data.len() as u64);
                        Ok(data.len())
                    }
                    Err(e) => {
                        tracing::warn!("single download write failed: {}", e);
                        Ok(0)
                    }
                }
            })
            .map_err(DownloadError::curl)?;
        if let Err(e) = transfer.perform() {
            if cancel.load(Ordering::Relaxed) {
                return Err(DownloadError::Cancelled);
            }
            return Err(DownloadError::curl(e));
        }
    }

    let code = easy.response_code().map_err(DownloadError::curl)?;
    if !(200..300).contains(&code) {
        let retry_after = retry_after.lock().unwrap().take();
        return Err(DownloadError::Http { code: code as u32, retry_after });
    }

    let written_len = written.load(Ordering::Relaxed);
    if let Some(exp) = expected_len {
        let expected_this_call = exp.saturating_sub(resume_offset);
        if written_len != expected_this_call {
            return Err(DownloadError::PartialTransfer {
                expected: expected_this_call,
                received: written_len,
            });
        }
    }
    Ok(written_len)
}
