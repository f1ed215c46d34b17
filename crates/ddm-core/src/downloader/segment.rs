//! Single-segment HTTP Range GET and write to storage (C3, §4.3).

use crate::retry::SegmentError;
use crate::segmenter::Segment;
use crate::storage::StorageWriter;
use crate::token_bucket::LimiterChain;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Result of a single segment download (used for retry classification).
pub(super) type SegmentResult = Result<(), SegmentError>;

/// Downloads the unwritten tail of a segment: GET with `Range: bytes=<start+resume_offset>-<end-1>`,
/// writing each chunk to storage at its absolute offset.
///
/// `resume_offset` bytes at the front of the segment are assumed already
/// written (from a prior run) and are not re-requested. `on_bytes` is called
/// with the length of each chunk as it lands, for progress reporting; it
/// must not block. `cancel` is polled between chunks — observed with the
/// same latency as libcurl's write callback cadence, comfortably under the
/// 100ms bound for any link that isn't pathologically slow.
pub(super) fn download_one_segment(
    url: &str,
    custom_headers: &HashMap<String, String>,
    segment: &Segment,
    resume_offset: u64,
    storage: &StorageWriter,
    limiter: &LimiterChain,
    cancel: &Arc<AtomicBool>,
    on_bytes: &(dyn Fn(u64) + Send + Sync),
) -> SegmentResult {
    if resume_offset >= segment.len() {
        return Ok(());
    }
    if cancel.load(Ordering::Relaxed) {
        return Err(SegmentError::Cancelled);
    }

    let bytes_written = Arc::new(AtomicU64::new(0));
    let bytes_written_in_cb = Arc::clone(&bytes_written);
    let storage_error: Arc<Mutex<Option<std::io::Error>>> = Arc::new(Mutex::new(None));
    let storage_error_cb = Arc::clone(&storage_error);
    let retry_after: Arc<Mutex<Option<Duration>>> = Arc::new(Mutex::new(None));
    let retry_after_cb = Arc::clone(&retry_after);
    let cancelled_cb = Arc::clone(cancel);
    let write_start = segment.start + resume_offset;
    let storage = storage.clone();

    let mut easy = curl::easy::Easy::new();
    easy.url(url).map_err(SegmentError::Curl)?;
    easy.follow_location(true).map_err(SegmentError::Curl)?;
    easy.connect_timeout(Duration::from_secs(30))
        .map_err(SegmentError::Curl)?;
    // Prefer low-speed timeout: abort if throughput drops below 1 KiB/s for 60s.
    // Keeps large segments on slow links from being killed by a hard wall-clock timeout.
    easy.low_speed_limit(1024).map_err(SegmentError::Curl)?;
    easy.low_speed_time(Duration::from_secs(60))
        .map_err(SegmentError::Curl)?;
    // Safety net: hard timeout after 1 hour so a completely stuck transfer eventually fails.
    easy.timeout(Duration::from_secs(3600))
        .map_err(SegmentError::Curl)?;

    let range_str = format!("{}-{}", write_start, segment.end.saturating_sub(1));
    easy.range(&range_str).map_err(SegmentError::Curl)?;

    let mut list = curl::easy::List::new();
    for (k, v) in custom_headers {
        list.append(&format!("{}: {}", k.trim(), v.trim()))
            .map_err(SegmentError::Curl)?;
    }
    if !custom_headers.is_empty() {
        easy.http_headers(list).map_err(SegmentError::Curl)?;
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
            .map_err(SegmentError::Curl)?;
        transfer
            .write_function(move |data| {
                if cancelled_cb.load(Ordering::Relaxed) {
                    return Ok(0); // aborts the transfer with CURLE_WRITE_ERROR
                }
                limiter.consume(data.len() as u64);
                let off = bytes_written_in_cb.fetch_add(data.len() as u64, Ordering::Relaxed);
                match storage.write_at(write_start + off, data) {
                    Ok(()) => {
                        on_bytes(data.len() as u64);
                        Ok(data.len())
                    }
                    Err(e) => {
                        let io_err = e.downcast::<std::io::Error>().unwrap_or_else(|e| {
                            std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
                        });
                        let _ = storage_error_cb.lock().unwrap().replace(io_err);
                        Ok(0)
                    }
                }
            })
            .map_err(SegmentError::Curl)?;
        let perform_result = transfer.perform();
        if let Err(e) = perform_result {
            if e.is_write_error() {
                if let Some(io_err) = storage_error.lock().unwrap().take() {
                    return Err(SegmentError::Storage(io_err));
                }
                if cancel.load(Ordering::Relaxed) {
                    return Err(SegmentError::Cancelled);
                }
            }
            return Err(SegmentError::Curl(e));
        }
    }

    let code = easy.response_code().map_err(SegmentError::Curl)? as u32;
    if code < 200 || code >= 300 {
        let retry_after = retry_after.lock().unwrap().take();
        return Err(SegmentError::Http { code, retry_after });
    }

    let received = bytes_written.load(Ordering::Relaxed);
    let expected = segment.len() - resume_offset;
    if received != expected {
        return Err(SegmentError::PartialTransfer { expected, received });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_complete_segment_is_a_no_op() {
        let segment = Segment { start: 0, end: 100 };
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("out.part");
        let mut builder = crate::storage::StorageWriterBuilder::create(&tmp).unwrap();
        builder.preallocate(100).unwrap();
        let storage = builder.build();
        let cancel = Arc::new(AtomicBool::new(false));
        let limiter = LimiterChain::none();
        let result = download_one_segment(
            "http://unused.invalid/",
            &HashMap::new(),
            &segment,
            100,
            &storage,
            &limiter,
            &cancel,
            &|_| {},
        );
        assert!(result.is_ok());
    }

    #[test]
    fn cancelled_before_start_returns_cancelled() {
        let segment = Segment { start: 0, end: 100 };
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("out.part");
        let mut builder = crate::storage::StorageWriterBuilder::create(&tmp).unwrap();
        builder.preallocate(100).unwrap();
        let storage = builder.build();
        let cancel = Arc::new(AtomicBool::new(true));
        let limiter = LimiterChain::none();
        let result = download_one_segment(
            "http://unused.invalid/",
            &HashMap::new(),
            &segment,
            0,
            &storage,
            &limiter,
            &cancel,
            &|_| {},
        );
        assert!(matches!(result, Err(SegmentError::Cancelled)));
    }
}
