//! The coordinator's public entrypoint: probe, pick a mode, plan segments,
//! load or create a resume record, run the transfer, verify, and commit.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::checksum;
use crate::fetch_head::{self, HeadResult};
use crate::resume_store::{ResumeRecord, ResumeStore};
use crate::retry::RetryPolicy;
use crate::safe_resume::validate_for_resume;
use crate::segmenter::{plan_segments, Segment};
use crate::storage::{self, StorageWriter, StorageWriterBuilder};
use crate::token_bucket::LimiterChain;

use super::{segment, single, DownloadError, DownloadMode, ModeSelection};

/// The four keys the external progress-callback contract (§4.4) requires,
/// and nothing else. Built by `progress_payload`, never by a caller, so a
/// `CONTRACT_VIOLATION` here would mean a bug in this module, not bad input.
const PROGRESS_CALLBACK_KEYS: &[&str] = &["filename", "progress", "speed", "status"];

/// Checks that `value` has exactly the required keys with the expected
/// semantic types. The coordinator calls this before every invocation of a
/// registered UI progress callback; a failure here is logged as
/// `PROGRESS_CALLBACK_INVALID` and the callback is skipped rather than
/// handed a malformed payload.
pub fn validate_progress_payload(value: &Value) -> Result<(), &'static str> {
    let obj = value.as_object().ok_or("not an object")?;
    for key in PROGRESS_CALLBACK_KEYS {
        let v = obj.get(*key).ok_or(*key)?;
        let ok = match *key {
            "filename" | "speed" | "status" => v.is_string(),
            "progress" => v.is_number(),
            _ => true,
        };
        if !ok {
            return Err(key);
        }
    }
    Ok(())
}

fn progress_payload(filename: &str, fraction: f64, speed_bps: f64, status: &str) -> Value {
    json!({
        "filename": filename,
        "progress": fraction.clamp(0.0, 1.0),
        "speed": human_rate(speed_bps),
        "status": status,
    })
}

fn human_rate(bps: f64) -> String {
    const UNITS: &[&str] = &["B/s", "KiB/s", "MiB/s", "GiB/s"];
    let mut value = bps.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

type UiProgressCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Everything the coordinator needs for one download, gathered up front so
/// nothing in the transfer path has to reach back out to config or the queue.
pub struct DownloadRequest {
    pub url: String,
    pub custom_headers: HashMap<String, String>,
    pub destination: PathBuf,
    pub mode_selection: ModeSelection,
    pub retry_policy: RetryPolicy,
    pub limiter: Arc<LimiterChain>,
    pub cancel: Arc<AtomicBool>,
    /// Expected SHA-256 digest, if the caller wants post-download verification
    /// against a known-good value (independent of the digest this call
    /// always computes and reports in `DownloadOutcome::sha256`).
    pub verify_sha256: Option<String>,
    /// Called with the length of each chunk as it lands, for progress reporting.
    pub on_bytes: Arc<dyn Fn(u64) + Send + Sync>,
    /// Optional external progress hook matching the §4.4 callback contract:
    /// invoked on a throttled cadence with `{filename, progress, speed,
    /// status}`, validated before every call.
    pub ui_progress: Option<UiProgressCallback>,
    /// How often `ui_progress` fires. Default cadence per §4.4 is 250ms.
    pub ui_progress_interval: Duration,
}

/// Result of a completed, committed download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub mode: DownloadMode,
    pub connections_used: usize,
    pub bytes_downloaded: u64,
    pub total_size: Option<u64>,
    pub throttle_events: u32,
    pub error_events: u32,
    /// SHA-256 of the committed file, always computed on success.
    pub sha256: String,
}

impl DownloadOutcome {
    pub fn mode_str(&self) -> &'static str {
        match self.mode {
            DownloadMode::Single => "single",
            DownloadMode::Multi { .. } => "multi",
        }
    }
}

/// Runs a download end to end: HEAD probe, mode selection, segment planning,
/// resume-record load/validate or fresh creation, concurrent or single-stream
/// transfer, checksum verification, and atomic commit.
///
/// On success the resume record for `destination` (if any) is deleted; on
/// failure it is left in place so a subsequent call can resume.
pub fn download(req: &DownloadRequest) -> Result<DownloadOutcome, DownloadError> {
    let probe = fetch_head::probe(&req.url, &req.custom_headers).map_err(DownloadError::Probe)?;

    let mode = req
        .mode_selection
        .choose(probe.content_length.unwrap_or(0), probe.accept_ranges);

    let resume_store = ResumeStore::new();
    let temp_path = storage::temp_path(&req.destination);

    match mode {
        DownloadMode::Multi { segment_count } => {
            run_multi(req, &probe, segment_count, &resume_store, &temp_path)
        }
        DownloadMode::Single => run_single(req, &probe, &temp_path),
    }
}

fn filename_for_ui(req: &DownloadRequest) -> String {
    req.destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| req.url.clone())
}

/// Spawns the §4.4 UI-progress ticker, if `req.ui_progress` is set. Returns a
/// stop flag the caller must set (and a handle to join) once the transfer is
/// done, so the ticker doesn't fire after the callback is no longer meaningful.
fn spawn_ui_ticker(
    req: &DownloadRequest,
    bytes_downloaded: Arc<AtomicU64>,
    total_size: Option<u64>,
) -> Option<(Arc<AtomicBool>, std::thread::JoinHandle<()>)> {
    let cb = req.ui_progress.clone()?;
    let stop = Arc::new(AtomicBool::new(false));
    let stop_cb = Arc::clone(&stop);
    let filename = filename_for_ui(req);
    let interval = req.ui_progress_interval;
    let start = Instant::now();
    let handle = std::thread::spawn(move || {
        while !stop_cb.load(Ordering::Relaxed) {
            let jitter = Duration::from_millis(fastrand_jitter_ms(interval.as_millis() as u64 / 5));
            std::thread::sleep(interval + jitter);
            if stop_cb.load(Ordering::Relaxed) {
                break;
            }
            let done = bytes_downloaded.load(Ordering::Relaxed);
            let fraction = match total_size {
                Some(total) if total > 0 => done as f64 / total as f64,
                _ => 0.0,
            };
            let elapsed = start.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 { done as f64 / elapsed } else { 0.0 };
            let payload = progress_payload(&filename, fraction, speed, "downloading");
            if let Err(bad_key) = validate_progress_payload(&payload) {
                tracing::error!(key = bad_key, "PROGRESS_CALLBACK_INVALID");
                continue;
            }
            cb(payload);
        }
    });
    Some((stop, handle))
}

fn fastrand_jitter_ms(max: u64) -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    if max == 0 {
        return 0;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos as u64) % max
}

fn run_single(
    req: &DownloadRequest,
    probe: &HeadResult,
    temp_path: &std::path::Path,
) -> Result<DownloadOutcome, DownloadError> {
    let storage = StorageWriterBuilder::create(temp_path)
        .map_err(DownloadError::Setup)?
        .build();
    let bytes_downloaded = Arc::new(AtomicU64::new(0));
    let bytes_cb = Arc::clone(&bytes_downloaded);
    let on_bytes = Arc::clone(&req.on_bytes);

    let ticker = spawn_ui_ticker(req, Arc::clone(&bytes_downloaded), probe.content_length);

    // One attempt, no internal retry: a failure here is surfaced to the
    // scheduler, which owns the retry/backoff decision.
    let written = single::download_single(
        &req.url,
        &req.custom_headers,
        &storage,
        0,
        probe.content_length,
        &req.limiter,
        &req.cancel,
        &{
            let bytes_cb = Arc::clone(&bytes_cb);
            let on_bytes = Arc::clone(&on_bytes);
            move |n: u64| {
                bytes_cb.fetch_add(n, Ordering::Relaxed);
                on_bytes(n);
            }
        },
    );

    if let Some((stop, handle)) = ticker {
        stop.store(true, Ordering::Relaxed);
        let _ = handle.join();
    }
    let written = written?;

    storage.sync().map_err(DownloadError::Setup)?;
    drop(storage);
    let sha256 = verify_and_commit(req, temp_path, written)?;

    Ok(DownloadOutcome {
        mode: DownloadMode::Single,
        connections_used: 1,
        bytes_downloaded: written,
        total_size: probe.content_length,
        throttle_events: 0,
        error_events: 0,
        sha256,
    })
}

fn run_multi(
    req: &DownloadRequest,
    probe: &HeadResult,
    segment_count: usize,
    resume_store: &ResumeStore,
    temp_path: &std::path::Path,
) -> Result<DownloadOutcome, DownloadError> {
    let total_size = probe.content_length.unwrap_or(0);

    let existing = resume_store
        .load(&req.destination)
        .map_err(DownloadError::Probe)?;
    let record = match existing {
        Some(r) => {
            validate_for_resume(&r, probe)?;
            r
        }
        None => {
            let plan = plan_segments(total_size, segment_count);
            ResumeRecord::new(
                req.url.clone(),
                total_size,
                probe.etag.clone(),
                probe.last_modified.clone(),
                &plan,
            )
        }
    };
    let record = Arc::new(Mutex::new(record));

    let storage = if temp_path.exists() {
        StorageWriter::open_existing(temp_path)?
    } else {
        let mut builder = StorageWriterBuilder::create(temp_path)?;
        builder.preallocate(total_size)?;
        builder.build()
    };

    let pending: VecDeque<usize> = {
        let r = record.lock().unwrap();
        r.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_complete())
            .map(|(i, _)| i)
            .collect()
    };

    let bytes_downloaded_atomic = Arc::new(AtomicU64::new(record.lock().unwrap().bytes_downloaded()));
    let ticker = spawn_ui_ticker(req, Arc::clone(&bytes_downloaded_atomic), probe.content_length);

    let (error_events, throttle_events) = run_segments_concurrently(
        req,
        &storage,
        &record,
        pending,
        resume_store,
        &bytes_downloaded_atomic,
    );

    if let Some((stop, handle)) = ticker {
        stop.store(true, Ordering::Relaxed);
        let _ = handle.join();
    }
    let (error_events, throttle_events) = (error_events?, throttle_events);
    let _ = throttle_events;

    storage.sync()?;

    let bytes_downloaded = record.lock().unwrap().bytes_downloaded();
    let sha256 = verify_and_commit(req, temp_path, bytes_downloaded)?;
    resume_store
        .delete(&req.destination)
        .map_err(DownloadError::Probe)?;

    Ok(DownloadOutcome {
        mode: DownloadMode::Multi { segment_count },
        connections_used: segment_count,
        bytes_downloaded,
        total_size: probe.content_length,
        throttle_events,
        error_events: 0,
        sha256,
    })
}

/// Runs segments with a worker-per-connection pool, bounded by
/// `mode_selection.max_connections`. Returns `(error_events, throttle_events)`
/// on success; on the first terminal failure, signals the rest of the pool to
/// stop and returns that error once all workers have joined.
fn run_segments_concurrently(
    req: &DownloadRequest,
    storage: &StorageWriter,
    record: &Arc<Mutex<ResumeRecord>>,
    pending: VecDeque<usize>,
    resume_store: &ResumeStore,
    bytes_downloaded_atomic: &Arc<AtomicU64>,
) -> (Result<u32, DownloadError>, u32) {
    let work = Arc::new(Mutex::new(pending));
    let num_workers = req.mode_selection.max_connections.max(1).min(
        record
            .lock()
            .unwrap()
            .segments
            .len()
            .max(1),
    );
    let (tx, rx) = mpsc::channel();
    let mut to_receive = work.lock().unwrap().len();
    let initial_to_receive = to_receive;

    let mut handles = Vec::with_capacity(num_workers);
    for _ in 0..num_workers {
        let work = Arc::clone(&work);
        let url = req.url.clone();
        let headers = req.custom_headers.clone();
        let storage = storage.clone();
        let limiter = Arc::clone(&req.limiter);
        let cancel = Arc::clone(&req.cancel);
        let record = Arc::clone(record);
        let on_bytes = Arc::clone(&req.on_bytes);
        let bytes_downloaded_atomic = Arc::clone(bytes_downloaded_atomic);
        let tx = tx.clone();
        let resume_store = *resume_store;
        let destination = req.destination.clone();

        handles.push(std::thread::spawn(move || loop {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            let index = match work.lock().unwrap().pop_front() {
                Some(i) => i,
                None => break,
            };
            let (segment, resume_offset) = {
                let r = record.lock().unwrap();
                let s = &r.segments[index];
                (Segment { start: s.start, end: s.end }, s.bytes_written)
            };

            // One attempt, no internal retry: the first retryable segment
            // failure is surfaced to the scheduler, which owns backoff/retry.
            let result = segment::download_one_segment(
                &url,
                &headers,
                &segment,
                resume_offset,
                &storage,
                &limiter,
                &cancel,
                &{
                    let bytes_downloaded_atomic = Arc::clone(&bytes_downloaded_atomic);
                    let on_bytes = Arc::clone(&on_bytes);
                    move |n: u64| {
                        bytes_downloaded_atomic.fetch_add(n, Ordering::Relaxed);
                        on_bytes(n);
                    }
                },
            );

            if result.is_ok() {
                let mut r = record.lock().unwrap();
                r.advance_segment(index, segment.len());
                let _ = resume_store.save(&destination, &r);
            }
            let _ = tx.send((index, result));
        }));
    }
    drop(tx);

    let mut first_error: Option<DownloadError> = None;
    let mut error_events = 0u32;
    let mut throttle_events = 0u32;

    while to_receive > 0 {
        let (_index, result) = match rx.recv() {
            Ok(pair) => pair,
            Err(_) => break,
        };
        to_receive -= 1;
        if let Err(e) = result {
            if e.kind() == crate::errors::ErrorKind::Http429 {
                throttle_events += 1;
            } else {
                error_events += 1;
            }
            if first_error.is_none() {
                req.cancel.store(true, Ordering::Relaxed);
                first_error = Some(e.into());
            }
        }
    }
    let _ = initial_to_receive;

    for h in handles {
        let _ = h.join();
    }

    match first_error {
        Some(e) => (Err(e), throttle_events),
        None => (Ok(error_events), throttle_events),
    }
}

/// Computes the SHA-256 of the committed file (always, per §4.4's
/// contract that `info.sha256` is present on success), optionally checking
/// it against `req.verify_sha256` before the rename, then performs the
/// atomic commit.
fn verify_and_commit(
    req: &DownloadRequest,
    temp_path: &std::path::Path,
    _bytes_downloaded: u64,
) -> Result<String, DownloadError> {
    tracing::info!("HASH | START");
    let actual = checksum::sha256_path(temp_path)?;
    if let Some(expected) = &req.verify_sha256 {
        if &actual != expected {
            return Err(DownloadError::ChecksumMismatch {
                expected: expected.clone(),
                actual,
            });
        }
    }
    tracing::info!(sha256 = %actual, "HASH | FINAL_OK");
    tracing::info!(temp = %temp_path.display(), "ATOMIC | START");
    std::fs::rename(temp_path, &req.destination)?;
    tracing::info!(final_path = %req.destination.display(), "ATOMIC | COMMIT_OK");
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_payload_has_exactly_the_required_keys() {
        let payload = progress_payload("file.iso", 0.5, 1_048_576.0, "downloading");
        assert!(validate_progress_payload(&payload).is_ok());
        assert_eq!(payload["filename"], "file.iso");
        assert_eq!(payload["status"], "downloading");
    }

    #[test]
    fn missing_key_is_rejected() {
        let mut payload = progress_payload("file.iso", 0.5, 0.0, "downloading");
        payload.as_object_mut().unwrap().remove("speed");
        assert_eq!(validate_progress_payload(&payload), Err("speed"));
    }

    #[test]
    fn human_rate_picks_unit() {
        assert_eq!(human_rate(512.0), "512.0 B/s");
        assert_eq!(human_rate(2048.0), "2.0 KiB/s");
    }
}
