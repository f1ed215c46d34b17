//! Multi-Connection Coordinator (C4, §4.4).
//!
//! Given a probed resource and a destination path, decides single-stream vs.
//! segmented mode, plans segments, loads or creates a resume record, runs the
//! transfer, verifies the result, and commits it atomically. `run::download`
//! is the public entrypoint; everything else in this module is the machinery
//! it composes.

mod run;
mod segment;
mod single;

use std::path::Path;
use std::time::Duration;

use crate::errors::ErrorKind;
use crate::fetch_head::HeadResult;
use crate::safe_resume::ValidationError;

pub use run::{download, DownloadOutcome, DownloadRequest};

/// Minimum granularity at which a download is split into segments, matching
/// §4.4's default `min_segment_size_bytes`.
pub const DEFAULT_MIN_SEGMENT_SIZE: u64 = 1024 * 1024;

/// Below this size (or when ranges aren't supported) a download runs single-stream.
pub const DEFAULT_MULTI_CONNECTION_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Decision made once per download: single GET, or N concurrent ranged GETs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    Single,
    Multi { segment_count: usize },
}

/// The tunables the coordinator needs to pick a mode and a segment count;
/// kept separate from `DdmConfig` so this module doesn't need the whole
/// config type in scope.
#[derive(Debug, Clone, Copy)]
pub struct ModeSelection {
    pub multi_connection_threshold_bytes: u64,
    pub min_segment_size_bytes: u64,
    pub max_connections: usize,
}

impl ModeSelection {
    /// Chooses single-stream when ranges aren't supported, the file is too
    /// small, or only one connection is allowed; otherwise splits into up to
    /// `max_connections` segments, never smaller than `min_segment_size_bytes`.
    pub fn choose(&self, total_size: u64, range_support: bool) -> DownloadMode {
        if self.max_connections <= 1 || !range_support || total_size < self.multi_connection_threshold_bytes {
            return DownloadMode::Single;
        }
        let min_segment = self.min_segment_size_bytes.max(1);
        let by_size = ((total_size + min_segment - 1) / min_segment).max(1) as usize;
        let segment_count = self.max_connections.min(by_size).max(1);
        DownloadMode::Multi { segment_count }
    }
}

/// Error surfaced by the coordinator. Classified the same way as
/// `retry::SegmentError` so the scheduler can make one retry decision for
/// both single- and multi-segment failures.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Curl(curl::Error),
    #[error("HTTP {code}")]
    Http {
        code: u32,
        /// Parsed `Retry-After` response header, when the server sent one.
        retry_after: Option<Duration>,
    },
    #[error("partial transfer: expected {expected} bytes, got {received}")]
    PartialTransfer { expected: u64, received: u64 },
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("remote resource changed since last run: {0}")]
    ResourceChanged(#[from] ValidationError),
    #[error("probe failed: {0}")]
    Probe(#[source] anyhow::Error),
    #[error("setup failed: {0}")]
    Setup(#[source] anyhow::Error),
    #[error("cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Adapter for `.map_err(DownloadError::curl)` call sites in `single.rs`.
    pub(crate) fn curl(e: curl::Error) -> Self {
        DownloadError::Curl(e)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::Curl(e) => crate::errors::classify_curl_error(e),
            DownloadError::Http { code, .. } => crate::errors::classify_http_status(*code),
            DownloadError::PartialTransfer { .. } => ErrorKind::Network,
            DownloadError::Storage(e) => crate::errors::classify_io_error(e),
            DownloadError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            DownloadError::ResourceChanged(_) => ErrorKind::Validation,
            DownloadError::Probe(_) => ErrorKind::Network,
            DownloadError::Setup(_) => ErrorKind::IoWrite,
            DownloadError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// The server's `Retry-After` hint, if this failure carried one. Plumbed
    /// through to the scheduler's retry decision (§8's 429 boundary behavior).
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DownloadError::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<crate::retry::SegmentError> for DownloadError {
    fn from(e: crate::retry::SegmentError) -> Self {
        use crate::retry::SegmentError as SE;
        match e {
            SE::Curl(e) => DownloadError::Curl(e),
            SE::Http { code, retry_after } => DownloadError::Http { code, retry_after },
            SE::PartialTransfer { expected, received } => {
                DownloadError::PartialTransfer { expected, received }
            }
            SE::Storage(e) => DownloadError::Storage(e),
            SE::Cancelled => DownloadError::Cancelled,
        }
    }
}

/// Parses an HTTP `Retry-After` header line (as delivered by curl's header
/// callback, including the trailing CRLF) when it carries a delta-seconds
/// value. The HTTP-date form is not parsed.
pub(super) fn parse_retry_after_header(line: &[u8]) -> Option<Duration> {
    let text = std::str::from_utf8(line).ok()?;
    let (name, value) = text.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case("retry-after") {
        return None;
    }
    let seconds: u64 = value.trim().parse().ok()?;
    Some(Duration::from_secs(seconds))
}

/// Decides whether a file already sitting at `destination` (no resume record)
/// matches a freshly probed `HeadResult` by size alone, so a repeated request
/// for a file that's already fully there can short-circuit instead of
/// re-fetching. Not currently invoked by `run::download`; kept as the natural
/// extension point if that case is picked up later.
pub(crate) fn destination_matches(destination: &Path, head: &HeadResult) -> bool {
    let Ok(meta) = std::fs::metadata(destination) else {
        return false;
    };
    match head.content_length {
        Some(len) => meta.len() == len,
        None => false,
    }
}
