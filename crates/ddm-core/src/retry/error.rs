//! Segment download error type for retry classification.

use crate::errors::ErrorKind;
use std::fmt;
use std::time::Duration;

/// Error returned by a single segment download (curl failure, HTTP error, or storage failure).
/// Used so we can classify and decide retries before converting to anyhow.
#[derive(Debug)]
pub enum SegmentError {
    /// Curl reported an error (timeout, connection, etc.).
    Curl(curl::Error),
    /// HTTP response had a non-2xx, non-206 status, with the parsed
    /// `Retry-After` header when the server sent one.
    Http { code: u32, retry_after: Option<Duration> },
    /// Transfer completed but fewer bytes were written than the segment length
    /// (e.g. server closed early). Enables retry instead of silent corruption.
    PartialTransfer { expected: u64, received: u64 },
    /// Disk/storage write failed (e.g. disk full, permission denied).
    Storage(std::io::Error),
    /// The download was cancelled cooperatively between chunks.
    Cancelled,
}

impl SegmentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SegmentError::Curl(e) => crate::errors::classify_curl_error(e),
            SegmentError::Http { code, .. } => crate::errors::classify_http_status(*code),
            SegmentError::PartialTransfer { .. } => ErrorKind::Network,
            SegmentError::Storage(e) => crate::errors::classify_io_error(e),
            SegmentError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentError::Curl(e) => write!(f, "{}", e),
            SegmentError::Http { code, .. } => write!(f, "HTTP {}", code),
            SegmentError::PartialTransfer { expected, received } => {
                write!(f, "partial transfer: expected {} bytes, got {}", expected, received)
            }
            SegmentError::Storage(e) => write!(f, "storage: {}", e),
            SegmentError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for SegmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SegmentError::Curl(e) => Some(e),
            SegmentError::Storage(e) => Some(e),
            SegmentError::Http { .. } | SegmentError::PartialTransfer { .. } | SegmentError::Cancelled => None,
        }
    }
}
