//! Engine-wide error kind taxonomy and retry classification.
//!
//! This is the single source of truth for "what kind of failure was this and
//! is it worth retrying" — segment downloads, probes, storage, and the
//! scheduler all report into this enum rather than inventing their own.

use std::fmt;

/// Coarse-grained error classification shared by every layer of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// DNS, TCP, TLS handshake, or connection reset.
    Network,
    /// Connect or read timed out.
    Timeout,
    /// 5xx response.
    Http5xx,
    /// 429 Too Many Requests.
    Http429,
    /// 408 Request Timeout.
    Http408,
    /// Any other non-2xx, non-206 status.
    Http4xxOther,
    /// Unexpected headers or body framing (e.g. malformed Content-Range).
    Protocol,
    /// The prober could not determine size or range support.
    Unsupported,
    /// Local disk write failed (not disk-full specifically).
    IoWrite,
    /// Local disk write failed because the device is full.
    DiskFull,
    /// Final SHA-256 did not match the expected digest.
    ChecksumMismatch,
    /// Operation was cancelled cooperatively.
    Cancelled,
    /// A component violated its own contract (e.g. malformed progress callback).
    ContractViolation,
    /// Bad configuration or an invalid snapshot.
    Validation,
}

impl ErrorKind {
    /// Whether the scheduler should retry a task that failed with this kind.
    ///
    /// Per the retry classification: NETWORK, TIMEOUT, HTTP_5XX, HTTP_429,
    /// HTTP_408, and IO_WRITE are transient; everything else is terminal.
    /// CHECKSUM_MISMATCH is explicitly terminal: it signals corruption or an
    /// unstable remote resource, neither of which a bare retry fixes.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::Http5xx
                | ErrorKind::Http429
                | ErrorKind::Http408
                | ErrorKind::IoWrite
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "NETWORK",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Http5xx => "HTTP_5XX",
            ErrorKind::Http429 => "HTTP_429",
            ErrorKind::Http408 => "HTTP_408",
            ErrorKind::Http4xxOther => "HTTP_4XX_OTHER",
            ErrorKind::Protocol => "PROTOCOL",
            ErrorKind::Unsupported => "UNSUPPORTED",
            ErrorKind::IoWrite => "IO_WRITE",
            ErrorKind::DiskFull => "DISK_FULL",
            ErrorKind::ChecksumMismatch => "CHECKSUM_MISMATCH",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::ContractViolation => "CONTRACT_VIOLATION",
            ErrorKind::Validation => "VALIDATION",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an HTTP status code into an `ErrorKind`. Only meaningful for
/// non-2xx/206 statuses; callers must check the status range first.
pub fn classify_http_status(code: u32) -> ErrorKind {
    match code {
        408 => ErrorKind::Http408,
        429 => ErrorKind::Http429,
        500..=599 => ErrorKind::Http5xx,
        400..=499 => ErrorKind::Http4xxOther,
        _ => ErrorKind::Protocol,
    }
}

/// Classify a curl transport error into an `ErrorKind`.
pub fn classify_curl_error(e: &curl::Error) -> ErrorKind {
    if e.is_operation_timedout() {
        return ErrorKind::Timeout;
    }
    if e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
        || e.is_send_fail_rewind()
    {
        return ErrorKind::Network;
    }
    ErrorKind::Protocol
}

/// Classify a local I/O error arising from a storage write.
pub fn classify_io_error(e: &std::io::Error) -> ErrorKind {
    if e.raw_os_error() == Some(libc_enospc()) {
        return ErrorKind::DiskFull;
    }
    ErrorKind::IoWrite
}

#[cfg(unix)]
fn libc_enospc() -> i32 {
    libc::ENOSPC
}

#[cfg(not(unix))]
fn libc_enospc() -> i32 {
    28 // ENOSPC on most non-unix targets we care about; best-effort only.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_classification_table() {
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Http5xx.is_retryable());
        assert!(ErrorKind::Http429.is_retryable());
        assert!(ErrorKind::Http408.is_retryable());
        assert!(ErrorKind::IoWrite.is_retryable());
        assert!(!ErrorKind::ChecksumMismatch.is_retryable());
        assert!(!ErrorKind::Http4xxOther.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::ContractViolation.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Unsupported.is_retryable());
        assert!(!ErrorKind::Protocol.is_retryable());
        assert!(!ErrorKind::DiskFull.is_retryable());
    }

    #[test]
    fn http_status_classification() {
        assert_eq!(classify_http_status(408), ErrorKind::Http408);
        assert_eq!(classify_http_status(429), ErrorKind::Http429);
        assert_eq!(classify_http_status(500), ErrorKind::Http5xx);
        assert_eq!(classify_http_status(503), ErrorKind::Http5xx);
        assert_eq!(classify_http_status(404), ErrorKind::Http4xxOther);
        assert_eq!(classify_http_status(403), ErrorKind::Http4xxOther);
    }
}
