//! Compares a stored resume record with a fresh HEAD result for safe resume.

mod error;

use crate::fetch_head::HeadResult;
use crate::resume_store::ResumeRecord;

pub use error::{ValidationError, ValidationErrorKind};

/// Returns Ok(()) if `record` can be safely resumed against the current HEAD result.
///
/// Resource stability is judged by matching ETag (strong) or Last-Modified and
/// declared size across the original probe and this fresh one; any mismatch
/// means the remote resource may have changed and the caller must require an
/// explicit override (e.g. `--force-restart`) before discarding progress.
pub fn validate_for_resume(record: &ResumeRecord, head: &HeadResult) -> Result<(), ValidationError> {
    let etag_changed = match (&record.etag, &head.etag) {
        (None, None) => false,
        (Some(a), Some(b)) => a != b,
        _ => true,
    };

    let last_modified_changed = match (&record.last_modified, &head.last_modified) {
        (None, None) => false,
        (Some(a), Some(b)) => a != b,
        _ => true,
    };

    let size_changed = match head.content_length {
        None => false,
        Some(head_len) => head_len != record.total_size,
    };

    if etag_changed || last_modified_changed || size_changed {
        return Err(ValidationError {
            kind: ValidationErrorKind::RemoteChanged {
                etag_changed,
                last_modified_changed,
                size_changed,
            },
        });
    }

    Ok(())
}
