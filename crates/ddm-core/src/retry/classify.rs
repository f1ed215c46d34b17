//! Classify segment errors into the engine-wide `ErrorKind` taxonomy.

use super::error::SegmentError;
use crate::errors::ErrorKind;

/// Classify a segment error (curl, HTTP, partial transfer, or storage) into an `ErrorKind`.
pub fn classify(e: &SegmentError) -> ErrorKind {
    e.kind()
}
