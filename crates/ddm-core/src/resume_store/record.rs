//! The `ResumeRecord` data model (§4.5, §3): URL, declared size, and the
//! per-segment byte-written table that lets a restart skip completed work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::segmenter::Segment;

/// Current on-disk schema version. Bump when the record layout changes and
/// reject (rather than guess-migrate) anything written by a newer version.
pub const SCHEMA_VERSION: u32 = 1;

/// Bytes written for a single planned segment. `bytes_written` tracks only the
/// contiguous prefix of the segment that has been written so far: the
/// downloader always writes a segment front-to-back, so a prefix count is
/// sufficient to resume without an interior bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentResumeState {
    pub start: u64,
    pub end: u64,
    pub bytes_written: u64,
}

impl SegmentResumeState {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_written >= self.len()
    }

    /// The offset to resume writing from: `start + bytes_written`.
    pub fn resume_offset(&self) -> u64 {
        self.start + self.bytes_written
    }
}

/// Persisted download progress for one destination path. The segment table
/// must partition `[0, total_size)` exactly once with no gaps or overlaps;
/// this is checked in `ResumeStore::save` and on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub schema_version: u32,
    pub url: String,
    pub total_size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub segments: Vec<SegmentResumeState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResumeRecord {
    /// Build a fresh record for a newly planned download; all segments start
    /// at zero bytes written.
    pub fn new(
        url: String,
        total_size: u64,
        etag: Option<String>,
        last_modified: Option<String>,
        plan: &[Segment],
    ) -> Self {
        let now = Utc::now();
        ResumeRecord {
            schema_version: SCHEMA_VERSION,
            url,
            total_size,
            etag,
            last_modified,
            segments: plan
                .iter()
                .map(|s| SegmentResumeState {
                    start: s.start,
                    end: s.end,
                    bytes_written: 0,
                })
                .collect(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the segment table is a well-formed partition of `[0, total_size)`:
    /// sorted, contiguous, no gaps or overlaps, and ending exactly at `total_size`.
    pub fn is_well_formed(&self) -> bool {
        if self.segments.is_empty() {
            return self.total_size == 0;
        }
        let mut expected_start = 0u64;
        for seg in &self.segments {
            if seg.start != expected_start || seg.end <= seg.start {
                return false;
            }
            expected_start = seg.end;
        }
        expected_start == self.total_size
    }

    pub fn all_segments_complete(&self) -> bool {
        self.segments.iter().all(|s| s.is_complete())
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes_written).sum()
    }

    /// Record newly-written bytes at the front of `segment_index`'s remaining
    /// range. Called by the segment downloader as chunks land.
    pub fn advance_segment(&mut self, segment_index: usize, bytes_written: u64) {
        if let Some(seg) = self.segments.get_mut(segment_index) {
            seg.bytes_written = bytes_written.min(seg.len());
            self.updated_at = Utc::now();
        }
    }
}
