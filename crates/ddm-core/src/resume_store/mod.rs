//! Resume State Store (C5, §4.5): persists and restores per-destination
//! download progress so a restart can skip segments that are already
//! complete.
//!
//! One `ResumeRecord` lives alongside its destination path, at
//! `<final>.resume`. Writes are atomic: serialize to a sibling temp file,
//! fsync, then rename over the real path, mirroring `storage`'s
//! create-then-finalize pattern for the download files themselves. Ownership
//! is exclusive to one coordinator per destination; concurrent writers from
//! two coordinators for the same path is a contract violation the store does
//! not attempt to arbitrate.

mod record;

pub use record::{ResumeRecord, SegmentResumeState, SCHEMA_VERSION};

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Suffix appended to a destination path to get its resume record path.
pub const RESUME_SUFFIX: &str = ".resume";

/// Path of the resume record for a given final destination path.
pub fn resume_path(destination: &Path) -> PathBuf {
    let mut o = destination.as_os_str().to_owned();
    o.push(RESUME_SUFFIX);
    PathBuf::from(o)
}

/// File-backed store for `ResumeRecord`s, keyed by destination path.
///
/// Stateless beyond the filesystem itself; cheap to construct per use.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResumeStore;

impl ResumeStore {
    pub fn new() -> Self {
        ResumeStore
    }

    /// Atomically write `record` to `<destination>.resume`.
    ///
    /// Rejects a malformed segment table rather than persisting it: a
    /// corrupt resume record is worse than none, since it would claim a
    /// restart is safe when it isn't.
    pub fn save(&self, destination: &Path, record: &ResumeRecord) -> Result<()> {
        if !record.is_well_formed() {
            anyhow::bail!(
                "refusing to save resume record for {}: segment table is not a clean partition",
                destination.display()
            );
        }

        let final_path = resume_path(destination);
        let tmp_path = {
            let mut o = final_path.as_os_str().to_owned();
            o.push(".tmp");
            PathBuf::from(o)
        };

        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let json = serde_json::to_vec_pretty(record).context("failed to serialize resume record")?;
        {
            let mut f = std::fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            f.write_all(&json)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;
        Ok(())
    }

    /// Load the resume record for `destination`, if one exists and is valid.
    ///
    /// Returns `Ok(None)` both when no record exists and when one exists but
    /// fails to parse or fails `is_well_formed` — a corrupt record is logged
    /// and discarded rather than propagated, so the caller falls back to a
    /// fresh download plan exactly as if no record had ever been written.
    pub fn load(&self, destination: &Path) -> Result<Option<ResumeRecord>> {
        let path = resume_path(destination);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context(format!("failed to read {}", path.display())),
        };

        let record: ResumeRecord = match serde_json::from_slice(&bytes) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "discarding unparseable resume record");
                return Ok(None);
            }
        };

        if record.schema_version != SCHEMA_VERSION {
            tracing::warn!(
                path = %path.display(),
                found = record.schema_version,
                expected = SCHEMA_VERSION,
                "discarding resume record with unsupported schema version"
            );
            return Ok(None);
        }

        if !record.is_well_formed() {
            tracing::warn!(path = %path.display(), "discarding resume record with malformed segment table");
            return Ok(None);
        }

        Ok(Some(record))
    }

    /// Remove the resume record for `destination`, if any. Called after a
    /// successful commit or an explicit restart.
    pub fn delete(&self, destination: &Path) -> Result<()> {
        let path = resume_path(destination);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(format!("failed to remove {}", path.display())),
        }
    }
}
