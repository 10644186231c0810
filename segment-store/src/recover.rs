//! Boot-time crash-finalize.
//!
//! A previous run that died mid-write leaves `.part` files on disk and
//! catalog rows with `is_complete = 0`. Recovery makes both sides coherent
//! again: every surviving row ends up complete, and every file either
//! becomes a playable segment or is set aside as `.corrupt`.

use std::path::{Path, PathBuf};

use catalog_store::{Catalog, EventKind};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::layout::{corrupt_path, strip_part_suffix, PART_SUFFIX};
use crate::writer::{path_str, SegmentStore};

/// What one recovery pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `.part` files repaired and renamed into place.
    pub repaired: u32,
    /// `.part` files set aside as `.corrupt`.
    pub corrupt: u32,
    /// `.part` files with no catalog row, unlinked.
    pub unregistered: u32,
    /// Incomplete catalog rows closed without a usable file.
    pub rows_without_file: u32,
}

fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Every regular file below `dir`; an absent directory is an empty list.
pub fn scan_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut files = Vec::new();
    if dir.is_dir() {
        walk_files(dir, &mut files)?;
    }
    Ok(files)
}

impl SegmentStore {
    /// Run crash-finalize over the whole recordings tree.
    pub fn recover(&self, catalog: &Catalog) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();

        for path in scan_files(&self.layout().recordings_dir())? {
            let is_part = path.extension().and_then(|e| e.to_str()) == Some(PART_SUFFIX);
            if !is_part {
                continue;
            }
            self.finalize_part(catalog, &path, &mut report);
        }

        // Rows the scan could not repair: the .part vanished, or the process
        // died between the rename and the close. Either way the row must not
        // stay open.
        for row in catalog.incomplete_segments()? {
            let final_path = PathBuf::from(&row.file_path);
            if final_path.is_file() {
                let size = std::fs::metadata(&final_path)?.len();
                let end = mp4_writer::last_media_time_ms(&final_path)
                    .ok()
                    .flatten()
                    .map(|ms| row.start_time + (ms / 1000) as i64)
                    .unwrap_or(row.start_time);
                catalog.close_segment(&row.file_path, end, size)?;
                info!(path = %row.file_path, "closed row for already-final file");
            } else {
                catalog.close_segment(&row.file_path, row.start_time, 0)?;
                catalog.log_event(
                    EventKind::RecordingCorrupt,
                    Some(&row.stream_name),
                    "recording lost in crash, no file recovered",
                    Some(&row.file_path),
                )?;
                report.rows_without_file += 1;
            }
        }

        if report != RecoveryReport::default() {
            info!(?report, "crash recovery finished");
        }
        Ok(report)
    }

    fn finalize_part(&self, catalog: &Catalog, part: &Path, report: &mut RecoveryReport) {
        let Some(final_path) = strip_part_suffix(part) else {
            return;
        };
        let Ok(final_str) = path_str(&final_path) else {
            return;
        };

        let row = match catalog.get_segment_by_path(final_str) {
            Ok(row) => row,
            Err(e) => {
                warn!(path = final_str, error = %e, "catalog lookup failed during recovery");
                return;
            }
        };

        let Some(row) = row else {
            // nothing references this file; it can never become a segment
            if let Err(e) = std::fs::remove_file(part) {
                warn!(path = %part.display(), error = %e, "failed to unlink unregistered part file");
            } else {
                report.unregistered += 1;
                info!(path = %part.display(), "unlinked part file with no catalog row");
            }
            return;
        };

        match mp4_writer::repair(part) {
            Ok(repaired) => {
                let end = mp4_writer::last_media_time_ms(part)
                    .ok()
                    .flatten()
                    .map(|ms| row.start_time + (ms / 1000) as i64)
                    .unwrap_or(row.start_time);
                if let Err(e) = std::fs::rename(part, &final_path) {
                    warn!(path = %part.display(), error = %e, "failed to rename repaired segment");
                    return;
                }
                if let Err(e) = catalog.close_segment(final_str, end, repaired.size) {
                    warn!(path = final_str, error = %e, "failed to close repaired segment row");
                    return;
                }
                let _ = catalog.log_event(
                    EventKind::RecordingStopped,
                    Some(&row.stream_name),
                    "segment finalized after crash",
                    Some(final_str),
                );
                report.repaired += 1;
            }
            Err(e) => {
                let aside = corrupt_path(&final_path);
                info!(path = %part.display(), error = %e, "segment unrepairable, setting aside");
                if let Err(rename_err) = std::fs::rename(part, &aside) {
                    warn!(path = %part.display(), error = %rename_err, "failed to set aside corrupt segment");
                    return;
                }
                // complete with size 0 so retention can reap the row later
                if let Err(close_err) = catalog.close_segment(final_str, row.start_time, 0) {
                    warn!(path = final_str, error = %close_err, "failed to mark corrupt segment row");
                    return;
                }
                let _ = catalog.log_event(
                    EventKind::RecordingCorrupt,
                    Some(&row.stream_name),
                    "segment unrepairable after crash",
                    Some(&aside.display().to_string()),
                );
                report.corrupt += 1;
            }
        }
    }
}
