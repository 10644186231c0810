//! Filesystem side of the recording pipeline.
//!
//! # Features
//! - Date-tree path layout: `recordings/<stream>/YYYY/MM/DD/<epoch>-<id>.mp4`
//! - Crash-safe writes: segments grow under a `.part` suffix and are renamed
//!   into place only after an fsync
//! - Boot-time recovery that repairs or sets aside whatever a dead process
//!   left behind, keeping the catalog and the disk coherent
//! - Disk capacity statistics for the retention cleaner

mod disk;
mod error;
mod layout;
mod recover;
mod writer;

pub use disk::{disk_usage, human_bytes, DiskUsage};
pub use error::StoreError;
pub use layout::{
    corrupt_path, parse_segment_filename, part_path, strip_part_suffix, SegmentLayout,
    CORRUPT_SUFFIX, PART_SUFFIX,
};
pub use recover::{scan_files, RecoveryReport};
pub use writer::{ClosedSegment, SegmentParams, SegmentStore, SegmentWriter};
