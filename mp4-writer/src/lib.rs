//! Fragmented MP4 segment muxing for camera recordings.
//!
//! # Features
//! - Writes standard ISO BMFF: `ftyp` + `moov` init segment followed by
//!   keyframe-aligned `moof`+`mdat` fragments
//! - Optional second track for stream audio
//! - Crash repair: truncates a torn file back to its last complete fragment
//! - Fragment inspection for playback indexing and tests
//!
//! The muxer copies what the camera emits; it never re-encodes.

mod boxes;
mod error;
mod finalize;
mod writer;

pub use boxes::{AudioParams, CodecTag, TrackParams, TIMESCALE};
pub use error::{RepairError, WriterError};
pub use finalize::{
    last_media_time_ms, read_fragments, read_run_payloads, repair, FragmentInfo, RepairReport,
    SampleInfo, TrackRunInfo,
};
pub use writer::{Mp4Writer, Sample, SampleKind, WriterStats};
