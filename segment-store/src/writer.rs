//! The live writer handle for one in-flight segment.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use catalog_store::Catalog;
use mp4_writer::{AudioParams, CodecTag, Mp4Writer, Sample, SampleKind, TrackParams};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::layout::{part_path, SegmentLayout};

/// Everything needed to open a segment for one stream.
#[derive(Debug, Clone)]
pub struct SegmentParams {
    pub stream_name: String,
    pub width: u16,
    pub height: u16,
    pub fps: u32,
    pub codec: String,
    /// Decoder configuration from the source probe, if any.
    pub extradata: Option<Bytes>,
    /// Audio track parameters when the stream records audio.
    pub audio: Option<AudioParams>,
}

/// Result of cleanly closing a segment.
#[derive(Debug, Clone)]
pub struct ClosedSegment {
    pub segment_id: i64,
    pub path: PathBuf,
    pub start_time: i64,
    pub end_time: i64,
    pub size_bytes: u64,
    pub frames: u64,
}

/// Owns the `.part` file, the muxer state and the open catalog row for one
/// segment. At most one exists per stream; the registry enforces that and
/// callers must detach a handle before closing it.
pub struct SegmentWriter {
    segment_id: i64,
    stream_name: String,
    final_path: PathBuf,
    part: PathBuf,
    start_time: i64,
    writer: Mp4Writer,
    keyframe_seen: bool,
    has_audio: bool,
}

impl SegmentWriter {
    pub fn segment_id(&self) -> i64 {
        self.segment_id
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    pub fn first_pts_ms(&self) -> Option<i64> {
        self.writer.first_pts_ms()
    }

    pub fn last_pts_ms(&self) -> Option<i64> {
        self.writer.last_pts_ms()
    }

    pub fn keyframe_seen(&self) -> bool {
        self.keyframe_seen
    }

    pub fn has_audio(&self) -> bool {
        self.has_audio
    }

    pub fn frames(&self) -> u64 {
        self.writer.frames()
    }

    /// Media time written so far, in milliseconds.
    pub fn elapsed_ms(&self) -> i64 {
        match (self.writer.first_pts_ms(), self.writer.last_pts_ms()) {
            (Some(first), Some(last)) => last - first,
            _ => 0,
        }
    }

    /// Append one frame. Video frames before the first keyframe are dropped
    /// so the file always starts decodable; audio frames are dropped when
    /// the segment has no audio track.
    pub fn write_frame(
        &mut self,
        kind: SampleKind,
        pts_ms: i64,
        is_keyframe: bool,
        data: Bytes,
    ) -> Result<(), StoreError> {
        if kind == SampleKind::Audio && !self.has_audio {
            return Ok(());
        }
        if !self.keyframe_seen {
            if kind != SampleKind::Video || !is_keyframe {
                return Ok(());
            }
            self.keyframe_seen = true;
        }
        self.writer.write_sample(Sample {
            kind,
            pts_ms,
            is_keyframe,
            data,
        })?;
        Ok(())
    }

    /// Finish the file, move it into place and complete the catalog row.
    pub fn close(self, catalog: &Catalog) -> Result<ClosedSegment, StoreError> {
        let stats = self.writer.finish()?;
        std::fs::rename(&self.part, &self.final_path)?;

        let duration_secs = match (stats.first_pts_ms, stats.last_pts_ms) {
            (Some(first), Some(last)) => (last - first + 500) / 1000,
            _ => 0,
        };
        let end_time = self.start_time + duration_secs;
        let path_str = path_str(&self.final_path)?;
        catalog.close_segment(path_str, end_time, stats.bytes_written)?;

        info!(
            stream = %self.stream_name,
            segment = self.segment_id,
            frames = stats.frames,
            bytes = stats.bytes_written,
            "segment closed"
        );
        Ok(ClosedSegment {
            segment_id: self.segment_id,
            path: self.final_path,
            start_time: self.start_time,
            end_time,
            size_bytes: stats.bytes_written,
            frames: stats.frames,
        })
    }

    /// Throw the partial segment away: unlink the `.part` file and remove
    /// the catalog row. Used when a write fails mid-segment.
    pub fn abort(self, catalog: &Catalog) -> Result<(), StoreError> {
        if let Err(e) = std::fs::remove_file(&self.part) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.part.display(), error = %e, "failed to unlink partial segment");
            }
        }
        catalog.delete_segment(self.segment_id)?;
        info!(
            stream = %self.stream_name,
            segment = self.segment_id,
            "partial segment discarded"
        );
        Ok(())
    }
}

/// Filesystem namespace for segment files under one storage root.
pub struct SegmentStore {
    layout: SegmentLayout,
    // serializes id allocation against row insertion across streams
    open_lock: Mutex<()>,
}

impl SegmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            layout: SegmentLayout::new(root),
            open_lock: Mutex::new(()),
        }
    }

    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    /// Open a new segment: allocate the id, create the `.part` file with its
    /// init segment, and register the open catalog row. On catalog failure
    /// the `.part` file is removed and the open attempt aborts.
    pub fn open_writer(
        &self,
        catalog: &Catalog,
        params: &SegmentParams,
        start_time: i64,
    ) -> Result<SegmentWriter, StoreError> {
        let codec = CodecTag::from_name(&params.codec)
            .ok_or_else(|| StoreError::UnsupportedCodec(params.codec.clone()))?;

        let _guard = self.open_lock.lock().unwrap_or_else(|e| e.into_inner());

        let segment_id = catalog.next_segment_id()?;
        let final_path = self
            .layout
            .segment_path(&params.stream_name, start_time, segment_id);
        let part = part_path(&final_path);
        SegmentLayout::ensure_parent(&final_path)?;

        let track = TrackParams {
            codec,
            width: params.width,
            height: params.height,
            fps: params.fps,
            extradata: params.extradata.clone(),
        };
        let has_audio = params.audio.is_some();
        let writer = Mp4Writer::create(&part, track, params.audio.clone())?;

        match catalog.open_segment(
            &params.stream_name,
            path_str(&final_path)?,
            start_time,
            params.width as u32,
            params.height as u32,
            params.fps,
            &params.codec,
        ) {
            Ok(id) => {
                debug_assert_eq!(id, segment_id);
                info!(
                    stream = %params.stream_name,
                    segment = segment_id,
                    path = %final_path.display(),
                    "segment opened"
                );
                Ok(SegmentWriter {
                    segment_id,
                    stream_name: params.stream_name.clone(),
                    final_path,
                    part,
                    start_time,
                    writer,
                    keyframe_seen: false,
                    has_audio,
                })
            }
            Err(e) => {
                let _ = std::fs::remove_file(&part);
                Err(e.into())
            }
        }
    }
}

pub(crate) fn path_str(path: &Path) -> Result<&str, StoreError> {
    path.to_str()
        .ok_or_else(|| StoreError::InvalidPath(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_store::SegmentQuery;
    use tempfile::tempdir;

    fn params(stream: &str) -> SegmentParams {
        SegmentParams {
            stream_name: stream.to_string(),
            width: 1280,
            height: 720,
            fps: 10,
            codec: "h264".to_string(),
            extradata: None,
            audio: None,
        }
    }

    fn frame(data: u8, len: usize) -> Bytes {
        Bytes::from(vec![data; len])
    }

    #[test]
    fn test_open_write_close() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let store = SegmentStore::new(dir.path());

        let mut writer = store.open_writer(&catalog, &params("cam-front"), 1000).unwrap();
        let open_row = catalog.get_segment(writer.segment_id()).unwrap().unwrap();
        assert!(!open_row.is_complete);
        assert!(writer.final_path().to_str().unwrap().contains("recordings/cam-front"));
        assert!(part_path(writer.final_path()).exists());

        writer.write_frame(SampleKind::Video, 0, true, frame(1, 64)).unwrap();
        writer.write_frame(SampleKind::Video, 100, false, frame(2, 64)).unwrap();
        writer.write_frame(SampleKind::Video, 60_000, false, frame(3, 64)).unwrap();

        let closed = writer.close(&catalog).unwrap();
        assert!(closed.path.exists());
        assert!(!part_path(&closed.path).exists());
        assert_eq!(closed.end_time, 1000 + 60);
        assert_eq!(closed.frames, 3);

        let row = catalog.get_segment(closed.segment_id).unwrap().unwrap();
        assert!(row.is_complete);
        assert_eq!(row.end_time, Some(1060));
        assert_eq!(row.size_bytes, closed.size_bytes);
        assert_eq!(
            row.size_bytes,
            std::fs::metadata(&closed.path).unwrap().len()
        );
    }

    #[test]
    fn test_frames_before_keyframe_dropped() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let store = SegmentStore::new(dir.path());

        let mut writer = store.open_writer(&catalog, &params("cam"), 1000).unwrap();
        writer.write_frame(SampleKind::Video, 0, false, frame(1, 10)).unwrap();
        writer.write_frame(SampleKind::Video, 100, false, frame(2, 10)).unwrap();
        assert!(!writer.keyframe_seen());
        assert_eq!(writer.frames(), 0);

        writer.write_frame(SampleKind::Video, 200, true, frame(3, 10)).unwrap();
        assert!(writer.keyframe_seen());
        assert_eq!(writer.frames(), 1);

        writer.close(&catalog).unwrap();
    }

    #[test]
    fn test_audio_dropped_without_audio_track() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let store = SegmentStore::new(dir.path());

        let mut writer = store.open_writer(&catalog, &params("cam"), 1000).unwrap();
        assert!(!writer.has_audio());

        writer.write_frame(SampleKind::Video, 0, true, frame(1, 64)).unwrap();
        // the stream carries audio this segment does not record
        writer.write_frame(SampleKind::Audio, 50, true, frame(2, 16)).unwrap();
        writer.write_frame(SampleKind::Video, 100, false, frame(3, 64)).unwrap();

        assert_eq!(writer.frames(), 2);
        let closed = writer.close(&catalog).unwrap();
        assert_eq!(closed.frames, 2);
    }

    #[test]
    fn test_abort_removes_file_and_row() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let store = SegmentStore::new(dir.path());

        let mut writer = store.open_writer(&catalog, &params("cam"), 1000).unwrap();
        writer.write_frame(SampleKind::Video, 0, true, frame(1, 10)).unwrap();
        let id = writer.segment_id();
        let part = part_path(writer.final_path()).to_path_buf();

        writer.abort(&catalog).unwrap();
        assert!(!part.exists());
        assert!(catalog.get_segment(id).unwrap().is_none());
    }

    #[test]
    fn test_ids_unique_across_streams() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let store = SegmentStore::new(dir.path());

        let w1 = store.open_writer(&catalog, &params("cam-a"), 1000).unwrap();
        let w2 = store.open_writer(&catalog, &params("cam-b"), 1000).unwrap();
        assert_ne!(w1.segment_id(), w2.segment_id());

        w1.close(&catalog).unwrap();
        w2.close(&catalog).unwrap();
        assert_eq!(
            catalog.count_segments(&SegmentQuery::default()).unwrap(),
            2
        );
    }

    #[test]
    fn test_unsupported_codec_rejected() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let store = SegmentStore::new(dir.path());

        let mut bad = params("cam");
        bad.codec = "mjpeg".to_string();
        assert!(matches!(
            store.open_writer(&catalog, &bad, 1000),
            Err(StoreError::UnsupportedCodec(_))
        ));
    }
}
