//! Fragmented segment writer.
//!
//! Layout: `ftyp` + `moov` (movie header with `mvex`) up front, then one
//! `moof`+`mdat` pair per keyframe group. Putting the movie header first is
//! what makes a crash-truncated file repairable: everything after the last
//! complete fragment can be cut away and the remainder still plays.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use crate::boxes::{
    self, AudioParams, RunSample, TrackParams, TrackRun, AUDIO_TRACK_ID, VIDEO_TRACK_ID,
};
use crate::error::WriterError;

/// Which track a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Video,
    Audio,
}

/// One sample handed to the writer.
#[derive(Debug, Clone)]
pub struct Sample {
    pub kind: SampleKind,
    /// Presentation timestamp in milliseconds; must be non-decreasing.
    pub pts_ms: i64,
    pub is_keyframe: bool,
    pub data: Bytes,
}

/// Totals reported when a writer finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub bytes_written: u64,
    pub frames: u64,
    pub fragments: u32,
    pub first_pts_ms: Option<i64>,
    pub last_pts_ms: Option<i64>,
}

struct PendingSample {
    pts_ms: i64,
    is_keyframe: bool,
    data: Bytes,
}

/// An in-flight fragmented MP4 file.
pub struct Mp4Writer {
    file: File,
    path: PathBuf,
    video: TrackParams,
    audio: Option<AudioParams>,
    sequence: u32,
    pending_video: Vec<PendingSample>,
    pending_audio: Vec<PendingSample>,
    bytes_written: u64,
    frames: u64,
    first_pts_ms: Option<i64>,
    last_pts_ms: Option<i64>,
}

impl Mp4Writer {
    /// Create the file and write the init segment.
    pub fn create(
        path: &Path,
        video: TrackParams,
        audio: Option<AudioParams>,
    ) -> Result<Self, WriterError> {
        let mut file = File::create(path)?;
        let ftyp = boxes::ftyp();
        let moov = boxes::moov(&video, audio.as_ref());
        file.write_all(&ftyp)?;
        file.write_all(&moov)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            video,
            audio,
            sequence: 0,
            pending_video: Vec::new(),
            pending_audio: Vec::new(),
            bytes_written: (ftyp.len() + moov.len()) as u64,
            frames: 0,
            first_pts_ms: None,
            last_pts_ms: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written to disk so far; the open fragment is not included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn first_pts_ms(&self) -> Option<i64> {
        self.first_pts_ms
    }

    pub fn last_pts_ms(&self) -> Option<i64> {
        self.last_pts_ms
    }

    /// Append a sample. A video keyframe closes the open fragment first, so
    /// every fragment starts with a sync sample.
    pub fn write_sample(&mut self, sample: Sample) -> Result<(), WriterError> {
        if sample.kind == SampleKind::Audio && self.audio.is_none() {
            return Err(WriterError::NoAudioTrack);
        }
        if let Some(last) = self.last_pts_ms {
            if sample.pts_ms < last {
                return Err(WriterError::NonMonotonicPts {
                    prev: last,
                    next: sample.pts_ms,
                });
            }
        }

        if sample.kind == SampleKind::Video
            && sample.is_keyframe
            && !self.pending_video.is_empty()
        {
            self.flush_fragment()?;
        }

        if self.first_pts_ms.is_none() {
            self.first_pts_ms = Some(sample.pts_ms);
        }
        self.last_pts_ms = Some(sample.pts_ms);
        self.frames += 1;

        let pending = PendingSample {
            pts_ms: sample.pts_ms,
            is_keyframe: sample.is_keyframe,
            data: sample.data,
        };
        match sample.kind {
            SampleKind::Video => self.pending_video.push(pending),
            SampleKind::Audio => self.pending_audio.push(pending),
        }
        Ok(())
    }

    fn run_for(
        &self,
        track_id: u32,
        samples: &[PendingSample],
        default_duration: u32,
    ) -> TrackRun {
        let origin = self.first_pts_ms.unwrap_or(0);
        let base_time_ms = samples
            .first()
            .map(|s| (s.pts_ms - origin).max(0) as u64)
            .unwrap_or(0);
        let runs = samples
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let duration_ms = samples
                    .get(i + 1)
                    .map(|next| (next.pts_ms - s.pts_ms).max(0) as u32)
                    .unwrap_or(default_duration)
                    .max(1);
                RunSample {
                    duration_ms,
                    size: s.data.len() as u32,
                    is_sync: s.is_keyframe,
                }
            })
            .collect();
        TrackRun {
            track_id,
            base_time_ms,
            samples: runs,
        }
    }

    fn flush_fragment(&mut self) -> Result<(), WriterError> {
        if self.pending_video.is_empty() && self.pending_audio.is_empty() {
            return Ok(());
        }
        self.sequence += 1;

        let default_video = self.video.default_sample_duration();
        let mut runs = Vec::with_capacity(2);
        if !self.pending_video.is_empty() {
            runs.push(self.run_for(VIDEO_TRACK_ID, &self.pending_video, default_video));
        }
        if !self.pending_audio.is_empty() {
            // audio cadence follows the stream; reuse the video default as fallback
            runs.push(self.run_for(AUDIO_TRACK_ID, &self.pending_audio, default_video));
        }

        let (moof, mdat_payload) = boxes::moof(self.sequence, &runs);
        self.file.write_all(&moof)?;
        self.file.write_all(&boxes::mdat_header(mdat_payload))?;
        for sample in &self.pending_video {
            self.file.write_all(&sample.data)?;
        }
        for sample in &self.pending_audio {
            self.file.write_all(&sample.data)?;
        }

        self.bytes_written += moof.len() as u64 + 8 + mdat_payload;
        debug!(
            sequence = self.sequence,
            video = self.pending_video.len(),
            audio = self.pending_audio.len(),
            bytes = self.bytes_written,
            "fragment flushed"
        );
        self.pending_video.clear();
        self.pending_audio.clear();
        Ok(())
    }

    /// Flush the tail fragment and fsync. The file is complete after this.
    pub fn finish(mut self) -> Result<WriterStats, WriterError> {
        self.flush_fragment()?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(WriterStats {
            bytes_written: self.bytes_written,
            frames: self.frames,
            fragments: self.sequence,
            first_pts_ms: self.first_pts_ms,
            last_pts_ms: self.last_pts_ms,
        })
    }
}
