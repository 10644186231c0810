//! Frames as they move between the source, the pre-roll ring and the writer.

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Video,
    Audio,
}

/// One encoded frame from a camera.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    /// Presentation timestamp in milliseconds, monotone within a stream.
    pub pts_ms: i64,
    pub is_keyframe: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn video(pts_ms: i64, is_keyframe: bool, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Video,
            pts_ms,
            is_keyframe,
            payload,
        }
    }

    /// Audio frames are always independently decodable.
    pub fn audio(pts_ms: i64, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Audio,
            pts_ms,
            is_keyframe: true,
            payload,
        }
    }

    pub fn is_video_keyframe(&self) -> bool {
        self.kind == FrameKind::Video && self.is_keyframe
    }
}
