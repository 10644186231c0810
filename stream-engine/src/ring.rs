//! Per-stream pre-roll ring buffers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::frame::Frame;

/// Hard cap on ring capacity regardless of configured pre-roll.
pub const MAX_PREROLL_FRAMES: usize = 1024;

/// Bounded FIFO of recent frames, drained keyframe-aligned at segment open.
///
/// Single producer (the capture worker), single consumer (the same worker
/// during segment open), so a plain mutex never sees contention.
#[derive(Debug)]
pub struct PrerollBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
    dropped: u64,
    rejected: u64,
}

impl PrerollBuffer {
    /// Capacity is `pre_roll_seconds × fps`, clamped to
    /// [`MAX_PREROLL_FRAMES`]. Zero pre-roll seconds is a configuration
    /// error here; the pool never allocates a ring for it.
    pub fn new(pre_roll_seconds: u32, fps: u32) -> Self {
        let capacity = (pre_roll_seconds as usize)
            .saturating_mul(fps.max(1) as usize)
            .clamp(1, MAX_PREROLL_FRAMES);
        Self::with_capacity(capacity)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
            rejected: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames evicted because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Push a frame, evicting the oldest when full. Frames whose timestamp
    /// regresses are rejected so the buffer stays monotone.
    pub fn push(&mut self, frame: Frame) -> bool {
        if let Some(last) = self.frames.back() {
            if frame.pts_ms < last.pts_ms {
                self.rejected += 1;
                debug!(
                    pts = frame.pts_ms,
                    last = last.pts_ms,
                    rejected = self.rejected,
                    "rejected out-of-order frame"
                );
                return false;
            }
        }
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
            self.dropped += 1;
        }
        self.frames.push_back(frame);
        true
    }

    /// Take everything from the oldest buffered video keyframe onward,
    /// leaving the ring empty. Returns nothing (and keeps the contents)
    /// when no keyframe is buffered, since the frames would not decode.
    pub fn drain_keyframe_aligned(&mut self) -> Vec<Frame> {
        let Some(first_key) = self.frames.iter().position(|f| f.is_video_keyframe()) else {
            return Vec::new();
        };
        let aligned: Vec<Frame> = self.frames.split_off(first_key).into();
        self.frames.clear();
        aligned
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Shared handle to one stream's ring.
pub type SharedRing = Arc<Mutex<PrerollBuffer>>;

/// Per-stream rings, created on recording enable and dropped on disable.
#[derive(Default)]
pub struct RingBufferPool {
    rings: Mutex<HashMap<String, SharedRing>>,
}

impl RingBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate (or resize) the ring for a stream. A zero pre-roll disables
    /// buffering entirely: no ring is allocated and any existing one goes.
    pub fn enable(&self, stream: &str, pre_roll_seconds: u32, fps: u32) -> Option<SharedRing> {
        let mut rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        if pre_roll_seconds == 0 {
            rings.remove(stream);
            return None;
        }
        let ring = Arc::new(Mutex::new(PrerollBuffer::new(pre_roll_seconds, fps)));
        rings.insert(stream.to_string(), Arc::clone(&ring));
        Some(ring)
    }

    pub fn get(&self, stream: &str) -> Option<SharedRing> {
        self.rings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(stream)
            .cloned()
    }

    pub fn disable(&self, stream: &str) {
        self.rings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(stream);
    }
}
