//! Per-stream detection trigger inboxes.
//!
//! Triggers arrive as messages rather than callbacks so the detector never
//! runs inside the capture worker's locks. Semantically unbounded; the
//! implementation caps the queue and drops the oldest entry on overflow.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

/// Queue depth per stream before drop-oldest kicks in.
pub const INBOX_CAPACITY: usize = 64;

/// One detection trigger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionEvent {
    pub confidence: f32,
    /// Seconds since the UNIX epoch, UTC.
    pub at_time: i64,
}

/// Bounded trigger inbox for one stream.
#[derive(Default)]
pub struct DetectionInbox {
    queue: Mutex<VecDeque<DetectionEvent>>,
    dropped: AtomicU64,
}

impl DetectionInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: DetectionEvent) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() == INBOX_CAPACITY {
            queue.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(dropped, "detection inbox overflow, dropped oldest");
        }
        queue.push_back(event);
    }

    /// Take everything queued, oldest first.
    pub fn drain(&self) -> Vec<DetectionEvent> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
