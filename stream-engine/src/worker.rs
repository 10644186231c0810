//! Per-stream capture workers.
//!
//! One OS thread per enabled stream drives the whole pipeline: connect to
//! the source, feed the pre-roll ring, and hand frames to the armed writer.
//! Rotation is keyframe-aligned on media time, reconnects back off
//! exponentially, and a failed segment never stops the stream: the broken
//! file is discarded and recording resumes at the next keyframe.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use catalog_store::{Catalog, EventKind, StreamConfig};
use mp4_writer::SampleKind;
use segment_store::{SegmentParams, SegmentStore};
use tracing::{debug, info, warn};

use crate::detection::DetectionInbox;
use crate::frame::{Frame, FrameKind};
use crate::registry::{take_writer, SharedWriter, WriterRegistry};
use crate::ring::{RingBufferPool, SharedRing};
use crate::source::{log_source_error, Connector, FrameSource, SourceProbe};

/// Exponential reconnect backoff: initial, doubling, capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        (self.initial * factor as u32).min(self.max)
    }
}

/// Escalate to a reconnect after this many errors inside the window.
#[derive(Debug, Clone, Copy)]
pub struct BurstPolicy {
    pub max_errors: u32,
    pub window: Duration,
}

impl Default for BurstPolicy {
    fn default() -> Self {
        Self {
            max_errors: 20,
            window: Duration::from_secs(10),
        }
    }
}

/// Shared collaborators a worker needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub catalog: Arc<Catalog>,
    pub store: Arc<SegmentStore>,
    pub registry: Arc<WriterRegistry>,
    pub rings: Arc<RingBufferPool>,
    pub connector: Arc<dyn Connector>,
    pub backoff: BackoffPolicy,
    pub burst: BurstPolicy,
}

enum Outcome {
    Stopped,
    Disconnected,
}

/// Sleep that wakes early when the stop flag flips.
fn sleep_with_stop(stop: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}

fn sample_kind(kind: FrameKind) -> SampleKind {
    match kind {
        FrameKind::Video => SampleKind::Video,
        FrameKind::Audio => SampleKind::Audio,
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// The state machine driving one stream.
pub struct CaptureWorker {
    ctx: WorkerContext,
    config: StreamConfig,
    inbox: Arc<DetectionInbox>,
    stop: Arc<AtomicBool>,
    ring: Option<SharedRing>,
    attempt: u32,
    errors: VecDeque<Instant>,
    segment_first_pts: i64,
    armed_until_pts: Option<i64>,
    /// Last timestamp on the worker's continuous timeline, which keeps
    /// growing across reconnects even when the camera resets its clock.
    last_pts: Option<i64>,
}

impl CaptureWorker {
    pub fn new(
        ctx: WorkerContext,
        config: StreamConfig,
        inbox: Arc<DetectionInbox>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let ring = if config.detection_based_recording {
            ctx.rings
                .enable(&config.name, config.pre_detection_buffer, config.fps)
        } else {
            None
        };
        Self {
            ctx,
            config,
            inbox,
            stop,
            ring,
            attempt: 0,
            errors: VecDeque::new(),
            segment_first_pts: 0,
            armed_until_pts: None,
            last_pts: None,
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn run(mut self) {
        let name = self.config.name.clone();
        info!(stream = %name, "capture worker started");
        let _ = self
            .ctx
            .catalog
            .log_event(EventKind::StreamStarted, Some(&name), "capture started", None);

        while !self.stopped() {
            match self.ctx.connector.connect(&self.config) {
                Ok(source) => {
                    debug!(stream = %name, "source connected");
                    if let Outcome::Stopped = self.streaming(source) {
                        break;
                    }
                }
                Err(e) => {
                    warn!(stream = %name, error = %e, "connect failed");
                    let _ = self.ctx.catalog.log_event(
                        EventKind::SourceError,
                        Some(&name),
                        &format!("connect failed: {e}"),
                        None,
                    );
                }
            }
            if self.stopped() {
                break;
            }
            self.attempt = self.attempt.saturating_add(1);
            let delay = self.ctx.backoff.delay(self.attempt);
            debug!(stream = %name, attempt = self.attempt, ?delay, "backing off");
            sleep_with_stop(&self.stop, delay);
        }

        self.teardown();
        let _ = self
            .ctx
            .catalog
            .log_event(EventKind::StreamStopped, Some(&name), "capture stopped", None);
        info!(stream = %name, "capture worker exited");
    }

    fn streaming(&mut self, mut source: Box<dyn FrameSource>) -> Outcome {
        let probe = source.probe().clone();
        let frame_ms = (1000 / probe.fps.max(1)).max(1) as i64;
        // cameras reset their clock on reconnect; splice this connection's
        // timestamps onto the continuous timeline
        let mut offset: Option<i64> = None;
        loop {
            if self.stopped() {
                return Outcome::Stopped;
            }
            match source.read_frame() {
                Ok(mut frame) => {
                    // any successful frame resets the reconnect backoff
                    self.attempt = 0;
                    let off = *offset.get_or_insert_with(|| match self.last_pts {
                        Some(last) => last + frame_ms - frame.pts_ms,
                        None => -frame.pts_ms,
                    });
                    frame.pts_ms += off;
                    if let Some(last) = self.last_pts {
                        if frame.pts_ms < last {
                            frame.pts_ms = last;
                        }
                    }
                    self.last_pts = Some(frame.pts_ms);
                    self.handle_frame(&probe, frame);
                }
                Err(e) if e.is_transient() => {
                    log_source_error(&self.config.name, &e);
                    if self.record_error() {
                        let _ = self.ctx.catalog.log_event(
                            EventKind::SourceError,
                            Some(&self.config.name),
                            "read error burst, reconnecting",
                            None,
                        );
                        return Outcome::Disconnected;
                    }
                }
                Err(e) => {
                    log_source_error(&self.config.name, &e);
                    let _ = self.ctx.catalog.log_event(
                        EventKind::SourceError,
                        Some(&self.config.name),
                        &format!("source lost: {e}"),
                        None,
                    );
                    return Outcome::Disconnected;
                }
            }
        }
    }

    fn record_error(&mut self) -> bool {
        let now = Instant::now();
        self.errors.push_back(now);
        while let Some(front) = self.errors.front() {
            if now.duration_since(*front) > self.ctx.burst.window {
                self.errors.pop_front();
            } else {
                break;
            }
        }
        self.errors.len() as u32 >= self.ctx.burst.max_errors
    }

    fn handle_frame(&mut self, probe: &SourceProbe, frame: Frame) {
        // the wire carries audio whether or not this stream records it
        if frame.kind == FrameKind::Audio && !self.config.record_audio {
            return;
        }
        if self.config.detection_based_recording {
            self.handle_detection_frame(probe, frame);
        } else {
            self.handle_continuous_frame(probe, frame);
        }
    }

    fn handle_continuous_frame(&mut self, probe: &SourceProbe, frame: Frame) {
        if self.ctx.registry.is_armed(&self.config.name) {
            self.maybe_rotate(probe, &frame);
        } else if frame.is_video_keyframe() {
            self.open_segment(probe, &frame);
        } else {
            return;
        }
        self.write_frame(frame);
    }

    fn handle_detection_frame(&mut self, probe: &SourceProbe, frame: Frame) {
        let triggers = self.inbox.drain();
        if !triggers.is_empty() {
            let post_ms = self.config.post_detection_buffer as i64 * 1000;
            self.armed_until_pts = Some(frame.pts_ms + post_ms);
            debug!(
                stream = %self.config.name,
                triggers = triggers.len(),
                until = frame.pts_ms + post_ms,
                "detection window extended"
            );
        }

        let armed = self.ctx.registry.is_armed(&self.config.name);
        if let Some(until) = self.armed_until_pts {
            if armed && frame.pts_ms >= until && frame.is_video_keyframe() {
                // post-roll over; this keyframe stays in the ring and can
                // open the next pre-roll instead
                self.close_segment("post-roll elapsed");
                self.armed_until_pts = None;
                self.push_ring(frame);
                return;
            }
            if !armed {
                self.open_segment(probe, &frame);
            }
        }

        if self.ctx.registry.is_armed(&self.config.name) {
            self.maybe_rotate(probe, &frame);
            self.write_frame(frame.clone());
        }
        self.push_ring(frame);
    }

    fn push_ring(&self, frame: Frame) {
        if let Some(ring) = &self.ring {
            ring.lock().unwrap_or_else(|e| e.into_inner()).push(frame);
        }
    }

    fn maybe_rotate(&mut self, probe: &SourceProbe, frame: &Frame) {
        let target_ms = self.config.segment_duration as i64 * 1000;
        let elapsed = frame.pts_ms - self.segment_first_pts;
        if frame.is_video_keyframe() && elapsed >= target_ms {
            debug!(stream = %self.config.name, elapsed, "rotating at keyframe");
            self.open_segment(probe, frame);
        } else if elapsed >= target_ms * 2 {
            // hard ceiling: no keyframe arrived, cut anyway
            warn!(stream = %self.config.name, elapsed, "forced rotation without keyframe");
            self.open_segment(probe, frame);
        }
    }

    /// Open a fresh segment and arm it, flushing pre-roll first. A previous
    /// writer (rotation, duplicate enable) is closed after the registry has
    /// let go of it.
    fn open_segment(&mut self, probe: &SourceProbe, frame: &Frame) -> bool {
        let preroll = self
            .ring
            .as_ref()
            .map(|r| {
                r.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .drain_keyframe_aligned()
            })
            .unwrap_or_default();

        let first_pts = preroll.first().map(|f| f.pts_ms).unwrap_or(frame.pts_ms);
        let start_time = now_secs() - (frame.pts_ms - first_pts).max(0) / 1000;

        let params = SegmentParams {
            stream_name: self.config.name.clone(),
            width: probe.width,
            height: probe.height,
            fps: probe.fps,
            codec: probe.codec.clone(),
            extradata: probe.extradata.clone(),
            audio: if self.config.record_audio {
                probe.audio.clone()
            } else {
                None
            },
        };

        let mut writer = match self.ctx.store.open_writer(&self.ctx.catalog, &params, start_time) {
            Ok(writer) => writer,
            Err(e) => {
                warn!(stream = %self.config.name, error = %e, "segment open failed");
                let _ = self.ctx.catalog.log_event(
                    EventKind::RecordingFailed,
                    Some(&self.config.name),
                    &format!("segment open failed: {e}"),
                    None,
                );
                return false;
            }
        };

        for f in &preroll {
            if let Err(e) =
                writer.write_frame(sample_kind(f.kind), f.pts_ms, f.is_keyframe, f.payload.clone())
            {
                warn!(stream = %self.config.name, error = %e, "pre-roll write failed");
                break;
            }
        }

        self.segment_first_pts = first_pts;
        let segment_id = writer.segment_id();
        match self.ctx.registry.arm(&self.config.name, writer) {
            Some(previous) => self.finish_writer(previous),
            None => {
                info!(
                    stream = %self.config.name,
                    segment = segment_id,
                    preroll = preroll.len(),
                    "recording armed"
                );
                let _ = self.ctx.catalog.log_event(
                    EventKind::RecordingStarted,
                    Some(&self.config.name),
                    "recording started",
                    None,
                );
            }
        }
        true
    }

    /// Close a detached writer; never called while the registry still
    /// references it.
    fn finish_writer(&self, shared: SharedWriter) {
        let Some(writer) = take_writer(shared) else {
            warn!(stream = %self.config.name, "detached writer still referenced, leaking to recovery");
            return;
        };
        match writer.close(&self.ctx.catalog) {
            Ok(closed) => debug!(
                stream = %self.config.name,
                segment = closed.segment_id,
                frames = closed.frames,
                "segment finalized"
            ),
            Err(e) => {
                warn!(stream = %self.config.name, error = %e, "segment close failed");
                let _ = self.ctx.catalog.log_event(
                    EventKind::RecordingFailed,
                    Some(&self.config.name),
                    &format!("segment close failed: {e}"),
                    None,
                );
            }
        }
    }

    fn close_segment(&mut self, why: &str) {
        if let Some(shared) = self.ctx.registry.disarm(&self.config.name) {
            self.finish_writer(shared);
            debug!(stream = %self.config.name, why, "recording disarmed");
            let _ = self.ctx.catalog.log_event(
                EventKind::RecordingStopped,
                Some(&self.config.name),
                why,
                None,
            );
        }
    }

    fn write_frame(&mut self, frame: Frame) {
        let Some(handle) = self.ctx.registry.handle(&self.config.name) else {
            return;
        };
        let result = {
            let mut writer = handle.lock().unwrap_or_else(|e| e.into_inner());
            writer.write_frame(
                sample_kind(frame.kind),
                frame.pts_ms,
                frame.is_keyframe,
                frame.payload,
            )
        };
        drop(handle);

        if let Err(e) = result {
            warn!(stream = %self.config.name, error = %e, "frame write failed, discarding segment");
            let _ = self.ctx.catalog.log_event(
                EventKind::RecordingFailed,
                Some(&self.config.name),
                &format!("frame write failed: {e}"),
                None,
            );
            if let Some(shared) = self.ctx.registry.disarm(&self.config.name) {
                if let Some(writer) = take_writer(shared) {
                    if let Err(abort_err) = writer.abort(&self.ctx.catalog) {
                        warn!(stream = %self.config.name, error = %abort_err, "abort failed");
                    }
                }
            }
            // the next keyframe re-arms through the normal open path
        }
    }

    fn teardown(&mut self) {
        self.close_segment("capture stopping");
        self.ctx.rings.disable(&self.config.name);
    }
}

/// Running worker thread plus its stop signal.
pub struct WorkerHandle {
    stream: String,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Edge-triggered stop; the worker finishes its in-flight frame, closes
    /// the writer and exits.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spawn the capture thread for one stream.
pub fn spawn_worker(
    ctx: WorkerContext,
    config: StreamConfig,
    inbox: Arc<DetectionInbox>,
) -> std::io::Result<WorkerHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let worker = CaptureWorker::new(ctx, config.clone(), inbox, Arc::clone(&stop));
    let thread = std::thread::Builder::new()
        .name(format!("capture-{}", config.name))
        .spawn(move || worker.run())?;
    Ok(WorkerHandle {
        stream: config.name,
        stop,
        thread: Some(thread),
    })
}
