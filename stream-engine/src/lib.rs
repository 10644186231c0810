//! Multi-stream recording engine.
//!
//! # Features
//! - One capture worker thread per enabled stream: connect, back off,
//!   stream, rotate, recover
//! - Keyframe-aligned segment rotation with a hard duration ceiling
//! - Detection-triggered recording with pre-roll ring buffers and post-roll
//! - A writer registry enforcing at most one live writer per stream, with
//!   detach-then-close handoff
//! - Background retention: age, quota and orphan reconciliation passes
//! - Timeline manifests and a handle-based control surface for the HTTP
//!   layer
//!
//! The engine owns all shared state; collaborators receive handles rather
//! than reaching into globals.

pub mod cleaner;
pub mod config;
pub mod detection;
pub mod engine;
pub mod frame;
pub mod registry;
pub mod ring;
pub mod source;
pub mod timeline;
pub mod worker;

mod error;

pub use catalog_store::{
    Catalog, CatalogError, Event, EventKind, EventQuery, Protocol, RetentionPolicy, SegmentOrder,
    SegmentQuery, SegmentRecord, StreamConfig,
};
pub use cleaner::{run_retention_pass, PassReport, RetentionCleaner, RetentionDefaults};
pub use config::{ConfigError, EngineConfig};
pub use detection::{DetectionEvent, DetectionInbox, INBOX_CAPACITY};
pub use engine::{PlaybackHandle, RecordingEngine};
pub use error::{EngineError, ErrorKind};
pub use frame::{Frame, FrameKind};
pub use registry::{take_writer, SharedWriter, WriterRegistry};
pub use ring::{PrerollBuffer, RingBufferPool, MAX_PREROLL_FRAMES};
pub use source::{
    Connector, FrameSource, SourceError, SourceProbe, TcpConnector, WireFrame, SYNC_MARKER,
};
pub use worker::{spawn_worker, BackoffPolicy, BurstPolicy, CaptureWorker, WorkerContext, WorkerHandle};
