//! SQLite-backed catalog for the recording engine.
//!
//! Holds stream configurations, segment metadata, per-stream retention
//! policies and an operational event log in a single database file. The
//! schema is versioned: opening the catalog applies forward-only,
//! idempotent migrations up to [`CURRENT_SCHEMA_VERSION`] and refuses
//! databases written by a newer build.
//!
//! The catalog is metadata only; it never touches segment files. Callers
//! that delete rows are responsible for unlinking the files first.

mod db;
mod error;
mod events;
mod retention;
mod segments;
mod streams;

pub use db::{Catalog, CURRENT_SCHEMA_VERSION};
pub use error::CatalogError;
pub use events::{Event, EventKind, EventQuery, COALESCE_WINDOW_SECS};
pub use retention::RetentionPolicy;
pub use segments::{SegmentOrder, SegmentQuery, SegmentRecord};
pub use streams::{Protocol, StreamConfig, MAX_STREAM_NAME_LEN};
