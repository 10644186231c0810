//! Background retention enforcement.
//!
//! One thread owns all deletion: an age pass, a quota pass and an orphan
//! reconciliation pass per cycle. Files are always unlinked before their
//! rows are deleted, so an interrupted pass leaves an orphaned row (cleaned
//! next pass) rather than an invisible orphaned file.

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use catalog_store::{Catalog, EventKind, RetentionPolicy, SegmentOrder, SegmentQuery, SegmentRecord};
use segment_store::{disk_usage, human_bytes, scan_files, strip_part_suffix, SegmentStore, PART_SUFFIX};
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Fallback policy for streams without a `motion_recording_config` row,
/// plus the filesystem floor that applies regardless of per-stream policy.
#[derive(Debug, Clone, Copy)]
pub struct RetentionDefaults {
    pub retention_days: u32,
    pub max_storage_mb: u64,
    /// Free oldest segments once the filesystem holding the storage root
    /// climbs past this usage percentage. Zero disables the pass.
    pub disk_reserve_percent: u8,
}

/// A `.part` file with no catalog row younger than this is assumed to be a
/// segment open racing the scan, and is left alone.
const PART_GRACE: Duration = Duration::from_secs(60);

/// Counters from one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub age_deleted: u32,
    pub quota_deleted: u32,
    pub disk_deleted: u32,
    pub orphan_rows: u32,
    pub orphan_files: u32,
    pub bytes_freed: u64,
}

impl PassReport {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

fn unlink_then_delete(
    catalog: &Catalog,
    segment: &SegmentRecord,
    reason: &str,
) -> Result<bool, EngineError> {
    match std::fs::remove_file(&segment.file_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            // retryable; the row stays and the next pass tries again
            warn!(path = %segment.file_path, error = %e, "unlink failed, skipping");
            return Ok(false);
        }
    }
    catalog.delete_segment(segment.id)?;
    catalog.log_event(
        EventKind::RetentionDeleted,
        Some(&segment.stream_name),
        &format!("{reason}: {}", segment.file_path),
        Some(&segment.file_path),
    )?;
    Ok(true)
}

fn effective_policy(
    catalog: &Catalog,
    stream: &str,
    defaults: &RetentionDefaults,
) -> Result<RetentionPolicy, EngineError> {
    if let Some(policy) = catalog.get_retention_policy(stream)? {
        return Ok(policy);
    }
    let mut policy = RetentionPolicy::for_stream(stream);
    policy.retention_days = defaults.retention_days;
    policy.max_storage_mb = defaults.max_storage_mb;
    Ok(policy)
}

/// One full retention cycle: age, quota, then orphan reconciliation.
pub fn run_retention_pass(
    catalog: &Catalog,
    store: &SegmentStore,
    defaults: &RetentionDefaults,
) -> Result<PassReport, EngineError> {
    let mut report = PassReport::default();
    let now = chrono::Utc::now().timestamp();

    for stream in catalog.list_streams()? {
        let policy = effective_policy(catalog, &stream.name, defaults)?;

        // age pass
        if policy.retention_days > 0 {
            let cutoff = now - policy.retention_days as i64 * 86_400;
            for segment in catalog.expired_segments(&stream.name, cutoff)? {
                if unlink_then_delete(catalog, &segment, "expired")? {
                    report.age_deleted += 1;
                    report.bytes_freed += segment.size_bytes;
                }
            }
        }

        // quota pass, oldest first
        let quota = policy.max_storage_bytes();
        if quota > 0 {
            let mut total = catalog.total_size_bytes(Some(&stream.name))?;
            while total > quota {
                let batch = catalog.oldest_complete_segments(&stream.name, 16)?;
                if batch.is_empty() {
                    break;
                }
                let before = report.quota_deleted;
                for segment in &batch {
                    if total <= quota {
                        break;
                    }
                    if unlink_then_delete(catalog, segment, "over quota")? {
                        report.quota_deleted += 1;
                        report.bytes_freed += segment.size_bytes;
                        total = total.saturating_sub(segment.size_bytes);
                    }
                }
                if report.quota_deleted == before {
                    break; // every candidate failed to unlink
                }
            }
        }
    }

    // low-disk pass: the volume itself is the quota of last resort, and it
    // outranks per-stream policy. Oldest complete segments go first, across
    // all streams, until usage drops below the reserve or nothing is left.
    if defaults.disk_reserve_percent > 0 {
        let root = store.layout().root();
        loop {
            let usage = match disk_usage(root) {
                Ok(usage) => usage,
                Err(e) => {
                    warn!(error = %e, "cannot stat storage filesystem, skipping low-disk pass");
                    break;
                }
            };
            if usage.percent_used() < defaults.disk_reserve_percent {
                break;
            }
            warn!(
                used = usage.percent_used(),
                reserve = defaults.disk_reserve_percent,
                available = %human_bytes(usage.available_bytes),
                "filesystem above reserve, freeing oldest segments"
            );

            let batch = catalog.list_segments(&SegmentQuery {
                complete_only: true,
                order: SegmentOrder::StartAsc,
                limit: Some(16),
                ..Default::default()
            })?;
            if batch.is_empty() {
                break;
            }
            let before = report.disk_deleted;
            for segment in &batch {
                match disk_usage(root) {
                    Ok(usage) if usage.percent_used() < defaults.disk_reserve_percent => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
                if unlink_then_delete(catalog, segment, "low disk")? {
                    report.disk_deleted += 1;
                    report.bytes_freed += segment.size_bytes;
                }
            }
            if report.disk_deleted == before {
                break; // every candidate failed to unlink
            }
        }
    }

    // orphaned rows: file vanished under a complete segment
    let complete = catalog.list_segments(&SegmentQuery {
        complete_only: true,
        ..Default::default()
    })?;
    for segment in complete {
        if !Path::new(&segment.file_path).is_file() {
            catalog.delete_segment(segment.id)?;
            catalog.log_event(
                EventKind::SegmentOrphaned,
                Some(&segment.stream_name),
                &format!("segment file missing: {}", segment.file_path),
                Some(&segment.file_path),
            )?;
            report.orphan_rows += 1;
        }
    }

    // stray files: anything on disk the catalog does not reference
    for path in scan_files(&store.layout().recordings_dir())? {
        let Some(path_str) = path.to_str() else {
            continue;
        };
        if catalog.get_segment_by_path(path_str)?.is_some() {
            continue;
        }

        if path.extension().and_then(|e| e.to_str()) == Some(PART_SUFFIX) {
            // a writer may be mid-open: its .part exists before the row does
            let row = strip_part_suffix(&path)
                .and_then(|p| p.to_str().map(str::to_string))
                .map(|p| catalog.get_segment_by_path(&p))
                .transpose()?
                .flatten();
            if let Some(row) = row {
                if !row.is_complete {
                    continue; // live writer
                }
            } else if is_recent(&path) {
                continue;
            }
        }

        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "unlinked stray file");
                report.orphan_files += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to unlink stray file"),
        }
    }

    Ok(report)
}

fn is_recent(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|modified| {
            SystemTime::now()
                .duration_since(modified)
                .map(|age| age < PART_GRACE)
                .unwrap_or(true)
        })
        .unwrap_or(false)
}

struct CleanerState {
    interval: Duration,
    defaults: RetentionDefaults,
    run_now: bool,
    shutdown: bool,
}

struct Shared {
    catalog: Arc<Catalog>,
    store: Arc<SegmentStore>,
    state: Mutex<CleanerState>,
    wakeup: Condvar,
}

/// The background cleaner task. Runs at a configurable interval with an
/// on-demand trigger; dropped or shut down, the thread exits promptly.
pub struct RetentionCleaner {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl RetentionCleaner {
    pub fn spawn(
        catalog: Arc<Catalog>,
        store: Arc<SegmentStore>,
        interval: Duration,
        defaults: RetentionDefaults,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            catalog,
            store,
            state: Mutex::new(CleanerState {
                interval,
                defaults,
                run_now: false,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("retention-cleaner".to_string())
            .spawn(move || cleaner_loop(thread_shared))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Request an immediate pass.
    pub fn trigger_now(&self) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.run_now = true;
        self.shared.wakeup.notify_one();
    }

    pub fn set_interval(&self, interval: Duration) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.interval = interval;
        self.shared.wakeup.notify_one();
    }

    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.shutdown = true;
            self.shared.wakeup.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RetentionCleaner {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

fn cleaner_loop(shared: Arc<Shared>) {
    info!("retention cleaner started");
    loop {
        let defaults = {
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.shutdown {
                break;
            }
            if !state.run_now {
                let interval = state.interval;
                let (guard, _) = shared
                    .wakeup
                    .wait_timeout(state, interval)
                    .unwrap_or_else(|e| e.into_inner());
                state = guard;
            }
            if state.shutdown {
                break;
            }
            state.run_now = false;
            state.defaults
        };

        match run_retention_pass(&shared.catalog, &shared.store, &defaults) {
            Ok(report) if report.is_noop() => debug!("retention pass: nothing to do"),
            Ok(report) => info!(
                ?report,
                freed = %human_bytes(report.bytes_freed),
                "retention pass finished"
            ),
            Err(e) => warn!(error = %e, "retention pass failed"),
        }
    }
    info!("retention cleaner exited");
}
