//! The engine: one owning structure for the catalog, the segment store,
//! the writer registry, the ring pool, the capture workers and the
//! retention cleaner. Everything the HTTP layer touches goes through here.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use catalog_store::{
    Catalog, Event, EventKind, EventQuery, RetentionPolicy, SegmentOrder, SegmentQuery,
    SegmentRecord, StreamConfig,
};
use segment_store::SegmentStore;
use tracing::{info, warn};

use crate::cleaner::{run_retention_pass, RetentionCleaner, RetentionDefaults};
use crate::config::EngineConfig;
use crate::detection::{DetectionEvent, DetectionInbox};
use crate::error::EngineError;
use crate::registry::{take_writer, WriterRegistry};
use crate::ring::RingBufferPool;
use crate::source::Connector;
use crate::timeline;
use crate::worker::{spawn_worker, BackoffPolicy, BurstPolicy, WorkerContext, WorkerHandle};

/// Everything a playback layer needs to serve one segment. Dropping the
/// handle releases the advisory request-active slot.
pub struct PlaybackHandle {
    pub path: PathBuf,
    pub mime: &'static str,
    pub size_bytes: u64,
    _guard: Option<ReadGuard>,
}

struct ReadGuard {
    active: Arc<Mutex<HashSet<i64>>>,
    id: i64,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// The recording engine.
pub struct RecordingEngine {
    config: EngineConfig,
    catalog: Arc<Catalog>,
    store: Arc<SegmentStore>,
    registry: Arc<WriterRegistry>,
    rings: Arc<RingBufferPool>,
    connector: Arc<dyn Connector>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    inboxes: Mutex<HashMap<String, Arc<DetectionInbox>>>,
    cleaner: Mutex<Option<RetentionCleaner>>,
    active_reads: Arc<Mutex<HashSet<i64>>>,
    running: AtomicBool,
}

impl RecordingEngine {
    /// Open the catalog and storage without starting any workers.
    pub fn new(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, EngineError> {
        let catalog = Arc::new(Catalog::open(&config.db_path)?);
        let store = Arc::new(SegmentStore::new(&config.storage_root));
        Ok(Self {
            config,
            catalog,
            store,
            registry: Arc::new(WriterRegistry::new()),
            rings: Arc::new(RingBufferPool::new()),
            connector,
            workers: Mutex::new(HashMap::new()),
            inboxes: Mutex::new(HashMap::new()),
            cleaner: Mutex::new(None),
            active_reads: Arc::new(Mutex::new(HashSet::new())),
            running: AtomicBool::new(false),
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn retention_defaults(&self) -> RetentionDefaults {
        RetentionDefaults {
            retention_days: self.config.retention_days,
            max_storage_mb: self.config.max_storage_mb,
            disk_reserve_percent: self.config.disk_reserve_percent,
        }
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            catalog: Arc::clone(&self.catalog),
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            rings: Arc::clone(&self.rings),
            connector: Arc::clone(&self.connector),
            backoff: BackoffPolicy {
                initial: Duration::from_secs(self.config.backoff_initial_secs.max(1)),
                max: Duration::from_secs(self.config.backoff_max_secs.max(1)),
            },
            burst: BurstPolicy {
                max_errors: self.config.error_burst_max.max(1),
                window: Duration::from_secs(self.config.error_burst_window_secs.max(1)),
            },
        }
    }

    fn inbox_for(&self, stream: &str) -> Arc<DetectionInbox> {
        let mut inboxes = self.inboxes.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            inboxes
                .entry(stream.to_string())
                .or_insert_with(|| Arc::new(DetectionInbox::new())),
        )
    }

    /// Crash-finalize leftovers, then bring up workers and the cleaner.
    pub fn start(&self) -> Result<(), EngineError> {
        let report = self.store.recover(&self.catalog)?;
        if report != Default::default() {
            info!(?report, "boot recovery");
        }

        self.running.store(true, Ordering::Relaxed);
        for stream in self.catalog.list_streams()? {
            if stream.enabled && stream.record {
                self.spawn_stream_worker(&stream)?;
            }
        }

        let cleaner = RetentionCleaner::spawn(
            Arc::clone(&self.catalog),
            Arc::clone(&self.store),
            self.config.cleanup_interval(),
            self.retention_defaults(),
        )?;
        *self.cleaner.lock().unwrap_or_else(|e| e.into_inner()) = Some(cleaner);
        info!("recording engine started");
        Ok(())
    }

    /// Stop every worker, close whatever is still armed, then finalize any
    /// `.part` files that survived the grace period.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);

        let workers: Vec<WorkerHandle> = {
            let mut map = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, handle)| handle).collect()
        };
        // signal everyone first so they stop in parallel
        for worker in &workers {
            worker.stop();
        }
        let deadline = Instant::now() + self.config.shutdown_grace();
        while Instant::now() < deadline && workers.iter().any(|w| !w.is_finished()) {
            std::thread::sleep(Duration::from_millis(20));
        }
        if workers.iter().any(|w| !w.is_finished()) {
            warn!("workers still running after grace period");
        }
        for worker in workers {
            worker.join();
        }

        // writers a misbehaving worker left armed
        for (stream, shared) in self.registry.detach_all() {
            warn!(stream = %stream, "closing writer left armed at shutdown");
            if let Some(writer) = take_writer(shared) {
                if let Err(e) = writer.close(&self.catalog) {
                    warn!(stream = %stream, error = %e, "close at shutdown failed");
                }
            }
        }

        if let Err(e) = self.store.recover(&self.catalog) {
            warn!(error = %e, "shutdown recovery failed");
        }

        if let Some(cleaner) = self
            .cleaner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            cleaner.shutdown();
        }
        info!("recording engine stopped");
    }

    fn spawn_stream_worker(&self, config: &StreamConfig) -> Result<(), EngineError> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = workers.remove(&config.name) {
            old.stop();
            old.join();
        }
        let handle = spawn_worker(self.worker_context(), config.clone(), self.inbox_for(&config.name))?;
        workers.insert(config.name.clone(), handle);
        Ok(())
    }

    fn stop_stream_worker(&self, name: &str) {
        let handle = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.remove(name)
        };
        if let Some(handle) = handle {
            handle.stop();
            handle.join();
        }
    }

    // ── streams ─────────────────────────────────────────────────────────

    pub fn create_stream(&self, config: &StreamConfig) -> Result<i64, EngineError> {
        let id = self.catalog.upsert_stream(config)?;
        if self.running.load(Ordering::Relaxed) && config.enabled && config.record {
            self.spawn_stream_worker(config)?;
        }
        Ok(id)
    }

    pub fn get_stream(&self, name: &str) -> Result<StreamConfig, EngineError> {
        self.catalog
            .get_stream(name)?
            .ok_or_else(|| EngineError::NotFound(format!("stream {name}")))
    }

    pub fn list_streams(&self) -> Result<Vec<StreamConfig>, EngineError> {
        Ok(self.catalog.list_streams()?)
    }

    /// Replace a stream's configuration. A running worker is restarted so
    /// the new parameters take effect; the registry hands the old writer
    /// back for closing, so no frames are lost past the boundary keyframe.
    pub fn update_stream(&self, name: &str, config: &StreamConfig) -> Result<(), EngineError> {
        self.catalog.update_stream(name, config)?;
        if name != config.name {
            self.stop_stream_worker(name);
        }
        if self.running.load(Ordering::Relaxed) && config.enabled && config.record {
            self.spawn_stream_worker(config)?;
        } else {
            self.stop_stream_worker(&config.name);
        }
        Ok(())
    }

    /// Soft delete disables the stream but keeps its history; hard delete
    /// removes the row entirely.
    pub fn delete_stream(&self, name: &str, hard: bool) -> Result<(), EngineError> {
        self.stop_stream_worker(name);
        if hard {
            self.catalog.hard_delete_stream(name)?;
        } else {
            self.catalog.soft_delete_stream(name)?;
        }
        Ok(())
    }

    // ── recording ───────────────────────────────────────────────────────

    pub fn enable_recording(&self, name: &str) -> Result<(), EngineError> {
        let mut config = self.get_stream(name)?;
        config.record = true;
        config.enabled = true;
        self.catalog.update_stream(name, &config)?;
        if self.running.load(Ordering::Relaxed) {
            self.spawn_stream_worker(&config)?;
        }
        Ok(())
    }

    pub fn disable_recording(&self, name: &str) -> Result<(), EngineError> {
        let mut config = self.get_stream(name)?;
        config.record = false;
        self.catalog.update_stream(name, &config)?;
        self.stop_stream_worker(name);
        self.rings.disable(name);
        Ok(())
    }

    pub fn update_recording_config(&self, policy: &RetentionPolicy) -> Result<(), EngineError> {
        // policies may exist ahead of their stream, but a typo should not
        self.get_stream(&policy.stream_name)?;
        Ok(self.catalog.set_retention_policy(policy)?)
    }

    /// Detection trigger input from an external detector. Consumed by the
    /// stream's capture worker on its next frame.
    pub fn notify_detection(
        &self,
        stream: &str,
        confidence: f32,
        at_time: i64,
    ) -> Result<(), EngineError> {
        self.get_stream(stream)?;
        self.inbox_for(stream).push(DetectionEvent {
            confidence,
            at_time,
        });
        Ok(())
    }

    pub fn trigger_cleanup_now(&self) -> Result<(), EngineError> {
        let cleaner = self.cleaner.lock().unwrap_or_else(|e| e.into_inner());
        match cleaner.as_ref() {
            Some(cleaner) => {
                cleaner.trigger_now();
                Ok(())
            }
            // engine not started; run synchronously
            None => run_retention_pass(&self.catalog, &self.store, &self.retention_defaults())
                .map(|_| ()),
        }
    }

    pub fn set_cleanup_interval(&self, interval: Duration) {
        if let Some(cleaner) = self
            .cleaner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            cleaner.set_interval(interval);
        }
    }

    // ── segments ────────────────────────────────────────────────────────

    pub fn list_segments_by_range(
        &self,
        stream: Option<&str>,
        t0: Option<i64>,
        t1: Option<i64>,
        limit: Option<u32>,
        offset: Option<u32>,
        order: SegmentOrder,
    ) -> Result<Vec<SegmentRecord>, EngineError> {
        Ok(self.catalog.list_segments(&SegmentQuery {
            stream_name: stream.map(str::to_string),
            range_start: t0,
            range_end: t1,
            complete_only: false,
            order,
            limit,
            offset,
        })?)
    }

    pub fn get_segment_by_id(&self, id: i64) -> Result<SegmentRecord, EngineError> {
        self.catalog
            .get_segment(id)?
            .ok_or_else(|| EngineError::NotFound(format!("segment {id}")))
    }

    /// Admin deletion: unlink the file, then drop the row.
    pub fn delete_segment_by_id(&self, id: i64) -> Result<(), EngineError> {
        let segment = self.get_segment_by_id(id)?;
        match std::fs::remove_file(&segment.file_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.catalog.delete_segment(id)?;
        self.catalog.log_event(
            EventKind::RetentionDeleted,
            Some(&segment.stream_name),
            &format!("deleted by operator: {}", segment.file_path),
            Some(&segment.file_path),
        )?;
        Ok(())
    }

    /// Open a completed segment for playback.
    ///
    /// The request-active set short-circuits concurrent starts for the same
    /// id: a duplicate request is answered from catalog metadata without
    /// touching the file again. Advisory only; readers use their own file
    /// descriptors.
    pub fn open_for_read(&self, id: i64) -> Result<PlaybackHandle, EngineError> {
        let segment = self.get_segment_by_id(id)?;
        if !segment.is_complete {
            return Err(EngineError::Conflict(format!(
                "segment {id} is still being written"
            )));
        }

        let first = self
            .active_reads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
        if !first {
            return Ok(PlaybackHandle {
                path: PathBuf::from(&segment.file_path),
                mime: "video/mp4",
                size_bytes: segment.size_bytes,
                _guard: None,
            });
        }

        let guard = ReadGuard {
            active: Arc::clone(&self.active_reads),
            id,
        };
        let metadata = std::fs::metadata(&segment.file_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::NotFound(format!("segment file {}", segment.file_path))
            } else {
                EngineError::Io(e)
            }
        })?;

        Ok(PlaybackHandle {
            path: PathBuf::from(&segment.file_path),
            mime: "video/mp4",
            size_bytes: metadata.len(),
            _guard: Some(guard),
        })
    }

    // ── timeline ────────────────────────────────────────────────────────

    /// Build an HLS-style manifest covering `[t0, t1]` for a stream.
    pub fn build_timeline_manifest(
        &self,
        stream: &str,
        t0: i64,
        t1: i64,
    ) -> Result<PathBuf, EngineError> {
        self.get_stream(stream)?;
        let segments = self.catalog.list_segments(&SegmentQuery {
            stream_name: Some(stream.to_string()),
            range_start: Some(t0),
            range_end: Some(t1),
            complete_only: true,
            order: SegmentOrder::StartAsc,
            limit: None,
            offset: None,
        })?;
        timeline::write_manifest(
            &self.config.storage_root.join("manifests"),
            stream,
            t0,
            t1,
            &segments,
        )
    }

    // ── events ──────────────────────────────────────────────────────────

    pub fn list_events(&self, query: &EventQuery) -> Result<Vec<Event>, EngineError> {
        Ok(self.catalog.list_events(query)?)
    }
}

impl Drop for RecordingEngine {
    fn drop(&mut self) {
        if self.running.load(Ordering::Relaxed) {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::TcpConnector;
    use tempfile::tempdir;

    fn engine(dir: &std::path::Path) -> RecordingEngine {
        let config = EngineConfig::new(dir);
        RecordingEngine::new(config, Arc::new(TcpConnector::default())).unwrap()
    }

    fn seeded_segment(engine: &RecordingEngine, stream: &str, start: i64, size: usize) -> i64 {
        let id = engine.catalog.next_segment_id().unwrap();
        let path = engine.store.layout().segment_path(stream, start, id);
        segment_store::SegmentLayout::ensure_parent(&path).unwrap();
        std::fs::write(&path, vec![0u8; size]).unwrap();
        let path_str = path.to_str().unwrap();
        engine
            .catalog
            .open_segment(stream, path_str, start, 640, 480, 10, "h264")
            .unwrap();
        engine
            .catalog
            .close_segment(path_str, start + 60, size as u64)
            .unwrap();
        id
    }

    #[test]
    fn test_stream_crud() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());

        let config = StreamConfig::new("cam-front", "tcp://127.0.0.1:9000");
        engine.create_stream(&config).unwrap();
        assert_eq!(engine.get_stream("cam-front").unwrap().url, config.url);
        assert_eq!(engine.list_streams().unwrap().len(), 1);

        let mut updated = config.clone();
        updated.fps = 15;
        engine.update_stream("cam-front", &updated).unwrap();
        assert_eq!(engine.get_stream("cam-front").unwrap().fps, 15);

        engine.delete_stream("cam-front", false).unwrap();
        assert!(!engine.get_stream("cam-front").unwrap().enabled);

        engine.delete_stream("cam-front", true).unwrap();
        assert!(matches!(
            engine.get_stream("cam-front"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_notify_detection_requires_stream() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        assert!(matches!(
            engine.notify_detection("ghost", 0.9, 100),
            Err(EngineError::NotFound(_))
        ));

        engine
            .create_stream(&StreamConfig::new("cam", "tcp://127.0.0.1:9000"))
            .unwrap();
        engine.notify_detection("cam", 0.9, 100).unwrap();
    }

    #[test]
    fn test_segments_surface() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .create_stream(&StreamConfig::new("cam", "tcp://127.0.0.1:9000"))
            .unwrap();

        let a = seeded_segment(&engine, "cam", 1000, 500);
        let b = seeded_segment(&engine, "cam", 2000, 500);

        let all = engine
            .list_segments_by_range(Some("cam"), None, None, None, None, SegmentOrder::StartAsc)
            .unwrap();
        assert_eq!(all.len(), 2);

        let ranged = engine
            .list_segments_by_range(
                Some("cam"),
                Some(1900),
                Some(2100),
                None,
                None,
                SegmentOrder::StartAsc,
            )
            .unwrap();
        assert_eq!(ranged.len(), 1);
        assert_eq!(ranged[0].id, b);

        let record = engine.get_segment_by_id(a).unwrap();
        engine.delete_segment_by_id(a).unwrap();
        assert!(!std::path::Path::new(&record.file_path).exists());
        assert!(matches!(
            engine.get_segment_by_id(a),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_open_for_read_and_dedup() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .create_stream(&StreamConfig::new("cam", "tcp://127.0.0.1:9000"))
            .unwrap();
        let id = seeded_segment(&engine, "cam", 1000, 4096);

        let first = engine.open_for_read(id).unwrap();
        assert_eq!(first.mime, "video/mp4");
        assert_eq!(first.size_bytes, 4096);

        // concurrent start short-circuits on catalog metadata
        let second = engine.open_for_read(id).unwrap();
        assert_eq!(second.size_bytes, 4096);

        drop(first);
        drop(second);
        // slot released; a fresh open verifies the file again
        let third = engine.open_for_read(id).unwrap();
        assert_eq!(third.size_bytes, 4096);
    }

    #[test]
    fn test_open_for_read_rejects_incomplete() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let id = engine
            .catalog
            .open_segment("cam", "/x/1-1.mp4", 1000, 640, 480, 10, "h264")
            .unwrap();
        assert!(matches!(
            engine.open_for_read(id),
            Err(EngineError::Conflict(_))
        ));
    }

    #[test]
    fn test_timeline_manifest() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .create_stream(&StreamConfig::new("cam", "tcp://127.0.0.1:9000"))
            .unwrap();
        seeded_segment(&engine, "cam", 1000, 100);
        seeded_segment(&engine, "cam", 1060, 100);

        let path = engine.build_timeline_manifest("cam", 900, 1300).unwrap();
        let manifest = std::fs::read_to_string(&path).unwrap();
        assert!(manifest.contains("#EXTM3U"));
        assert_eq!(manifest.matches("#EXTINF").count(), 2);
    }

    #[test]
    fn test_trigger_cleanup_without_start_runs_inline() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .create_stream(&StreamConfig::new("cam", "tcp://127.0.0.1:9000"))
            .unwrap();
        let mut policy = RetentionPolicy::for_stream("cam");
        policy.retention_days = 1;
        engine.update_recording_config(&policy).unwrap();

        let old = seeded_segment(
            &engine,
            "cam",
            chrono::Utc::now().timestamp() - 3 * 86_400,
            100,
        );
        engine.trigger_cleanup_now().unwrap();
        assert!(matches!(
            engine.get_segment_by_id(old),
            Err(EngineError::NotFound(_))
        ));
    }
}
