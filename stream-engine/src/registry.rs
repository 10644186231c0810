//! Process-wide map of actively recording streams.
//!
//! The one place that answers "is this stream recording, and in which
//! writer". Mutations swap handles in and out; closing a writer never
//! happens under the registry lock. Detach-then-close is the universal
//! pattern: take the handle out, release the lock, then close.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use segment_store::SegmentWriter;
use tracing::warn;

/// Shared handle to one in-flight writer. Clones are short-lived: a caller
/// holds one for the duration of a single operation.
pub type SharedWriter = Arc<Mutex<SegmentWriter>>;

#[derive(Default)]
pub struct WriterRegistry {
    writers: RwLock<HashMap<String, SharedWriter>>,
}

impl WriterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a writer for a stream. If one was already armed it is
    /// detached and returned; the caller must close it after this returns,
    /// outside any lock.
    #[must_use = "a returned previous writer must be closed by the caller"]
    pub fn arm(&self, stream: &str, writer: SegmentWriter) -> Option<SharedWriter> {
        let mut writers = self.writers.write().unwrap_or_else(|e| e.into_inner());
        writers.insert(stream.to_string(), Arc::new(Mutex::new(writer)))
    }

    /// Current handle for a stream, if armed. The clone keeps the writer
    /// alive for the caller's operation even across a concurrent disarm.
    pub fn handle(&self, stream: &str) -> Option<SharedWriter> {
        self.writers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(stream)
            .cloned()
    }

    /// Detach the writer for a stream, returning it for the caller to close.
    #[must_use = "a detached writer must be closed by the caller"]
    pub fn disarm(&self, stream: &str) -> Option<SharedWriter> {
        self.writers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(stream)
    }

    pub fn is_armed(&self, stream: &str) -> bool {
        self.writers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(stream)
    }

    pub fn armed_streams(&self) -> Vec<String> {
        self.writers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Detach every writer at once, for shutdown.
    pub fn detach_all(&self) -> Vec<(String, SharedWriter)> {
        let mut writers = self.writers.write().unwrap_or_else(|e| e.into_inner());
        writers.drain().collect()
    }
}

/// Unwrap a detached handle back into the owned writer so it can be closed.
///
/// Transient clones from [`WriterRegistry::handle`] are scoped to single
/// operations, so a short wait is enough. Gives up (and leaves the `.part`
/// file for boot-time recovery) if a clone is leaked.
pub fn take_writer(mut shared: SharedWriter) -> Option<SegmentWriter> {
    for _ in 0..500 {
        match Arc::try_unwrap(shared) {
            Ok(mutex) => return Some(mutex.into_inner().unwrap_or_else(|e| e.into_inner())),
            Err(back) => {
                shared = back;
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }
    warn!("writer handle still shared after detach; leaving file for recovery");
    None
}
