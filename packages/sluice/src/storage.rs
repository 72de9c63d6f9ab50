//! Blob store: the disk-resident KV seam under the promise store.
//!
//! The engine is deliberately behind a trait. The core only needs an
//! ordered, hash-indexed KV store with variable-length values; everything
//! else about the engine (log layout, compaction, caching) is its own
//! business. Two implementations ship:
//!
//! - [`SledBlobStore`] — sled-backed, used whenever a filesystem `path` is
//!   configured.
//! - [`MemoryBlobStore`] — a concurrent map, used for the empty-path
//!   configuration and in tests.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::ServerOptions;
use crate::error::SluiceError;
use crate::promise::PromiseId;

/// Storage seam for persisted promise blobs.
///
/// Keys are the fixed 12-byte promise id encoding; values are whole blob
/// records. All operations are synchronous: the promise store calls them
/// from completion handlers, which never run under a lock.
pub trait BlobStore: Send + Sync {
    fn put(&self, id: PromiseId, value: &[u8]) -> Result<(), SluiceError>;

    fn get(&self, id: PromiseId) -> Result<Option<Bytes>, SluiceError>;

    fn remove(&self, id: PromiseId) -> Result<(), SluiceError>;

    /// Flush buffered writes to durable storage.
    fn flush(&self) -> Result<(), SluiceError>;
}

/// Build the blob store described by the options: sled when a path is
/// configured, memory-only otherwise.
pub fn open_blob_store(options: &ServerOptions) -> Result<Arc<dyn BlobStore>, SluiceError> {
    if options.path.is_empty() {
        Ok(Arc::new(MemoryBlobStore::new()))
    } else {
        Ok(Arc::new(SledBlobStore::open(options)?))
    }
}

// =============================================================================
// Sled
// =============================================================================

/// Sled-backed blob store.
pub struct SledBlobStore {
    db: sled::Db,
    path: PathBuf,
    delete_on_dispose: bool,
}

impl SledBlobStore {
    /// Open (or create) the store at `options.path`.
    ///
    /// `hash_index_size` is an entry-count budget; sled sizes its cache in
    /// bytes, so the budget is converted at an approximate per-entry index
    /// cost. `preallocate` has no sled equivalent and is ignored here.
    pub fn open(options: &ServerOptions) -> Result<Self, SluiceError> {
        const APPROX_INDEX_ENTRY_BYTES: u64 = 64;

        let path = PathBuf::from(&options.path);
        let cache = (options.clamped_hash_index_size() as u64)
            .saturating_mul(APPROX_INDEX_ENTRY_BYTES);
        let db = sled::Config::new()
            .path(&path)
            .cache_capacity(cache)
            .open()
            .map_err(|e| SluiceError::Persistence(format!("failed to open blob store: {e}")))?;

        debug!(path = %path.display(), cache_capacity = cache, "opened blob store");
        Ok(Self {
            db,
            path,
            delete_on_dispose: options.delete_on_dispose,
        })
    }
}

impl BlobStore for SledBlobStore {
    fn put(&self, id: PromiseId, value: &[u8]) -> Result<(), SluiceError> {
        self.db
            .insert(id.to_key_bytes(), value)
            .map(|_| ())
            .map_err(|e| SluiceError::Persistence(format!("write failed for {id}: {e}")))
    }

    fn get(&self, id: PromiseId) -> Result<Option<Bytes>, SluiceError> {
        self.db
            .get(id.to_key_bytes())
            .map(|found| found.map(|value| Bytes::copy_from_slice(&value)))
            .map_err(|e| SluiceError::Persistence(format!("read failed for {id}: {e}")))
    }

    fn remove(&self, id: PromiseId) -> Result<(), SluiceError> {
        self.db
            .remove(id.to_key_bytes())
            .map(|_| ())
            .map_err(|e| SluiceError::Persistence(format!("remove failed for {id}: {e}")))
    }

    fn flush(&self) -> Result<(), SluiceError> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| SluiceError::Persistence(format!("flush failed: {e}")))
    }
}

impl Drop for SledBlobStore {
    fn drop(&mut self) {
        if !self.delete_on_dispose {
            return;
        }
        // Unlinking while the db is still open is fine on the platforms we
        // support; sled closes its handles when the field drops after us.
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to delete blob store on dispose");
        }
    }
}

// =============================================================================
// Memory
// =============================================================================

/// In-memory blob store for the empty-path configuration and tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    values: DashMap<PromiseId, Bytes>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, id: PromiseId, value: &[u8]) -> Result<(), SluiceError> {
        self.values.insert(id, Bytes::copy_from_slice(value));
        Ok(())
    }

    fn get(&self, id: PromiseId) -> Result<Option<Bytes>, SluiceError> {
        Ok(self.values.get(&id).map(|value| value.clone()))
    }

    fn remove(&self, id: PromiseId) -> Result<(), SluiceError> {
        self.values.remove(&id);
        Ok(())
    }

    fn flush(&self) -> Result<(), SluiceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryBlobStore::new();
        let id = PromiseId::new(1, 42);

        assert_eq!(store.get(id).unwrap(), None);
        store.put(id, b"hello").unwrap();
        assert_eq!(store.get(id).unwrap().unwrap().as_ref(), b"hello");
        assert_eq!(store.len(), 1);

        store.remove(id).unwrap();
        assert_eq!(store.get(id).unwrap(), None);
    }

    #[test]
    fn sled_store_round_trip_in_temp_dir() {
        let dir = std::env::temp_dir().join(format!("sluice-blob-test-{}", std::process::id()));
        let options = ServerOptions::builder()
            .path(dir.to_string_lossy().into_owned())
            .delete_on_dispose(true)
            .build();

        {
            let store = SledBlobStore::open(&options).unwrap();
            let id = PromiseId::new(7, 7);
            store.put(id, b"durable").unwrap();
            store.flush().unwrap();
            assert_eq!(store.get(id).unwrap().unwrap().as_ref(), b"durable");
            store.remove(id).unwrap();
            assert_eq!(store.get(id).unwrap(), None);
        }

        // delete_on_dispose unlinked the directory.
        assert!(!dir.exists());
    }

    #[test]
    fn empty_path_selects_the_memory_store() {
        let options = ServerOptions::builder().build();
        assert!(open_blob_store(&options).is_ok());
    }
}
