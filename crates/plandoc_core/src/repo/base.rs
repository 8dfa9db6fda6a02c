//! One-file-per-record storage with an LRU read cache.

use crate::error::Result;
use crate::fsutil::{read_json, remove_if_exists, write_json_atomic};
use crate::types::Record;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Stores records of one kind as `<dir>/<id>.json`.
pub struct BaseRepository<T: Record> {
    kind: String,
    dir: PathBuf,
    initialized: Mutex<bool>,
    cache: Option<Mutex<LruCache<String, T>>>,
}

impl<T: Record> BaseRepository<T> {
    /// Repository for `kind` records in `dir`. A zero `cache_capacity`
    /// disables caching.
    pub fn new(kind: impl Into<String>, dir: impl Into<PathBuf>, cache_capacity: usize) -> Self {
        Self {
            kind: kind.into(),
            dir: dir.into(),
            initialized: Mutex::new(false),
            cache: NonZeroUsize::new(cache_capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    /// Record kind, used in errors.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Record directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the record directory on first use.
    pub fn ensure_initialized(&self) -> Result<()> {
        let mut initialized = self.initialized.lock();
        if !*initialized {
            fs::create_dir_all(&self.dir)?;
            *initialized = true;
            debug!(kind = %self.kind, dir = %self.dir.display(), "repository initialized");
        }
        Ok(())
    }

    /// File of record `id`.
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Reads a record, serving from the cache when possible.
    pub fn read(&self, id: &str) -> Result<Option<T>> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().get(id) {
                return Ok(Some(hit.clone()));
            }
        }
        let record: Option<T> = read_json(&self.path_for(id))?;
        if let Some(record) = &record {
            self.cache_put(record);
        }
        Ok(record)
    }

    /// Writes a record atomically and refreshes the cache.
    pub fn write(&self, record: &T) -> Result<()> {
        self.ensure_initialized()?;
        write_json_atomic(&self.path_for(record.id()), record)?;
        self.cache_put(record);
        Ok(())
    }

    /// Deletes a record file, returning whether it existed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        self.invalidate(id);
        remove_if_exists(&self.path_for(id))
    }

    /// Drops `id` from the cache.
    pub fn invalidate(&self, id: &str) {
        if let Some(cache) = &self.cache {
            cache.lock().pop(id);
        }
    }

    /// Drops every cached record.
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
    }

    fn cache_put(&self, record: &T) {
        if let Some(cache) = &self.cache {
            cache.lock().put(record.id().to_string(), record.clone());
        }
    }
}
