//! Rebuildable JSON index per collection.
//!
//! Each collection (one entity type, or the links of a plan) keeps a single
//! index document next to its record files:
//!
//! ```json
//! { "schemaVersion": 1, "collection": "requirement", "updatedAt": "...", "entries": { "<id>": { ... } } }
//! ```
//!
//! Every mutation is one read-modify-write of that document, written
//! atomically while holding the collection gate (`<collection>:<planId>`).
//! The document can always be regenerated from the record files with
//! [`IndexManager::rebuild`].

use crate::config::{CacheConfig, CacheMode};
use crate::error::{Result, StoreError};
use crate::fsutil::{is_temp_file, read_json, write_json_atomic};
use crate::lock::{FileLockManager, LockOptions, ResourceLockManager};
use crate::types::{Entity, EntityType, Link, RelationType};
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Index schema version for migration support.
pub const INDEX_SCHEMA_VERSION: u32 = 1;

/// A row of an index document.
pub trait IndexEntry: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Record id, also the key in the document.
    fn id(&self) -> &str;

    /// Builds the row for a record file during rebuild. `None` skips the file.
    fn from_record(file_path: String, record: Value) -> Option<Self>;
}

/// Index row of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityIndexEntry {
    /// Entity id.
    pub id: String,
    /// Entity type.
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    /// Record file, relative to the plan directory.
    pub file_path: String,
    /// Entity version.
    pub version: u64,
    /// Last update of the entity.
    pub updated_at: DateTime<Utc>,
}

impl EntityIndexEntry {
    /// Row describing `entity` stored at `file_path`.
    pub fn new(entity: &Entity, file_path: String) -> Self {
        Self {
            id: entity.id.clone(),
            entity_type: entity.entity_type,
            file_path,
            version: entity.version,
            updated_at: entity.updated_at,
        }
    }
}

impl IndexEntry for EntityIndexEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn from_record(file_path: String, record: Value) -> Option<Self> {
        let entity: Entity = serde_json::from_value(record).ok()?;
        Some(Self::new(&entity, file_path))
    }
}

/// Index row of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkIndexEntry {
    /// Link id.
    pub id: String,
    /// Record file, relative to the plan directory.
    pub file_path: String,
    /// Link version.
    pub version: u64,
    /// Last update of the link.
    pub updated_at: DateTime<Utc>,
    /// Source entity.
    pub source_id: String,
    /// Target entity.
    pub target_id: String,
    /// Relation kind.
    pub relation_type: RelationType,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl LinkIndexEntry {
    /// Row describing `link` stored at `file_path`.
    pub fn new(link: &Link, file_path: String) -> Self {
        Self {
            id: link.id.clone(),
            file_path,
            version: link.version,
            updated_at: link.updated_at,
            source_id: link.source_id.clone(),
            target_id: link.target_id.clone(),
            relation_type: link.relation_type,
            created_at: link.created_at,
        }
    }

    /// The uniqueness key `(source, target, relation)`.
    pub fn composite_key(&self) -> String {
        crate::types::composite_key(&self.source_id, &self.target_id, self.relation_type)
    }
}

impl IndexEntry for LinkIndexEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn from_record(file_path: String, record: Value) -> Option<Self> {
        let link: Link = serde_json::from_value(record).ok()?;
        Some(Self::new(&link, file_path))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(deserialize = "E: DeserializeOwned"))]
struct IndexDocument<E> {
    schema_version: u32,
    collection: String,
    updated_at: DateTime<Utc>,
    entries: BTreeMap<String, E>,
}

/// Report from an index rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Rows written to the new document.
    pub entries_indexed: usize,
    /// Record files that could not be read or parsed.
    pub skipped: Vec<PathBuf>,
}

struct CachedEntry<E> {
    entry: E,
    cached_at: Instant,
}

struct IndexCache<E> {
    entries: LruCache<String, CachedEntry<E>>,
    mode: CacheMode,
    ttl: Duration,
}

impl<E: Clone> IndexCache<E> {
    fn get(&mut self, id: &str) -> Option<E> {
        let expired = match self.entries.get(id) {
            None => return None,
            Some(cached) => self.mode == CacheMode::Ttl && cached.cached_at.elapsed() >= self.ttl,
        };
        if expired {
            self.entries.pop(id);
            return None;
        }
        self.entries.get(id).map(|cached| cached.entry.clone())
    }

    fn put(&mut self, id: &str, entry: E) {
        self.entries.put(
            id.to_string(),
            CachedEntry {
                entry,
                cached_at: Instant::now(),
            },
        );
    }
}

/// Index over one collection of a plan.
pub struct IndexManager<E: IndexEntry> {
    collection: String,
    lock_key: String,
    path: PathBuf,
    records_dir: PathBuf,
    locks: Option<(Arc<ResourceLockManager>, LockOptions)>,
    file_locks: Option<Arc<FileLockManager>>,
    gate: Mutex<()>,
    cache: Option<Mutex<IndexCache<E>>>,
}

impl<E: IndexEntry> IndexManager<E> {
    /// Index for `collection` of `plan_id`, stored at `path` and rebuilt from
    /// the `*.json` files in `records_dir`. No cache, internal gate.
    pub fn new(
        collection: impl Into<String>,
        plan_id: &str,
        path: impl Into<PathBuf>,
        records_dir: impl Into<PathBuf>,
    ) -> Self {
        let collection = collection.into();
        Self {
            lock_key: format!("{}:{}", collection, plan_id),
            collection,
            path: path.into(),
            records_dir: records_dir.into(),
            locks: None,
            file_locks: None,
            gate: Mutex::new(()),
            cache: None,
        }
    }

    /// Gates mutations with the in-process lock for `<collection>:<planId>`.
    pub fn with_locks(mut self, locks: Arc<ResourceLockManager>, options: LockOptions) -> Self {
        self.locks = Some((locks, options));
        self
    }

    /// Also gates mutations with the cross-process lock for the same key.
    pub fn with_file_locks(mut self, file_locks: Arc<FileLockManager>) -> Self {
        self.file_locks = Some(file_locks);
        self
    }

    /// Enables the LRU cache as configured; capacity 0 leaves it off.
    pub fn with_cache(self, config: &CacheConfig) -> Self {
        self.with_cache_settings(config.index_capacity, config.index_mode, config.index_ttl())
    }

    /// Enables the LRU cache with explicit settings.
    pub fn with_cache_settings(mut self, capacity: usize, mode: CacheMode, ttl: Duration) -> Self {
        self.cache = NonZeroUsize::new(capacity).map(|cap| {
            Mutex::new(IndexCache {
                entries: LruCache::new(cap),
                mode,
                ttl,
            })
        });
        self
    }

    /// Collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Gate key `<collection>:<planId>`.
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Path of the index document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Relative file path recorded for `id`, e.g. `requirements/req-1.json`.
    pub fn file_path_for(&self, id: &str) -> String {
        let dir = self
            .records_dir
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(self.collection.as_str());
        format!("{}/{}.json", dir, id)
    }

    fn load(&self) -> Result<BTreeMap<String, E>> {
        let doc: Option<IndexDocument<E>> = match read_json(&self.path) {
            Ok(doc) => doc,
            Err(StoreError::Serialization(e)) => {
                return Err(StoreError::IndexCorrupted {
                    path: self.path.clone(),
                    message: e.to_string(),
                })
            }
            Err(e) => return Err(e),
        };
        match doc {
            None => Ok(BTreeMap::new()),
            Some(doc) if doc.schema_version > INDEX_SCHEMA_VERSION => Err(StoreError::IndexCorrupted {
                path: self.path.clone(),
                message: format!(
                    "unsupported schema version {} (expected {})",
                    doc.schema_version, INDEX_SCHEMA_VERSION
                ),
            }),
            Some(doc) => Ok(doc.entries),
        }
    }

    fn persist(&self, entries: BTreeMap<String, E>) -> Result<()> {
        let doc = IndexDocument {
            schema_version: INDEX_SCHEMA_VERSION,
            collection: self.collection.clone(),
            updated_at: Utc::now(),
            entries,
        };
        write_json_atomic(&self.path, &doc)
    }

    fn gated<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let run = || match &self.file_locks {
            Some(file_locks) => file_locks.with_lock(&self.lock_key, |_| f()),
            None => f(),
        };
        match &self.locks {
            Some((locks, options)) => locks.with_lock(&self.lock_key, options, |_| run()),
            None => {
                let _gate = self.gate.lock();
                run()
            }
        }
    }

    /// One atomic read-modify-write of the document.
    fn mutate<R>(&self, f: impl FnOnce(&mut BTreeMap<String, E>) -> Result<R>) -> Result<R> {
        self.gated(|| {
            let mut entries = self.load()?;
            let out = f(&mut entries)?;
            self.persist(entries)?;
            Ok(out)
        })
    }

    fn cache_put(&self, entry: &E) {
        if let Some(cache) = &self.cache {
            cache.lock().put(entry.id(), entry.clone());
        }
    }

    fn cache_drop(&self, id: &str) {
        if let Some(cache) = &self.cache {
            cache.lock().entries.pop(id);
        }
    }

    /// Looks up one row.
    pub fn get(&self, id: &str) -> Result<Option<E>> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().get(id) {
                return Ok(Some(hit));
            }
        }
        let found = self.load()?.remove(id);
        if let Some(entry) = &found {
            self.cache_put(entry);
        }
        Ok(found)
    }

    /// Every row, ordered by id.
    pub fn get_all(&self) -> Result<Vec<E>> {
        Ok(self.load()?.into_values().collect())
    }

    /// Rows matching `predicate`, ordered by id.
    pub fn find(&self, predicate: impl Fn(&E) -> bool) -> Result<Vec<E>> {
        Ok(self
            .load()?
            .into_values()
            .filter(|entry| predicate(entry))
            .collect())
    }

    /// Number of rows.
    pub fn len(&self) -> Result<usize> {
        Ok(self.load()?.len())
    }

    /// True when the index has no rows.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Inserts a new row.
    ///
    /// # Errors
    ///
    /// `DuplicateKey` if the id is already indexed.
    pub fn add(&self, entry: E) -> Result<()> {
        self.mutate(|entries| {
            if entries.contains_key(entry.id()) {
                return Err(StoreError::DuplicateKey {
                    kind: self.collection.clone(),
                    key: entry.id().to_string(),
                });
            }
            entries.insert(entry.id().to_string(), entry.clone());
            Ok(())
        })?;
        self.cache_put(&entry);
        Ok(())
    }

    /// Replaces an existing row.
    ///
    /// # Errors
    ///
    /// `NotFound` if the id is not indexed.
    pub fn update(&self, entry: E) -> Result<()> {
        self.mutate(|entries| match entries.get_mut(entry.id()) {
            Some(slot) => {
                *slot = entry.clone();
                Ok(())
            }
            None => Err(StoreError::not_found(&self.collection, entry.id())),
        })?;
        self.cache_put(&entry);
        Ok(())
    }

    /// Removes a row.
    ///
    /// # Errors
    ///
    /// `NotFound` if the id is not indexed.
    pub fn delete(&self, id: &str) -> Result<()> {
        let result = self.mutate(|entries| match entries.remove(id) {
            Some(_) => Ok(()),
            None => Err(StoreError::not_found(&self.collection, id)),
        });
        self.cache_drop(id);
        result
    }

    /// Inserts or replaces many rows in one write.
    pub fn upsert_many(&self, batch: &[E]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.mutate(|entries| {
            for entry in batch {
                entries.insert(entry.id().to_string(), entry.clone());
            }
            Ok(())
        })?;
        for entry in batch {
            self.cache_put(entry);
        }
        Ok(())
    }

    /// Removes many rows in one write, returning how many existed.
    pub fn delete_many(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self.mutate(|entries| {
            Ok(ids.iter().filter(|id| entries.remove(id.as_str()).is_some()).count())
        });
        for id in ids {
            self.cache_drop(id);
        }
        removed
    }

    /// Regenerates the document from the record files.
    ///
    /// Files that cannot be parsed, or whose name does not match the record
    /// id, are skipped and reported.
    pub fn rebuild(&self) -> Result<RebuildReport> {
        let report = self.gated(|| {
            let mut report = RebuildReport::default();
            let mut entries = BTreeMap::new();

            let dir = match fs::read_dir(&self.records_dir) {
                Ok(dir) => Some(dir),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            for item in dir.into_iter().flatten() {
                let path = item?.path();
                if is_temp_file(&path) || path.extension().and_then(|s| s.to_str()) != Some("json") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                    report.skipped.push(path);
                    continue;
                };

                let parsed = read_json::<Value>(&path)
                    .ok()
                    .flatten()
                    .and_then(|record| E::from_record(self.file_path_for(&stem), record))
                    .filter(|entry| entry.id() == stem);
                match parsed {
                    Some(entry) => {
                        entries.insert(stem, entry);
                    }
                    None => {
                        warn!(path = %path.display(), collection = %self.collection, "skipping unreadable record during rebuild");
                        report.skipped.push(path);
                    }
                }
            }

            report.entries_indexed = entries.len();
            self.persist(entries)?;
            Ok(report)
        })?;

        if let Some(cache) = &self.cache {
            cache.lock().entries.clear();
        }
        info!(
            collection = %self.collection,
            lock_key = %self.lock_key,
            indexed = report.entries_indexed,
            skipped = report.skipped.len(),
            "index rebuilt"
        );
        Ok(report)
    }

    /// Drops every cached row.
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().entries.clear();
            debug!(collection = %self.collection, "index cache cleared");
        }
    }
}
