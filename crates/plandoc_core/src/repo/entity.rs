//! Repository of one entity type within one plan.

use super::base::BaseRepository;
use super::{QueryOptions, RepoContext};
use crate::error::{Result, StoreError};
use crate::history::SnapshotSink;
use crate::index::{EntityIndexEntry, IndexManager, RebuildReport};
use crate::lock::{FileLockManager, LockOptions, ResourceLockManager};
use crate::types::{
    ensure_id, reserved_field_errors, Entity, EntityType, NewEntity, Page,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// A partial update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityUpdate {
    /// Fields to set; `null` removes a field.
    pub patch: Map<String, Value>,
    /// Fail with `VersionConflict` unless the stored version matches.
    pub expected_version: Option<u64>,
    /// Recorded on the history snapshot.
    pub author: Option<String>,
}

impl EntityUpdate {
    /// Update applying `patch` without a version check.
    pub fn patch(patch: Map<String, Value>) -> Self {
        Self {
            patch,
            ..Self::default()
        }
    }

    /// Requires the stored version to be `version`.
    pub fn expect_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Sets the author recorded in history.
    pub fn by(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }
}

/// Entities of one type in one plan: `plans/<plan>/<type>s/<id>.json` plus
/// the type's index document.
pub struct EntityRepository {
    plan_id: String,
    entity_type: EntityType,
    base: BaseRepository<Entity>,
    index: IndexManager<EntityIndexEntry>,
    locks: Arc<ResourceLockManager>,
    lock_options: LockOptions,
    file_locks: Option<Arc<FileLockManager>>,
    history: Option<Arc<dyn SnapshotSink>>,
}

impl EntityRepository {
    /// Repository for `entity_type` entities of `plan_id`.
    pub fn new(ctx: &RepoContext, plan_id: &str, entity_type: EntityType) -> Self {
        let layout = &ctx.layout;
        let dir = layout.entity_dir(plan_id, entity_type);
        let lock_options = ctx.lock_options();

        let mut index = IndexManager::new(
            entity_type.as_str(),
            plan_id,
            layout.entity_index_path(plan_id, entity_type),
            dir.clone(),
        )
        .with_locks(Arc::clone(&ctx.locks), lock_options.clone())
        .with_cache(&ctx.config.cache);
        if let Some(file_locks) = &ctx.file_locks {
            index = index.with_file_locks(Arc::clone(file_locks));
        }

        Self {
            plan_id: plan_id.to_string(),
            entity_type,
            base: BaseRepository::new(entity_type.as_str(), dir, ctx.config.cache.entity_capacity),
            index,
            locks: Arc::clone(&ctx.locks),
            lock_options,
            file_locks: ctx.file_locks.clone(),
            history: None,
        }
    }

    /// Snapshots the previous state before every update.
    pub fn with_history(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.history = Some(sink);
        self
    }

    /// Plan id.
    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    /// Entity type.
    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// The type's index.
    pub fn index(&self) -> &IndexManager<EntityIndexEntry> {
        &self.index
    }

    /// Runs `f` holding the entity lock, and the entity's file lock when
    /// the store shares its root with other processes.
    fn locked<T>(&self, id: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.locks.with_lock(id, &self.lock_options, |_| match &self.file_locks {
            Some(file_locks) => file_locks.with_lock(&self.file_lock_key(id), |_| f()),
            None => f(),
        })
    }

    fn file_lock_key(&self, id: &str) -> String {
        format!("{}:{}:{}", self.entity_type, self.plan_id, id)
    }

    fn row(&self, entity: &Entity) -> EntityIndexEntry {
        EntityIndexEntry::new(entity, self.index.file_path_for(&entity.id))
    }

    fn not_found(&self, id: &str) -> StoreError {
        StoreError::not_found(self.entity_type.as_str(), id)
    }

    /// Loads an entity.
    ///
    /// # Errors
    ///
    /// `NotFound` if it does not exist.
    pub fn find_by_id(&self, id: &str) -> Result<Entity> {
        self.find_by_id_or_null(id)?
            .ok_or_else(|| self.not_found(id))
    }

    /// Loads an entity, `None` if it does not exist.
    pub fn find_by_id_or_null(&self, id: &str) -> Result<Option<Entity>> {
        if id.is_empty() {
            return Ok(None);
        }
        ensure_id("id", id)?;
        self.base.read(id)
    }

    /// True if the entity is indexed.
    pub fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.index.get(id)?.is_some())
    }

    /// Number of indexed entities.
    pub fn count(&self) -> Result<usize> {
        self.index.len()
    }

    /// Every entity, ordered by id. Rows whose file is missing are skipped.
    pub fn find_all(&self) -> Result<Vec<Entity>> {
        let mut out = Vec::new();
        for row in self.index.get_all()? {
            match self.base.read(&row.id)? {
                Some(entity) => out.push(entity),
                None => warn!(
                    plan_id = %self.plan_id,
                    entity_id = %row.id,
                    "indexed entity has no file; consider rebuild_index()"
                ),
            }
        }
        Ok(out)
    }

    /// Filtered, sorted, paginated listing.
    pub fn query(&self, options: &QueryOptions) -> Result<Page<Entity>> {
        let mut items: Vec<Entity> = self
            .find_all()?
            .into_iter()
            .filter(|e| options.matches(e))
            .collect();
        items.sort_by(|a, b| options.compare(a, b));
        Ok(options.pagination().apply(items))
    }

    /// Creates an entity at version 1.
    ///
    /// # Errors
    ///
    /// `Validation` for a bad id or reserved fields, `DuplicateKey` if the id
    /// is taken.
    pub fn create(&self, new: NewEntity) -> Result<Entity> {
        let id = new.validate()?;
        self.locked(&id, || {
            if self.base.read(&id)?.is_some() || self.index.get(&id)?.is_some() {
                return Err(StoreError::DuplicateKey {
                    kind: self.entity_type.as_str().to_string(),
                    key: id.clone(),
                });
            }

            let entity = Entity::new(self.entity_type, id.clone(), new.fields);
            self.base.write(&entity)?;
            if let Err(e) = self.index.add(self.row(&entity)) {
                if let Err(cleanup) = self.base.remove(&id) {
                    warn!(plan_id = %self.plan_id, entity_id = %id, error = %cleanup, "failed to remove unindexed entity file");
                }
                return Err(e);
            }
            debug!(plan_id = %self.plan_id, entity_id = %id, entity_type = %self.entity_type, "entity created");
            Ok(entity)
        })
    }

    /// Applies a partial update under the entity lock.
    ///
    /// # Errors
    ///
    /// `Validation` for reserved fields, `NotFound`, or `VersionConflict`
    /// when `expected_version` does not match; the entity is untouched in
    /// every error case.
    pub fn update(&self, id: &str, update: EntityUpdate) -> Result<Entity> {
        ensure_id("id", id)?;
        let errors = reserved_field_errors(&update.patch);
        if !errors.is_empty() {
            return Err(StoreError::Validation { errors });
        }

        self.locked(id, || {
            // bypass the cache so the version check sees the file
            self.base.invalidate(id);
            let current = self.base.read(id)?.ok_or_else(|| self.not_found(id))?;
            if let Some(expected) = update.expected_version {
                if expected != current.version {
                    return Err(StoreError::VersionConflict {
                        id: id.to_string(),
                        expected,
                        actual: current.version,
                    });
                }
            }

            if let Some(history) = &self.history {
                history.record(&current, update.author.as_deref())?;
            }

            let mut next = current;
            next.apply_patch(&update.patch);
            self.base.write(&next)?;
            self.index.upsert_many(&[self.row(&next)])?;
            debug!(plan_id = %self.plan_id, entity_id = %id, version = next.version, "entity updated");
            Ok(next)
        })
    }

    /// Deletes an entity. Links and history are left alone.
    ///
    /// # Errors
    ///
    /// `NotFound` if it does not exist.
    pub fn delete(&self, id: &str) -> Result<()> {
        ensure_id("id", id)?;
        self.locked(id, || {
            if !self.base.remove(id)? {
                return Err(self.not_found(id));
            }
            match self.index.delete(id) {
                Err(e) if e.is_not_found() => {
                    warn!(plan_id = %self.plan_id, entity_id = %id, "deleted entity was not indexed")
                }
                other => other?,
            }
            debug!(plan_id = %self.plan_id, entity_id = %id, "entity deleted");
            Ok(())
        })
    }

    /// Creates entities one by one, stopping at the first error.
    pub fn create_many(&self, batch: Vec<NewEntity>) -> Result<Vec<Entity>> {
        batch.into_iter().map(|new| self.create(new)).collect()
    }

    /// Updates entities one by one, stopping at the first error.
    pub fn update_many(&self, batch: Vec<(String, EntityUpdate)>) -> Result<Vec<Entity>> {
        batch
            .into_iter()
            .map(|(id, update)| self.update(&id, update))
            .collect()
    }

    /// Writes entities verbatim, versions and timestamps included, then
    /// indexes them in one write.
    pub fn upsert_many(&self, entities: &[Entity]) -> Result<()> {
        for entity in entities {
            ensure_id("id", &entity.id)?;
            if entity.entity_type != self.entity_type {
                return Err(StoreError::invalid(
                    "type",
                    format!(
                        "entity {} is a {}, not a {}",
                        entity.id, entity.entity_type, self.entity_type
                    ),
                ));
            }
        }
        for entity in entities {
            self.locked(&entity.id, || self.base.write(entity))?;
        }
        let rows: Vec<_> = entities.iter().map(|e| self.row(e)).collect();
        self.index.upsert_many(&rows)
    }

    /// Deletes entities, returning how many existed.
    pub fn delete_many(&self, ids: &[String]) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            ensure_id("id", id)?;
            if self.locked(id, || self.base.remove(id))? {
                removed += 1;
            }
        }
        self.index.delete_many(ids)?;
        Ok(removed)
    }

    /// Regenerates the index from the entity files.
    pub fn rebuild_index(&self) -> Result<RebuildReport> {
        self.base.clear_cache();
        self.index.rebuild()
    }
}
