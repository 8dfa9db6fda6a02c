//! Repository of the links of one plan.

use super::base::BaseRepository;
use super::RepoContext;
use crate::error::{Result, StoreError};
use crate::index::{IndexManager, LinkIndexEntry, RebuildReport};
use crate::layout::LINKS;
use crate::lock::{FileLockManager, LockOptions, ResourceLockManager};
use crate::types::{composite_key, ensure_id, Link, LinkDirection, NewLink, RelationType};
use std::sync::Arc;
use tracing::{debug, warn};

/// Links of one plan: `plans/<plan>/links/<id>.json` plus the link index.
///
/// `(sourceId, targetId, relationType)` is unique. Creation and deletion
/// serialize on `link:<plan>:<source>|<target>|<relation>`.
pub struct LinkRepository {
    plan_id: String,
    base: BaseRepository<Link>,
    index: IndexManager<LinkIndexEntry>,
    locks: Arc<ResourceLockManager>,
    lock_options: LockOptions,
    file_locks: Option<Arc<FileLockManager>>,
}

impl LinkRepository {
    /// Link repository of `plan_id`.
    pub fn new(ctx: &RepoContext, plan_id: &str) -> Self {
        let layout = &ctx.layout;
        let dir = layout.links_dir(plan_id);
        let lock_options = ctx.lock_options();

        let mut index = IndexManager::new(LINKS, plan_id, layout.links_index_path(plan_id), dir.clone())
            .with_locks(Arc::clone(&ctx.locks), lock_options.clone())
            .with_cache(&ctx.config.cache);
        if let Some(file_locks) = &ctx.file_locks {
            index = index.with_file_locks(Arc::clone(file_locks));
        }

        Self {
            plan_id: plan_id.to_string(),
            base: BaseRepository::new("link", dir, ctx.config.cache.entity_capacity),
            index,
            locks: Arc::clone(&ctx.locks),
            lock_options,
            file_locks: ctx.file_locks.clone(),
        }
    }

    /// The link index.
    pub fn index(&self) -> &IndexManager<LinkIndexEntry> {
        &self.index
    }

    fn lock_key(&self, key: &str) -> String {
        format!("link:{}:{}", self.plan_id, key)
    }

    /// Runs `f` holding the lock on a `(source, target, relation)` key, in
    /// process and, when enabled, across processes.
    fn locked<T>(&self, key: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock_key = self.lock_key(key);
        self.locks.with_lock(&lock_key, &self.lock_options, |_| match &self.file_locks {
            Some(file_locks) => file_locks.with_lock(&lock_key, |_| f()),
            None => f(),
        })
    }

    fn row(&self, link: &Link) -> LinkIndexEntry {
        LinkIndexEntry::new(link, self.index.file_path_for(&link.id))
    }

    fn load_rows(&self, rows: Vec<LinkIndexEntry>) -> Result<Vec<Link>> {
        let mut links = Vec::with_capacity(rows.len());
        for row in rows {
            match self.base.read(&row.id)? {
                Some(link) => links.push(link),
                None => warn!(plan_id = %self.plan_id, link_id = %row.id, "indexed link has no file"),
            }
        }
        Ok(links)
    }

    fn find_rows(
        &self,
        relation: Option<RelationType>,
        matches: impl Fn(&LinkIndexEntry) -> bool,
    ) -> Result<Vec<Link>> {
        let rows = self
            .index
            .find(|row| relation.map_or(true, |r| row.relation_type == r) && matches(row))?;
        self.load_rows(rows)
    }

    /// Creates a link.
    ///
    /// # Errors
    ///
    /// `Validation` (before any I/O) for bad ids, self-links or an unknown
    /// relation; `DuplicateKey` if the triple or the id already exists.
    pub fn create_link(&self, new: NewLink) -> Result<Link> {
        let relation = new.validate()?;
        let key = composite_key(&new.source_id, &new.target_id, relation);

        self.locked(&key, || {
            let taken = self.index.find(|row| {
                row.source_id == new.source_id
                    && row.target_id == new.target_id
                    && row.relation_type == relation
            })?;
            if !taken.is_empty() {
                return Err(StoreError::DuplicateKey {
                    kind: "link".to_string(),
                    key: key.clone(),
                });
            }
            if let Some(id) = &new.id {
                if self.index.get(id)?.is_some() {
                    return Err(StoreError::DuplicateKey {
                        kind: "link".to_string(),
                        key: id.clone(),
                    });
                }
            }

            let link = new.into_link(relation);
            self.base.write(&link)?;
            if let Err(e) = self.index.add(self.row(&link)) {
                if let Err(cleanup) = self.base.remove(&link.id) {
                    warn!(plan_id = %self.plan_id, link_id = %link.id, error = %cleanup, "failed to remove unindexed link file");
                }
                return Err(e);
            }
            debug!(plan_id = %self.plan_id, link_id = %link.id, key = %key, "link created");
            Ok(link)
        })
    }

    /// Loads a link.
    ///
    /// # Errors
    ///
    /// `NotFound` if it does not exist.
    pub fn get_link_by_id(&self, id: &str) -> Result<Link> {
        ensure_id("id", id)?;
        self.base
            .read(id)?
            .ok_or_else(|| StoreError::not_found("link", id))
    }

    /// Links starting at `source_id`.
    pub fn find_links_by_source(&self, source_id: &str, relation: Option<RelationType>) -> Result<Vec<Link>> {
        self.find_rows(relation, |row| row.source_id == source_id)
    }

    /// Links pointing at `target_id`.
    pub fn find_links_by_target(&self, target_id: &str, relation: Option<RelationType>) -> Result<Vec<Link>> {
        self.find_rows(relation, |row| row.target_id == target_id)
    }

    /// Links touching `entity_id` on the requested side(s).
    pub fn find_links_for_entity(
        &self,
        entity_id: &str,
        direction: LinkDirection,
        relation: Option<RelationType>,
    ) -> Result<Vec<Link>> {
        self.find_rows(relation, |row| match direction {
            LinkDirection::Outgoing => row.source_id == entity_id,
            LinkDirection::Incoming => row.target_id == entity_id,
            LinkDirection::Both => row.source_id == entity_id || row.target_id == entity_id,
        })
    }

    /// True if the triple exists.
    pub fn link_exists(&self, source_id: &str, target_id: &str, relation: RelationType) -> Result<bool> {
        Ok(!self
            .index
            .find(|row| {
                row.source_id == source_id && row.target_id == target_id && row.relation_type == relation
            })?
            .is_empty())
    }

    /// Every link, ordered by id.
    pub fn find_all(&self) -> Result<Vec<Link>> {
        self.load_rows(self.index.get_all()?)
    }

    /// Number of indexed links.
    pub fn count(&self) -> Result<usize> {
        self.index.len()
    }

    /// Deletes a link. Existence is checked again once the link's lock is held.
    ///
    /// # Errors
    ///
    /// `NotFound` if it does not exist (or was deleted concurrently).
    pub fn delete_link(&self, id: &str) -> Result<()> {
        ensure_id("id", id)?;
        let row = self
            .index
            .get(id)?
            .ok_or_else(|| StoreError::not_found("link", id))?;

        self.locked(&row.composite_key(), || {
            self.index.clear_cache();
            if self.index.get(id)?.is_none() {
                return Err(StoreError::not_found("link", id));
            }
            self.base.remove(id)?;
            self.index.delete(id)?;
            debug!(plan_id = %self.plan_id, link_id = %id, "link deleted");
            Ok(())
        })
    }

    /// Deletes every link touching `entity_id`, returning how many went.
    pub fn delete_links_for_entity(&self, entity_id: &str) -> Result<usize> {
        let rows = self.index.find(|row| row.source_id == entity_id || row.target_id == entity_id)?;
        let mut deleted = 0;
        for row in rows {
            match self.delete_link(&row.id) {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// Writes links verbatim and indexes them in one write.
    pub fn upsert_many(&self, links: &[Link]) -> Result<()> {
        for link in links {
            ensure_id("id", &link.id)?;
        }
        for link in links {
            self.locked(&link.composite_key(), || self.base.write(link))?;
        }
        let rows: Vec<_> = links.iter().map(|l| self.row(l)).collect();
        self.index.upsert_many(&rows)
    }

    /// Deletes links by id, returning how many existed.
    pub fn delete_many(&self, ids: &[String]) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            ensure_id("id", id)?;
            if self.base.remove(id)? {
                removed += 1;
            }
        }
        self.index.delete_many(ids)?;
        Ok(removed)
    }

    /// Regenerates the link index from the link files.
    pub fn rebuild_index(&self) -> Result<RebuildReport> {
        self.base.clear_cache();
        self.index.rebuild()
    }
}
