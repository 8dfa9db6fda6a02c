//! File repositories for entities and links.

mod base;
mod entity;
mod link;

pub use base::BaseRepository;
pub use entity::{EntityRepository, EntityUpdate};
pub use link::LinkRepository;

use crate::config::Config;
use crate::layout::Layout;
use crate::lock::{FileLockManager, LockOptions, ResourceLockManager};
use crate::types::{Entity, Pagination};
use std::cmp::Ordering;
use std::sync::Arc;

/// Everything a repository needs from its store.
#[derive(Clone)]
pub struct RepoContext {
    /// Store layout.
    pub layout: Layout,
    /// In-process locks shared by every repository of the store.
    pub locks: Arc<ResourceLockManager>,
    /// Cross-process locks for records and index documents, if enabled.
    pub file_locks: Option<Arc<FileLockManager>>,
    /// Store configuration.
    pub config: Config,
}

impl RepoContext {
    /// Context without cross-process locking.
    pub fn new(layout: Layout, locks: Arc<ResourceLockManager>, config: Config) -> Self {
        Self {
            layout,
            locks,
            file_locks: None,
            config,
        }
    }

    /// Adds cross-process locking.
    pub fn with_file_locks(mut self, file_locks: Arc<FileLockManager>) -> Self {
        self.file_locks = Some(file_locks);
        self
    }

    /// Lock options derived from `[locks]`.
    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            ttl: self.config.locks.default_ttl(),
            acquire_timeout: self.config.locks.acquire_timeout(),
            ..LockOptions::default()
        }
    }
}

/// Sort key for entity queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    /// By id (index order).
    #[default]
    Id,
    /// By creation time.
    CreatedAt,
    /// By last update time.
    UpdatedAt,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Smallest first.
    #[default]
    Asc,
    /// Largest first.
    Desc,
}

type Filter = Box<dyn Fn(&Entity) -> bool + Send + Sync>;

/// Filter, sort and pagination for [`EntityRepository::query`].
#[derive(Default)]
pub struct QueryOptions {
    filter: Option<Filter>,
    sort: SortKey,
    order: SortOrder,
    pagination: Pagination,
}

impl QueryOptions {
    /// Everything, ordered by id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps only entities matching `predicate`.
    pub fn filter(mut self, predicate: impl Fn(&Entity) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Sort key and direction.
    pub fn sort_by(mut self, key: SortKey, order: SortOrder) -> Self {
        self.sort = key;
        self.order = order;
        self
    }

    /// Offset/limit window.
    pub fn paginate(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    pub(crate) fn matches(&self, entity: &Entity) -> bool {
        self.filter.as_ref().map_or(true, |f| f(entity))
    }

    pub(crate) fn compare(&self, a: &Entity, b: &Entity) -> Ordering {
        let ord = match self.sort {
            SortKey::Id => a.id.cmp(&b.id),
            SortKey::CreatedAt => a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)),
            SortKey::UpdatedAt => a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)),
        };
        match self.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    }

    pub(crate) fn pagination(&self) -> Pagination {
        self.pagination
    }
}
