//! plandoc Core Library
//!
//! A file-backed store for planning documents, providing:
//! - Typed entities (requirements, solutions, phases, decisions, artifacts)
//!   stored one JSON file each, with optimistic versioning
//! - Directed, uniquely keyed links between entities
//! - Atomic multi-operation batches with placeholder ids
//! - Bounded per-entity version history with field-level diffs
//! - In-process and cross-process locking around every write
//!
//! # Quick Start
//!
//! ```
//! use plandoc_core::{EntityType, NewEntity, NewPlan, PlanStore};
//! use serde_json::json;
//! use tempfile::TempDir;
//!
//! let tmp = TempDir::new().unwrap();
//! let store = PlanStore::open(tmp.path()).unwrap();
//! store.create_plan(NewPlan::named("Auth").id("auth")).unwrap();
//!
//! let requirements = store.entities("auth", EntityType::Requirement).unwrap();
//! let created = requirements
//!     .create(NewEntity::from_value(json!({"title": "Users can log in"})).unwrap())
//!     .unwrap();
//! assert_eq!(created.version, 1);
//! ```
//!
//! # Features
//!
//! ## Optimistic Versioning
//!
//! Every committed update bumps `version`; an update that names a stale
//! expected version fails without writing:
//!
//! ```
//! use plandoc_core::{EntityType, EntityUpdate, NewEntity, NewPlan, PlanStore};
//! use serde_json::json;
//! use tempfile::TempDir;
//!
//! let tmp = TempDir::new().unwrap();
//! let store = PlanStore::open(tmp.path()).unwrap();
//! store.create_plan(NewPlan::named("p").id("p")).unwrap();
//! let repo = store.entities("p", EntityType::Decision).unwrap();
//! repo.create(NewEntity::from_value(json!({"title": "Use JSON"})).unwrap().id("d1"))
//!     .unwrap();
//!
//! let patch = json!({"title": "Use TOML"}).as_object().cloned().unwrap();
//! repo.update("d1", EntityUpdate::patch(patch.clone()).expect_version(1)).unwrap();
//! let err = repo.update("d1", EntityUpdate::patch(patch).expect_version(1)).unwrap_err();
//! assert!(err.is_conflict());
//! ```
//!
//! ## Batches
//!
//! Operations in a batch either all persist or none do. Placeholders starting
//! with `$` name entities created earlier in the same batch:
//!
//! ```
//! use plandoc_core::{BatchOperation, EntityType, NewEntity, NewLink, NewPlan, PlanStore, RelationType};
//! use serde_json::json;
//! use tempfile::TempDir;
//!
//! let tmp = TempDir::new().unwrap();
//! let store = PlanStore::open(tmp.path()).unwrap();
//! store.create_plan(NewPlan::named("p").id("p")).unwrap();
//!
//! let result = store
//!     .batch()
//!     .execute_batch(
//!         "p",
//!         vec![
//!             BatchOperation::create_as(
//!                 "$req",
//!                 EntityType::Requirement,
//!                 NewEntity::from_value(json!({"title": "Login"})).unwrap(),
//!             ),
//!             BatchOperation::create_as(
//!                 "$sol",
//!                 EntityType::Solution,
//!                 NewEntity::from_value(json!({"title": "OAuth"})).unwrap(),
//!             ),
//!             BatchOperation::link(NewLink::new("$sol", "$req", RelationType::Addresses)),
//!         ],
//!     )
//!     .unwrap();
//! assert_eq!(result.temp_id_map.len(), 2);
//! assert_eq!(result.stats.links, 1);
//! ```

mod batch;
mod config;
mod error;
mod fsutil;
mod history;
mod index;
mod layout;
mod lock;
mod repo;
mod store;
mod types;

pub use batch::{
    apply_operation, is_temp_id, BatchOperation, BatchResult, BatchService, CollectionChanges,
    DurableBackend, EntityBackend, OperationResult, StagedBackend, TempIdResolver,
};
pub use config::{
    CacheConfig, CacheMode, Config, FileLockConfig, HistoryDefaults, LockConfig, CONFIG_FILE,
};
pub use error::{DenyReason, FieldError, Result, StoreError};
pub use history::{FieldChange, SnapshotSink, VersionDiff, VersionHistoryService, VersionSnapshot};
pub use index::{
    EntityIndexEntry, IndexEntry, IndexManager, LinkIndexEntry, RebuildReport,
    INDEX_SCHEMA_VERSION,
};
pub use layout::Layout;
pub use lock::{
    AcquireOutcome, FileLockManager, LockHandle, LockId, LockInfo, LockOptions,
    ResourceLockManager, SweepReport,
};
pub use repo::{
    BaseRepository, EntityRepository, EntityUpdate, LinkRepository, QueryOptions, RepoContext,
    SortKey, SortOrder,
};
pub use store::PlanStore;
pub use types::*;
