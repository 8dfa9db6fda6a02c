//! Atomic multi-operation batches.
//!
//! A batch loads the plan into a [`StagedBackend`], runs every operation in
//! order against it, and only writes to disk once all of them succeed:
//!
//! 1. history snapshots of the pre-batch state of updated entities
//! 2. flush of changed entity collections and links
//! 3. one recomputation of the plan stats, written to the manifest
//!
//! Any operation error discards the working set. A flush error restores the
//! files already written from the pre-batch images, best-effort.
//!
//! Batches on the same plan are not mutually exclusive; the last flush wins.

mod backend;
mod temp_ids;
mod working_set;

pub use backend::{DurableBackend, EntityBackend};
pub use temp_ids::{is_temp_id, TempIdResolver};
pub use working_set::{CollectionChanges, StagedBackend};

use crate::error::Result;
use crate::repo::EntityUpdate;
use crate::store::PlanStore;
use crate::types::{Entity, EntityType, Link, NewEntity, NewLink, PlanStats};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Author recorded on batch snapshots when the update names none.
const BATCH_AUTHOR: &str = "batch";

/// One step of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    /// Create an entity; `temp_id` lets later operations refer to it.
    CreateEntity {
        /// Entity type.
        entity_type: EntityType,
        /// Placeholder such as `$req1`.
        temp_id: Option<String>,
        /// Payload and optional explicit id.
        payload: NewEntity,
    },
    /// Update an entity.
    UpdateEntity {
        /// Entity type.
        entity_type: EntityType,
        /// Target id or placeholder.
        id: String,
        /// Patch, expected version, author.
        update: EntityUpdate,
    },
    /// Delete an entity.
    DeleteEntity {
        /// Entity type.
        entity_type: EntityType,
        /// Target id or placeholder.
        id: String,
    },
    /// Create a link; endpoints may be placeholders.
    CreateLink {
        /// Placeholder for the new link.
        temp_id: Option<String>,
        /// Link input.
        link: NewLink,
    },
    /// Delete a link.
    DeleteLink {
        /// Link id or placeholder.
        id: String,
    },
}

impl BatchOperation {
    /// Create operation without a placeholder.
    pub fn create(entity_type: EntityType, payload: NewEntity) -> Self {
        Self::CreateEntity {
            entity_type,
            temp_id: None,
            payload,
        }
    }

    /// Create operation bound to `temp_id`.
    pub fn create_as(temp_id: impl Into<String>, entity_type: EntityType, payload: NewEntity) -> Self {
        Self::CreateEntity {
            entity_type,
            temp_id: Some(temp_id.into()),
            payload,
        }
    }

    /// Update operation.
    pub fn update(entity_type: EntityType, id: impl Into<String>, update: EntityUpdate) -> Self {
        Self::UpdateEntity {
            entity_type,
            id: id.into(),
            update,
        }
    }

    /// Delete operation.
    pub fn delete(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self::DeleteEntity {
            entity_type,
            id: id.into(),
        }
    }

    /// Link creation.
    pub fn link(link: NewLink) -> Self {
        Self::CreateLink { temp_id: None, link }
    }

    /// Link creation bound to `temp_id`.
    pub fn link_as(temp_id: impl Into<String>, link: NewLink) -> Self {
        Self::CreateLink {
            temp_id: Some(temp_id.into()),
            link,
        }
    }

    /// Link deletion.
    pub fn unlink(id: impl Into<String>) -> Self {
        Self::DeleteLink { id: id.into() }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateEntity { .. } => "create_entity",
            Self::UpdateEntity { .. } => "update_entity",
            Self::DeleteEntity { .. } => "delete_entity",
            Self::CreateLink { .. } => "create_link",
            Self::DeleteLink { .. } => "delete_link",
        }
    }
}

/// Outcome of one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    /// The created entity.
    Created(Entity),
    /// The entity after the update.
    Updated(Entity),
    /// An entity was deleted.
    Deleted {
        /// Entity type.
        entity_type: EntityType,
        /// Resolved id.
        id: String,
    },
    /// The created link.
    LinkCreated(Link),
    /// A link was deleted.
    LinkDeleted {
        /// Resolved id.
        id: String,
    },
}

/// Outcome of a committed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    /// One result per operation, in order.
    pub results: Vec<OperationResult>,
    /// Placeholder to real id.
    pub temp_id_map: BTreeMap<String, String>,
    /// Plan stats after the flush.
    pub stats: PlanStats,
}

/// Runs one operation against `backend`, resolving placeholders first.
pub fn apply_operation(
    backend: &mut dyn EntityBackend,
    resolver: &mut TempIdResolver,
    op: BatchOperation,
) -> Result<OperationResult> {
    match op {
        BatchOperation::CreateEntity {
            entity_type,
            temp_id,
            mut payload,
        } => {
            if let Some(temp_id) = &temp_id {
                resolver.check_unbound(temp_id)?;
            }
            resolver.resolve_fields(entity_type, &mut payload.fields)?;
            let entity = backend.create(entity_type, payload)?;
            if let Some(temp_id) = &temp_id {
                resolver.register(temp_id, &entity.id)?;
            }
            Ok(OperationResult::Created(entity))
        }
        BatchOperation::UpdateEntity {
            entity_type,
            id,
            mut update,
        } => {
            let id = resolver.resolve("id", &id)?;
            resolver.resolve_fields(entity_type, &mut update.patch)?;
            backend
                .update(entity_type, &id, update)
                .map(OperationResult::Updated)
        }
        BatchOperation::DeleteEntity { entity_type, id } => {
            let id = resolver.resolve("id", &id)?;
            backend.delete(entity_type, &id)?;
            Ok(OperationResult::Deleted { entity_type, id })
        }
        BatchOperation::CreateLink { temp_id, mut link } => {
            if let Some(temp_id) = &temp_id {
                resolver.check_unbound(temp_id)?;
            }
            resolver.resolve_link(&mut link)?;
            let created = backend.create_link(link)?;
            if let Some(temp_id) = &temp_id {
                resolver.register(temp_id, &created.id)?;
            }
            Ok(OperationResult::LinkCreated(created))
        }
        BatchOperation::DeleteLink { id } => {
            let id = resolver.resolve("id", &id)?;
            backend.delete_link(&id)?;
            Ok(OperationResult::LinkDeleted { id })
        }
    }
}

/// Batch and direct execution over a store.
pub struct BatchService<'a> {
    store: &'a PlanStore,
}

impl<'a> BatchService<'a> {
    /// Service over `store`.
    pub fn new(store: &'a PlanStore) -> Self {
        Self { store }
    }

    /// Runs `operations` atomically against `plan_id`.
    ///
    /// # Errors
    ///
    /// The first failing operation's error, unchanged; nothing is written in
    /// that case. Flush errors are returned after the rollback attempt.
    pub fn execute_batch(&self, plan_id: &str, operations: Vec<BatchOperation>) -> Result<BatchResult> {
        self.store.get_plan(plan_id)?;
        let mut staged = self.load_working_set(plan_id)?;
        let mut resolver = TempIdResolver::new();
        let total = operations.len();

        let mut results = Vec::with_capacity(total);
        for (index, op) in operations.into_iter().enumerate() {
            let kind = op.kind();
            match apply_operation(&mut staged, &mut resolver, op) {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(
                        plan_id,
                        op_index = index,
                        op = kind,
                        error = %e,
                        "batch operation failed, discarding working set"
                    );
                    return Err(e);
                }
            }
        }

        self.save_history(plan_id, &staged)?;
        if let Err(e) = self.flush(plan_id, &staged) {
            warn!(plan_id, error = %e, "batch flush failed, restoring pre-batch state");
            self.rollback(plan_id, &staged);
            return Err(e);
        }
        let stats = self.store.refresh_stats(plan_id)?;

        info!(plan_id, operations = total, "batch committed");
        Ok(BatchResult {
            results,
            temp_id_map: resolver.into_map(),
            stats,
        })
    }

    /// Runs a single operation straight against durable storage.
    /// Placeholders cannot be resolved here.
    pub fn execute_direct(&self, plan_id: &str, op: BatchOperation) -> Result<OperationResult> {
        self.store.get_plan(plan_id)?;
        let mut backend = DurableBackend::new(self.store, plan_id);
        let mut resolver = TempIdResolver::new();
        let result = apply_operation(&mut backend, &mut resolver, op)?;
        self.store.refresh_stats(plan_id)?;
        Ok(result)
    }

    fn load_working_set(&self, plan_id: &str) -> Result<StagedBackend> {
        let mut entities = BTreeMap::new();
        for entity_type in EntityType::ALL {
            let all = self.store.entities(plan_id, entity_type)?.find_all()?;
            entities.insert(entity_type, all);
        }
        let links = self.store.links(plan_id)?.find_all()?;
        debug!(plan_id, links = links.len(), "batch working set loaded");
        Ok(StagedBackend::load(entities, links))
    }

    fn save_history(&self, plan_id: &str, staged: &StagedBackend) -> Result<()> {
        let originals = staged.updated_originals();
        if originals.is_empty() {
            return Ok(());
        }
        let history = self.store.history(plan_id)?;
        for (original, author) in originals {
            history.save_version(&original, Some(author.as_deref().unwrap_or(BATCH_AUTHOR)))?;
        }
        Ok(())
    }

    fn flush(&self, plan_id: &str, staged: &StagedBackend) -> Result<()> {
        for (entity_type, changes) in staged.entity_changes() {
            let repo = self.store.entities(plan_id, entity_type)?;
            repo.upsert_many(&changes.upserts)?;
            repo.delete_many(&changes.deletes)?;
        }
        let links = staged.link_changes();
        if !links.is_empty() {
            let repo = self.store.links(plan_id)?;
            repo.upsert_many(&links.upserts)?;
            repo.delete_many(&links.deletes)?;
        }
        Ok(())
    }

    fn rollback(&self, plan_id: &str, staged: &StagedBackend) {
        for (entity_type, restore) in staged.entity_restores() {
            let outcome = self.store.entities(plan_id, entity_type).and_then(|repo| {
                repo.upsert_many(&restore.upserts)?;
                repo.delete_many(&restore.deletes)
            });
            if let Err(e) = outcome {
                warn!(plan_id, entity_type = %entity_type, error = %e, "rollback incomplete");
            }
        }
        let restore = staged.link_restores();
        if !restore.is_empty() {
            let outcome = self.store.links(plan_id).and_then(|repo| {
                repo.upsert_many(&restore.upserts)?;
                repo.delete_many(&restore.deletes)
            });
            if let Err(e) = outcome {
                warn!(plan_id, error = %e, "link rollback incomplete");
            }
        }
    }
}
