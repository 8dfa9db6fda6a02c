//! Storage seam shared by staged (batch) and durable (direct) execution.

use crate::error::Result;
use crate::repo::EntityUpdate;
use crate::store::PlanStore;
use crate::types::{Entity, EntityType, Link, NewEntity, NewLink};

/// What the operation executor needs from storage.
pub trait EntityBackend {
    /// Creates an entity. `new.id` is already assigned.
    fn create(&mut self, entity_type: EntityType, new: NewEntity) -> Result<Entity>;

    /// Applies a partial update with an optional version check.
    fn update(&mut self, entity_type: EntityType, id: &str, update: EntityUpdate) -> Result<Entity>;

    /// Deletes an entity.
    fn delete(&mut self, entity_type: EntityType, id: &str) -> Result<()>;

    /// Creates a link.
    fn create_link(&mut self, new: NewLink) -> Result<Link>;

    /// Deletes a link.
    fn delete_link(&mut self, id: &str) -> Result<()>;
}

/// Writes straight through the plan's repositories.
pub struct DurableBackend<'a> {
    store: &'a PlanStore,
    plan_id: String,
}

impl<'a> DurableBackend<'a> {
    /// Backend over `plan_id` of `store`.
    pub fn new(store: &'a PlanStore, plan_id: impl Into<String>) -> Self {
        Self {
            store,
            plan_id: plan_id.into(),
        }
    }
}

impl EntityBackend for DurableBackend<'_> {
    fn create(&mut self, entity_type: EntityType, new: NewEntity) -> Result<Entity> {
        self.store.entities(&self.plan_id, entity_type)?.create(new)
    }

    fn update(&mut self, entity_type: EntityType, id: &str, update: EntityUpdate) -> Result<Entity> {
        self.store
            .entities(&self.plan_id, entity_type)?
            .update(id, update)
    }

    fn delete(&mut self, entity_type: EntityType, id: &str) -> Result<()> {
        self.store.entities(&self.plan_id, entity_type)?.delete(id)
    }

    fn create_link(&mut self, new: NewLink) -> Result<Link> {
        self.store.links(&self.plan_id)?.create_link(new)
    }

    fn delete_link(&mut self, id: &str) -> Result<()> {
        self.store.links(&self.plan_id)?.delete_link(id)
    }
}
