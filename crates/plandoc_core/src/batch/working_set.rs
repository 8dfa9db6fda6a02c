//! In-memory working set a batch runs against.
//!
//! The whole plan is loaded up front. Operations mutate the in-memory copy
//! only; the first time a record is touched its pre-batch image is kept so
//! the flush can compute changes and the rollback can restore files.

use super::backend::EntityBackend;
use crate::error::{Result, StoreError};
use crate::repo::EntityUpdate;
use crate::types::{reserved_field_errors, Entity, EntityType, Link, NewEntity, NewLink};
use std::collections::BTreeMap;

/// Pending writes for one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionChanges<T> {
    /// Records to write verbatim.
    pub upserts: Vec<T>,
    /// Ids to delete.
    pub deletes: Vec<String>,
}

impl<T> Default for CollectionChanges<T> {
    fn default() -> Self {
        Self {
            upserts: Vec::new(),
            deletes: Vec::new(),
        }
    }
}

impl<T> CollectionChanges<T> {
    /// True when nothing needs writing.
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Staged state of a plan during a batch.
#[derive(Debug, Default)]
pub struct StagedBackend {
    entities: BTreeMap<EntityType, BTreeMap<String, Entity>>,
    links: BTreeMap<String, Link>,
    entity_originals: BTreeMap<(EntityType, String), Option<Entity>>,
    link_originals: BTreeMap<String, Option<Link>>,
    /// Entities touched by updates, with the first update's author.
    updated: BTreeMap<(EntityType, String), Option<String>>,
}

impl StagedBackend {
    /// Working set over a fully loaded plan.
    pub fn load(entities: BTreeMap<EntityType, Vec<Entity>>, links: Vec<Link>) -> Self {
        Self {
            entities: entities
                .into_iter()
                .map(|(t, list)| (t, list.into_iter().map(|e| (e.id.clone(), e)).collect()))
                .collect(),
            links: links.into_iter().map(|l| (l.id.clone(), l)).collect(),
            ..Self::default()
        }
    }

    fn collection(&mut self, entity_type: EntityType) -> &mut BTreeMap<String, Entity> {
        self.entities.entry(entity_type).or_default()
    }

    fn remember_entity(&mut self, entity_type: EntityType, id: &str, original: Option<Entity>) {
        self.entity_originals
            .entry((entity_type, id.to_string()))
            .or_insert(original);
    }

    fn remember_link(&mut self, id: &str, original: Option<Link>) {
        self.link_originals.entry(id.to_string()).or_insert(original);
    }

    /// Pre-batch images of entities changed by update operations that still
    /// existed before the batch, with the author of the first update. These
    /// are the history snapshots to write.
    pub fn updated_originals(&self) -> Vec<(Entity, Option<String>)> {
        self.updated
            .iter()
            .filter_map(|(key, author)| {
                let original = self.entity_originals.get(key).cloned().flatten()?;
                Some((original, author.clone()))
            })
            .collect()
    }

    /// Changes per entity type, computed against the pre-batch images.
    pub fn entity_changes(&self) -> BTreeMap<EntityType, CollectionChanges<Entity>> {
        let mut out: BTreeMap<EntityType, CollectionChanges<Entity>> = BTreeMap::new();
        for ((entity_type, id), original) in &self.entity_originals {
            let current = self.entities.get(entity_type).and_then(|c| c.get(id));
            let changes = out.entry(*entity_type).or_default();
            match (original, current) {
                (Some(before), Some(after)) if before == after => {}
                (_, Some(after)) => changes.upserts.push(after.clone()),
                (Some(_), None) => changes.deletes.push(id.clone()),
                (None, None) => {}
            }
        }
        out.retain(|_, c| !c.is_empty());
        out
    }

    /// Link changes, computed against the pre-batch images.
    pub fn link_changes(&self) -> CollectionChanges<Link> {
        let mut changes = CollectionChanges::default();
        for (id, original) in &self.link_originals {
            match (original, self.links.get(id)) {
                (Some(before), Some(after)) if before == after => {}
                (_, Some(after)) => changes.upserts.push(after.clone()),
                (Some(_), None) => changes.deletes.push(id.clone()),
                (None, None) => {}
            }
        }
        changes
    }

    /// Writes that restore every touched entity to its pre-batch image.
    pub fn entity_restores(&self) -> BTreeMap<EntityType, CollectionChanges<Entity>> {
        let mut out: BTreeMap<EntityType, CollectionChanges<Entity>> = BTreeMap::new();
        for ((entity_type, id), original) in &self.entity_originals {
            let changes = out.entry(*entity_type).or_default();
            match original {
                Some(before) => changes.upserts.push(before.clone()),
                None => changes.deletes.push(id.clone()),
            }
        }
        out
    }

    /// Writes that restore every touched link to its pre-batch image.
    pub fn link_restores(&self) -> CollectionChanges<Link> {
        let mut changes = CollectionChanges::default();
        for (id, original) in &self.link_originals {
            match original {
                Some(before) => changes.upserts.push(before.clone()),
                None => changes.deletes.push(id.clone()),
            }
        }
        changes
    }
}

impl EntityBackend for StagedBackend {
    fn create(&mut self, entity_type: EntityType, new: NewEntity) -> Result<Entity> {
        let id = new.validate()?;
        if self.collection(entity_type).contains_key(&id) {
            return Err(StoreError::DuplicateKey {
                kind: entity_type.as_str().to_string(),
                key: id,
            });
        }
        let entity = Entity::new(entity_type, id.clone(), new.fields);
        self.remember_entity(entity_type, &id, None);
        self.collection(entity_type).insert(id, entity.clone());
        Ok(entity)
    }

    fn update(&mut self, entity_type: EntityType, id: &str, update: EntityUpdate) -> Result<Entity> {
        let errors = reserved_field_errors(&update.patch);
        if !errors.is_empty() {
            return Err(StoreError::Validation { errors });
        }
        let current = self
            .collection(entity_type)
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(entity_type.as_str(), id))?;
        if let Some(expected) = update.expected_version {
            if expected != current.version {
                return Err(StoreError::VersionConflict {
                    id: id.to_string(),
                    expected,
                    actual: current.version,
                });
            }
        }

        self.remember_entity(entity_type, id, Some(current.clone()));
        self.updated
            .entry((entity_type, id.to_string()))
            .or_insert_with(|| update.author.clone());
        let mut next = current;
        next.apply_patch(&update.patch);
        self.collection(entity_type).insert(id.to_string(), next.clone());
        Ok(next)
    }

    fn delete(&mut self, entity_type: EntityType, id: &str) -> Result<()> {
        let removed = self
            .collection(entity_type)
            .remove(id)
            .ok_or_else(|| StoreError::not_found(entity_type.as_str(), id))?;
        self.remember_entity(entity_type, id, Some(removed));
        Ok(())
    }

    fn create_link(&mut self, new: NewLink) -> Result<Link> {
        let relation = new.validate()?;
        let taken = self.links.values().any(|l| {
            l.source_id == new.source_id && l.target_id == new.target_id && l.relation_type == relation
        });
        if taken {
            return Err(StoreError::DuplicateKey {
                kind: "link".to_string(),
                key: crate::types::composite_key(&new.source_id, &new.target_id, relation),
            });
        }
        if let Some(id) = &new.id {
            if self.links.contains_key(id) {
                return Err(StoreError::DuplicateKey {
                    kind: "link".to_string(),
                    key: id.clone(),
                });
            }
        }

        let link = new.into_link(relation);
        self.remember_link(&link.id, None);
        self.links.insert(link.id.clone(), link.clone());
        Ok(link)
    }

    fn delete_link(&mut self, id: &str) -> Result<()> {
        let removed = self
            .links
            .remove(id)
            .ok_or_else(|| StoreError::not_found("link", id))?;
        self.remember_link(id, Some(removed));
        Ok(())
    }
}
