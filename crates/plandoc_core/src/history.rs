//! Per-entity version snapshots.
//!
//! Before an update commits, the previous state of the entity is written to
//! `history/<entityId>/v<version>.json`. Files beyond the plan's
//! `maxHistoryDepth` are rotated out oldest first. Snapshots outlive the
//! entity they describe.

use crate::error::{Result, StoreError};
use crate::fsutil::{read_json, write_json_atomic};
use crate::layout::Layout;
use crate::types::{Entity, EntityType, HistoryPolicy, Page, Pagination, PlanManifest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use tracing::{debug, warn};

/// Fields ignored by [`VersionHistoryService::diff`].
const DIFF_IGNORED: [&str; 3] = ["version", "createdAt", "updatedAt"];

/// Receives the previous state of an entity right before an update commits.
pub trait SnapshotSink: Send + Sync {
    /// Records `previous` on behalf of `author`.
    fn record(&self, previous: &Entity, author: Option<&str>) -> Result<()>;
}

/// One retained state of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSnapshot {
    /// Version of `data`.
    pub version: u64,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Who made the update that superseded this state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Full entity state.
    pub data: Entity,
}

/// A changed top-level field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Value in the first version (`null` when absent).
    pub from: Value,
    /// Value in the second version (`null` when absent).
    pub to: Value,
}

/// Field-level difference between two versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDiff {
    /// Entity id.
    pub entity_id: String,
    /// First version.
    pub version1: u64,
    /// Second version.
    pub version2: u64,
    /// Changed fields, by name.
    pub changes: BTreeMap<String, FieldChange>,
}

impl VersionDiff {
    /// True when the versions carry the same payload.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Snapshot store of one plan.
pub struct VersionHistoryService {
    layout: Layout,
    plan_id: String,
}

impl VersionHistoryService {
    /// History of `plan_id`.
    pub fn new(layout: Layout, plan_id: impl Into<String>) -> Self {
        Self {
            layout,
            plan_id: plan_id.into(),
        }
    }

    /// The plan's retention policy, read from its manifest at call time.
    pub fn policy(&self) -> Result<HistoryPolicy> {
        let manifest: Option<PlanManifest> = read_json(&self.layout.manifest_path(&self.plan_id))?;
        Ok(manifest.map(|m| m.history).unwrap_or_default())
    }

    /// Snapshots `entity` (tagged with its current version) and rotates.
    /// Returns false when history is disabled for the plan.
    pub fn save_version(&self, entity: &Entity, author: Option<&str>) -> Result<bool> {
        let policy = self.policy()?;
        if !policy.is_active() {
            return Ok(false);
        }

        let snapshot = VersionSnapshot {
            version: entity.version,
            timestamp: Utc::now(),
            author: author.map(str::to_string),
            data: entity.clone(),
        };
        let path = self
            .layout
            .snapshot_path(&self.plan_id, &entity.id, entity.version);
        write_json_atomic(&path, &snapshot)?;
        debug!(
            plan_id = %self.plan_id,
            entity_id = %entity.id,
            version = entity.version,
            "version snapshot saved"
        );

        self.rotate(&entity.id, policy.max_history_depth as usize)?;
        Ok(true)
    }

    fn rotate(&self, entity_id: &str, depth: usize) -> Result<()> {
        let versions = self.list_versions(entity_id)?;
        let excess = versions.len().saturating_sub(depth);
        for version in versions.into_iter().take(excess) {
            let path = self.layout.snapshot_path(&self.plan_id, entity_id, version);
            match fs::remove_file(&path) {
                Ok(()) => debug!(entity_id, version, "rotated out snapshot"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Retained versions, oldest first.
    pub fn list_versions(&self, entity_id: &str) -> Result<Vec<u64>> {
        let dir = self.layout.history_dir(&self.plan_id, entity_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = BTreeSet::new();
        for entry in entries {
            let name = entry?.file_name();
            let parsed = name
                .to_str()
                .and_then(|n| n.strip_prefix('v'))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(version) = parsed {
                versions.insert(version);
            }
        }
        Ok(versions.into_iter().collect())
    }

    /// One retained snapshot.
    ///
    /// # Errors
    ///
    /// `VersionNotFound` when the version was never saved or was rotated out.
    pub fn get_version(&self, entity_id: &str, version: u64) -> Result<VersionSnapshot> {
        read_json(&self.layout.snapshot_path(&self.plan_id, entity_id, version))?.ok_or_else(|| {
            StoreError::VersionNotFound {
                entity_id: entity_id.to_string(),
                version,
            }
        })
    }

    /// Retained snapshots, newest first. `total` is the retained count.
    pub fn get_history(&self, entity_id: &str, pagination: Pagination) -> Result<Page<VersionSnapshot>> {
        let mut versions = self.list_versions(entity_id)?;
        versions.reverse();
        let page = pagination.apply(versions);

        let mut items = Vec::with_capacity(page.items.len());
        for version in page.items {
            match self.get_version(entity_id, version) {
                Ok(snapshot) => items.push(snapshot),
                // rotated out between listing and reading
                Err(StoreError::VersionNotFound { .. }) => {
                    warn!(entity_id, version, "snapshot disappeared while reading history")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Page {
            items,
            total: page.total,
            offset: page.offset,
            limit: page.limit,
            has_more: page.has_more,
        })
    }

    /// Compares two versions field by field. Either may be the live version.
    ///
    /// # Errors
    ///
    /// `VersionNotFound` when a version is neither retained nor live.
    pub fn diff(&self, entity_id: &str, version1: u64, version2: u64) -> Result<VersionDiff> {
        let mut diff = VersionDiff {
            entity_id: entity_id.to_string(),
            version1,
            version2,
            changes: BTreeMap::new(),
        };
        let hint = self
            .list_versions(entity_id)?
            .last()
            .and_then(|v| self.get_version(entity_id, *v).ok())
            .map(|s| s.data.entity_type);
        let left = self.state_at(entity_id, version1, hint)?;
        if version1 == version2 {
            return Ok(diff);
        }
        let right = self.state_at(entity_id, version2, hint)?;

        let keys: BTreeSet<&String> = left
            .keys()
            .chain(right.keys())
            .filter(|k| !DIFF_IGNORED.contains(&k.as_str()))
            .collect();
        for key in keys {
            let from = left.get(key).cloned().unwrap_or(Value::Null);
            let to = right.get(key).cloned().unwrap_or(Value::Null);
            if from != to {
                diff.changes.insert(key.clone(), FieldChange { from, to });
            }
        }
        Ok(diff)
    }

    fn state_at(&self, entity_id: &str, version: u64, hint: Option<EntityType>) -> Result<Map<String, Value>> {
        match self.get_version(entity_id, version) {
            Ok(snapshot) => return snapshot.data.to_object(),
            Err(StoreError::VersionNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        match self.live_entity(entity_id, hint)? {
            Some(live) if live.version == version => live.to_object(),
            _ => Err(StoreError::VersionNotFound {
                entity_id: entity_id.to_string(),
                version,
            }),
        }
    }

    fn live_entity(&self, entity_id: &str, hint: Option<EntityType>) -> Result<Option<Entity>> {
        let candidates = hint
            .into_iter()
            .chain(EntityType::ALL.into_iter().filter(|t| Some(*t) != hint));
        for entity_type in candidates {
            let path = self.layout.entity_path(&self.plan_id, entity_type, entity_id);
            if let Some(entity) = read_json::<Entity>(&path)? {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }
}

impl SnapshotSink for VersionHistoryService {
    fn record(&self, previous: &Entity, author: Option<&str>) -> Result<()> {
        self.save_version(previous, author).map(|_| ())
    }
}
