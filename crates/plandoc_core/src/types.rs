//! Core data types for plandoc.

use crate::error::{FieldError, Result, StoreError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Upper bound for `HistoryPolicy::max_history_depth`.
pub const MAX_HISTORY_DEPTH: u32 = 10;

/// Placeholder ids used inside a batch start with this marker.
pub const TEMP_ID_PREFIX: char = '$';

/// Longest id accepted for entities, links and plans.
const MAX_ID_LEN: usize = 128;

/// Fields maintained by the store; callers cannot patch them.
pub const RESERVED_FIELDS: [&str; 5] = ["id", "type", "version", "createdAt", "updatedAt"];

/// A record persisted as one JSON file.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable unique id (also the file stem).
    fn id(&self) -> &str;
}

/// Discriminator for planning entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// A requirement the plan must satisfy.
    Requirement,
    /// A proposed solution addressing requirements.
    Solution,
    /// A phase of work.
    Phase,
    /// A recorded decision.
    Decision,
    /// A produced artifact (file, document, ...).
    Artifact,
}

impl EntityType {
    /// Every entity type, in a fixed order.
    pub const ALL: [EntityType; 5] = [
        EntityType::Requirement,
        EntityType::Solution,
        EntityType::Phase,
        EntityType::Decision,
        EntityType::Artifact,
    ];

    /// Lowercase name, as stored in the `type` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requirement => "requirement",
            Self::Solution => "solution",
            Self::Phase => "phase",
            Self::Decision => "decision",
            Self::Artifact => "artifact",
        }
    }

    /// Directory holding this type's entity files inside a plan.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Requirement => "requirements",
            Self::Solution => "solutions",
            Self::Phase => "phases",
            Self::Decision => "decisions",
            Self::Artifact => "artifacts",
        }
    }

    /// Payload fields that hold ids of other entities (single id or id list).
    pub fn id_fields(self) -> &'static [&'static str] {
        match self {
            Self::Requirement => &["parentId"],
            Self::Solution => &["addressing", "supersedes", "supersededBy"],
            Self::Phase => &["parentId"],
            Self::Decision => &["supersedes", "supersededBy", "relatedRequirementIds"],
            Self::Artifact => &["relatedPhaseId", "relatedSolutionId", "relatedRequirementIds"],
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StoreError::invalid("type", format!("unknown entity type '{}'", s)))
    }
}

/// A planning entity with free-form payload fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Stable unique id.
    pub id: String,
    /// Entity discriminator.
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    /// Starts at 1, incremented by exactly one per committed update.
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last committed update.
    pub updated_at: DateTime<Utc>,
    /// Payload.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    /// Builds version 1 of a new entity. The id must already be assigned.
    pub fn new(entity_type: EntityType, id: String, fields: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id,
            entity_type,
            version: 1,
            created_at: now,
            updated_at: now,
            fields,
        }
    }

    /// Returns a payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns a payload field as a string slice.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Full JSON object, bookkeeping fields included.
    pub fn to_object(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::invalid(
                "entity",
                format!("serialized to {} instead of an object", json_kind(&other)),
            )),
        }
    }

    /// Merges `patch` into the payload and bumps version and `updated_at`.
    pub(crate) fn apply_patch(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            if value.is_null() {
                self.fields.remove(key);
            } else {
                self.fields.insert(key.clone(), value.clone());
            }
        }
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

impl Record for Entity {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Input for creating an entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewEntity {
    /// Caller-chosen id; a UUID is generated when absent.
    pub id: Option<String>,
    /// Payload fields (must not contain reserved fields).
    pub fields: Map<String, Value>,
}

impl NewEntity {
    /// New entity with generated id.
    pub fn with_fields(fields: Map<String, Value>) -> Self {
        Self { id: None, fields }
    }

    /// Builds from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self::with_fields(fields)),
            other => Err(StoreError::invalid(
                "payload",
                format!("expected a JSON object, got {}", json_kind(&other)),
            )),
        }
    }

    /// Sets an explicit id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Validates the id and payload, returning the id to use.
    pub(crate) fn validate(&self) -> Result<String> {
        let mut errors = Vec::new();
        if let Some(id) = &self.id {
            if let Some(e) = check_id("id", id) {
                errors.push(e);
            }
        }
        errors.extend(reserved_field_errors(&self.fields));
        if !errors.is_empty() {
            return Err(StoreError::Validation { errors });
        }
        Ok(self
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()))
    }
}

/// Field errors for every reserved key present in `fields`.
pub(crate) fn reserved_field_errors(fields: &Map<String, Value>) -> Vec<FieldError> {
    RESERVED_FIELDS
        .iter()
        .filter(|name| fields.contains_key(**name))
        .map(|name| FieldError::new(*name, "is maintained by the store and cannot be set"))
        .collect()
}

/// Checks that `id` is usable as a file name, returning the problem if not.
pub fn check_id(field: &str, id: &str) -> Option<FieldError> {
    let problem = if id.is_empty() {
        "must not be empty"
    } else if id.len() > MAX_ID_LEN {
        "is too long"
    } else if id.starts_with(TEMP_ID_PREFIX) {
        "is an unresolved placeholder"
    } else if id.starts_with('.') {
        "must not start with '.'"
    } else if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        "may only contain ASCII letters, digits, '-', '_' and '.'"
    } else {
        return None;
    };
    Some(FieldError::new(field, problem))
}

/// Returns a validation error when `id` is not a safe id.
pub(crate) fn ensure_id(field: &str, id: &str) -> Result<()> {
    match check_id(field, id) {
        Some(e) => Err(StoreError::Validation { errors: vec![e] }),
        None => Ok(()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Closed set of link relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    /// Source implements target.
    Implements,
    /// Source addresses target.
    Addresses,
    /// Source depends on target.
    DependsOn,
    /// Source blocks target.
    Blocks,
    /// Source validates target.
    Validates,
    /// Source references target.
    References,
    /// Source was derived from target.
    DerivedFrom,
    /// Source owns target artifact.
    HasArtifact,
}

impl RelationType {
    /// Every relation type.
    pub const ALL: [RelationType; 8] = [
        RelationType::Implements,
        RelationType::Addresses,
        RelationType::DependsOn,
        RelationType::Blocks,
        RelationType::Validates,
        RelationType::References,
        RelationType::DerivedFrom,
        RelationType::HasArtifact,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Implements => "implements",
            Self::Addresses => "addresses",
            Self::DependsOn => "depends_on",
            Self::Blocks => "blocks",
            Self::Validates => "validates",
            Self::References => "references",
            Self::DerivedFrom => "derived_from",
            Self::HasArtifact => "has_artifact",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        RelationType::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| {
                StoreError::invalid("relationType", format!("unknown relation type '{}'", s))
            })
    }
}

/// A directed edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    /// Link id.
    pub id: String,
    /// Entity the edge starts at.
    pub source_id: String,
    /// Entity the edge points to.
    pub target_id: String,
    /// Relation kind.
    pub relation_type: RelationType,
    /// Optional free-form annotations.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Version, 1 on creation.
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Link {
    /// The uniqueness key `(source, target, relation)`.
    pub fn composite_key(&self) -> String {
        composite_key(&self.source_id, &self.target_id, self.relation_type)
    }
}

/// Formats the uniqueness key of a link.
pub fn composite_key(source_id: &str, target_id: &str, relation: RelationType) -> String {
    format!("{}|{}|{}", source_id, target_id, relation)
}

impl Record for Link {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Input for creating a link. The relation is a raw string so untrusted input
/// can be validated in one place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewLink {
    /// Caller-chosen id; a UUID is generated when absent.
    pub id: Option<String>,
    /// Source entity id.
    pub source_id: String,
    /// Target entity id.
    pub target_id: String,
    /// Relation name, see [`RelationType`].
    pub relation_type: String,
    /// Optional annotations.
    pub metadata: Map<String, Value>,
}

impl NewLink {
    /// Convenience constructor.
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relation: RelationType,
    ) -> Self {
        Self {
            id: None,
            source_id: source_id.into(),
            target_id: target_id.into(),
            relation_type: relation.as_str().to_string(),
            metadata: Map::new(),
        }
    }

    /// Validates every field, collecting all problems, and returns the parsed relation.
    pub fn validate(&self) -> Result<RelationType> {
        let mut errors = Vec::new();
        if let Some(id) = &self.id {
            errors.extend(check_id("id", id));
        }
        errors.extend(check_id("sourceId", &self.source_id));
        errors.extend(check_id("targetId", &self.target_id));
        if !self.source_id.is_empty() && self.source_id == self.target_id {
            errors.push(FieldError::new("targetId", "must differ from sourceId"));
        }
        let relation = match self.relation_type.parse::<RelationType>() {
            Ok(r) => Some(r),
            Err(StoreError::Validation { errors: e }) => {
                errors.extend(e);
                None
            }
            Err(other) => return Err(other),
        };
        match relation {
            Some(r) if errors.is_empty() => Ok(r),
            _ => Err(StoreError::Validation { errors }),
        }
    }

    /// Builds the link after validation.
    pub(crate) fn into_link(self, relation: RelationType) -> Link {
        let now = Utc::now();
        Link {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            source_id: self.source_id,
            target_id: self.target_id,
            relation_type: relation,
            metadata: self.metadata,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Which side of a link an entity is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// Links pointing at the entity.
    Incoming,
    /// Links starting at the entity.
    Outgoing,
    /// Either.
    Both,
}

/// Per-plan snapshot retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPolicy {
    /// Whether snapshots are taken at all.
    pub enable_history: bool,
    /// Snapshots retained per entity (0..=10); 0 disables history.
    pub max_history_depth: u32,
}

impl HistoryPolicy {
    /// True when updates should be snapshotted.
    pub fn is_active(&self) -> bool {
        self.enable_history && self.max_history_depth > 0
    }

    /// Rejects depths outside 0..=10.
    pub fn validate(&self) -> Result<()> {
        if self.max_history_depth > MAX_HISTORY_DEPTH {
            return Err(StoreError::invalid(
                "maxHistoryDepth",
                format!(
                    "must be between 0 and {}, got {}",
                    MAX_HISTORY_DEPTH, self.max_history_depth
                ),
            ));
        }
        Ok(())
    }
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self {
            enable_history: true,
            max_history_depth: 5,
        }
    }
}

/// Aggregate counts kept in the plan manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStats {
    /// Number of requirements.
    pub requirements: usize,
    /// Number of solutions.
    pub solutions: usize,
    /// Number of phases.
    pub phases: usize,
    /// Number of decisions.
    pub decisions: usize,
    /// Number of artifacts.
    pub artifacts: usize,
    /// Number of links.
    pub links: usize,
    /// When the counts were computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed_at: Option<DateTime<Utc>>,
}

impl PlanStats {
    /// Count for one entity type.
    pub fn count(&self, entity_type: EntityType) -> usize {
        match entity_type {
            EntityType::Requirement => self.requirements,
            EntityType::Solution => self.solutions,
            EntityType::Phase => self.phases,
            EntityType::Decision => self.decisions,
            EntityType::Artifact => self.artifacts,
        }
    }

    pub(crate) fn set_count(&mut self, entity_type: EntityType, n: usize) {
        let slot = match entity_type {
            EntityType::Requirement => &mut self.requirements,
            EntityType::Solution => &mut self.solutions,
            EntityType::Phase => &mut self.phases,
            EntityType::Decision => &mut self.decisions,
            EntityType::Artifact => &mut self.artifacts,
        };
        *slot = n;
    }
}

/// The per-plan manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanManifest {
    /// Plan id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Snapshot retention.
    pub history: HistoryPolicy,
    /// Aggregate counts.
    #[serde(default)]
    pub stats: PlanStats,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last manifest write.
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewPlan {
    /// Caller-chosen id; a UUID is generated when absent.
    pub id: Option<String>,
    /// Plan name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Retention policy; the store's configured default when absent.
    pub history: Option<HistoryPolicy>,
}

impl NewPlan {
    /// Plan with a name and defaults elsewhere.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets an explicit plan id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the description.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Overrides the history policy.
    pub fn with_history(mut self, enable_history: bool, max_history_depth: u32) -> Self {
        self.history = Some(HistoryPolicy {
            enable_history,
            max_history_depth,
        });
        self
    }
}

/// Offset/limit window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pagination {
    /// Items to skip.
    pub offset: usize,
    /// Maximum items to return; everything when `None`.
    pub limit: Option<usize>,
}

impl Pagination {
    /// Window starting at `offset` with at most `limit` items.
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }

    /// Cuts `items` (already filtered and sorted) into a page.
    pub fn apply<T>(&self, items: Vec<T>) -> Page<T> {
        let total = items.len();
        let page: Vec<T> = items
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect();
        let has_more = self.offset.saturating_add(page.len()) < total;
        Page {
            items: page,
            total,
            offset: self.offset,
            limit: self.limit,
            has_more,
        }
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Items in this page.
    pub items: Vec<T>,
    /// Items matching before pagination.
    pub total: usize,
    /// Offset used.
    pub offset: usize,
    /// Limit used.
    pub limit: Option<usize>,
    /// True when items remain after this page.
    pub has_more: bool,
}
