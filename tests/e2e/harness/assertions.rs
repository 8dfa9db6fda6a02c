use anyhow::Result;
use plandoc_core::{EntityType, PlanStore, RelationType, StoreError};
use serde_json::Value;

/// Declarative assertions on store state
pub enum Assertion {
    // Entities
    EntityExists {
        plan: String,
        entity_type: EntityType,
        id: String,
    },
    EntityMissing {
        plan: String,
        entity_type: EntityType,
        id: String,
    },
    EntityVersion {
        plan: String,
        entity_type: EntityType,
        id: String,
        version: u64,
    },
    FieldEquals {
        plan: String,
        entity_type: EntityType,
        id: String,
        field: String,
        value: Value,
    },
    EntityCount {
        plan: String,
        entity_type: EntityType,
        count: usize,
    },

    // Links
    LinkExists {
        plan: String,
        source: String,
        target: String,
        relation: RelationType,
    },
    LinkCount {
        plan: String,
        count: usize,
    },
    ConcurrentOutcome {
        succeeded: usize,
        conflicts: usize,
    },

    // History
    HistoryVersions {
        plan: String,
        id: String,
        versions: Vec<u64>,
    },
    DiffFields {
        plan: String,
        id: String,
        version1: u64,
        version2: u64,
        fields: Vec<String>,
    },

    // Manifest
    StatsCount {
        plan: String,
        entity_type: EntityType,
        count: usize,
    },
    StatsLinks {
        plan: String,
        count: usize,
    },

    // Files
    FileExists {
        path: String,
    },
    FileMissing {
        path: String,
    },

    // Custom
    Custom(Box<dyn Fn(&PlanStore) -> Result<()> + Send + Sync>),
}

impl std::fmt::Debug for Assertion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntityExists { entity_type, id, .. } => {
                write!(f, "EntityExists({} {:?})", entity_type, id)
            }
            Self::EntityMissing { entity_type, id, .. } => {
                write!(f, "EntityMissing({} {:?})", entity_type, id)
            }
            Self::EntityVersion { id, version, .. } => {
                write!(f, "EntityVersion({:?} = {})", id, version)
            }
            Self::FieldEquals { id, field, value, .. } => {
                write!(f, "FieldEquals({:?}.{} = {})", id, field, value)
            }
            Self::EntityCount { entity_type, count, .. } => {
                write!(f, "EntityCount({} = {})", entity_type, count)
            }
            Self::LinkExists {
                source,
                target,
                relation,
                ..
            } => write!(f, "LinkExists({:?} -{}-> {:?})", source, relation, target),
            Self::LinkCount { count, .. } => write!(f, "LinkCount({})", count),
            Self::ConcurrentOutcome {
                succeeded,
                conflicts,
            } => write!(f, "ConcurrentOutcome(ok={}, conflicts={})", succeeded, conflicts),
            Self::HistoryVersions { id, versions, .. } => {
                write!(f, "HistoryVersions({:?} = {:?})", id, versions)
            }
            Self::DiffFields {
                id,
                version1,
                version2,
                fields,
                ..
            } => write!(f, "DiffFields({:?} v{}..v{} = {:?})", id, version1, version2, fields),
            Self::StatsCount { entity_type, count, .. } => {
                write!(f, "StatsCount({} = {})", entity_type, count)
            }
            Self::StatsLinks { count, .. } => write!(f, "StatsLinks({})", count),
            Self::FileExists { path } => write!(f, "FileExists({:?})", path),
            Self::FileMissing { path } => write!(f, "FileMissing({:?})", path),
            Self::Custom(_) => write!(f, "Custom(<fn>)"),
        }
    }
}

/// Match against error categories
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorMatch {
    NotFound,
    Conflict,
    Validation,
    IndexCorrupted,
    Any,
}

impl ErrorMatch {
    /// True if `err` falls in this category
    pub fn matches(self, err: &StoreError) -> bool {
        match self {
            Self::NotFound => err.is_not_found(),
            Self::Conflict => err.is_conflict(),
            Self::Validation => err.is_validation(),
            Self::IndexCorrupted => matches!(err, StoreError::IndexCorrupted { .. }),
            Self::Any => true,
        }
    }
}
