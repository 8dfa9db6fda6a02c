use plandoc_core::{BatchOperation, EntityType, RelationType};
use serde_json::Value;

use super::assertions::{Assertion, ErrorMatch};

/// All possible actions in a test scenario
#[derive(Debug)]
pub enum ScenarioStep {
    // Plans
    CreatePlan {
        id: String,
        history: Option<(bool, u32)>,
    },
    SetHistoryDepth {
        plan: String,
        depth: u32,
    },

    // Entities
    CreateEntity {
        plan: String,
        entity_type: EntityType,
        id: String,
        fields: Value,
    },
    UpdateEntity {
        plan: String,
        entity_type: EntityType,
        id: String,
        fields: Value,
        expected_version: Option<u64>,
        author: Option<String>,
    },
    DeleteEntity {
        plan: String,
        entity_type: EntityType,
        id: String,
    },

    // Links
    CreateLink {
        plan: String,
        source: String,
        target: String,
        relation: RelationType,
    },
    DeleteLinksFor {
        plan: String,
        entity: String,
    },
    ConcurrentLinkCreates {
        plan: String,
        source: String,
        target: String,
        relation: RelationType,
        threads: usize,
    },

    // Batches
    Batch {
        plan: String,
        operations: Vec<BatchOperation>,
    },

    // Maintenance
    RebuildIndex {
        plan: String,
        entity_type: EntityType,
    },
    WriteRaw {
        path: String,
        content: Vec<u8>,
    },

    // Failure simulation
    Crash,
    Restart,

    // Wraps a step that must fail
    ExpectFailure {
        step: Box<ScenarioStep>,
        error: ErrorMatch,
    },

    // Assertions (can be interspersed)
    Assert {
        assertion: Assertion,
    },
}
