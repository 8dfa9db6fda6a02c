//! On-disk layout of a plandoc store.
//!
//! ```text
//! <root>/config.toml
//! <root>/locks/<blake3(key)>.lock
//! <root>/plans/<plan>/manifest.json
//! <root>/plans/<plan>/<type>s/<id>.json
//! <root>/plans/<plan>/links/<id>.json
//! <root>/plans/<plan>/indexes/<type>.json
//! <root>/plans/<plan>/indexes/links.json
//! <root>/plans/<plan>/history/<entity>/v<version>.json
//! ```

use crate::types::EntityType;
use std::path::{Path, PathBuf};

/// Name of the link collection (directory and index stem).
pub const LINKS: &str = "links";

/// Resolves paths inside a store root. Always constructed from an explicit root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Layout rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of advisory lock files.
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Directory holding every plan.
    pub fn plans_dir(&self) -> PathBuf {
        self.root.join("plans")
    }

    /// Directory of one plan.
    pub fn plan_dir(&self, plan_id: &str) -> PathBuf {
        self.plans_dir().join(plan_id)
    }

    /// The plan manifest.
    pub fn manifest_path(&self, plan_id: &str) -> PathBuf {
        self.plan_dir(plan_id).join("manifest.json")
    }

    /// Directory of one entity type.
    pub fn entity_dir(&self, plan_id: &str, entity_type: EntityType) -> PathBuf {
        self.plan_dir(plan_id).join(entity_type.dir_name())
    }

    /// File of one entity.
    pub fn entity_path(&self, plan_id: &str, entity_type: EntityType, id: &str) -> PathBuf {
        self.entity_dir(plan_id, entity_type)
            .join(format!("{}.json", id))
    }

    /// Index document of one entity type.
    pub fn entity_index_path(&self, plan_id: &str, entity_type: EntityType) -> PathBuf {
        self.plan_dir(plan_id)
            .join("indexes")
            .join(format!("{}.json", entity_type.as_str()))
    }

    /// Directory of link files.
    pub fn links_dir(&self, plan_id: &str) -> PathBuf {
        self.plan_dir(plan_id).join(LINKS)
    }

    /// Link index document.
    pub fn links_index_path(&self, plan_id: &str) -> PathBuf {
        self.plan_dir(plan_id)
            .join("indexes")
            .join(format!("{}.json", LINKS))
    }

    /// Snapshot directory of one entity.
    pub fn history_dir(&self, plan_id: &str, entity_id: &str) -> PathBuf {
        self.plan_dir(plan_id).join("history").join(entity_id)
    }

    /// One snapshot file.
    pub fn snapshot_path(&self, plan_id: &str, entity_id: &str, version: u64) -> PathBuf {
        self.history_dir(plan_id, entity_id)
            .join(format!("v{}.json", version))
    }
}
