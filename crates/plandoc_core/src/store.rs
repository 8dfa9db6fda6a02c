//! Store handle providing the main plandoc API.

use crate::batch::BatchService;
use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::fsutil::{read_json, write_json_atomic};
use crate::history::VersionHistoryService;
use crate::layout::Layout;
use crate::lock::{FileLockManager, ResourceLockManager};
use crate::repo::{EntityRepository, LinkRepository, RepoContext};
use crate::types::{ensure_id, EntityType, HistoryPolicy, NewPlan, PlanManifest, PlanStats};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// plandoc store handle.
///
/// Owns the lock managers shared by every repository and hands out one
/// repository per `(plan, entity type)`. Safe to share between threads.
pub struct PlanStore {
    /// On-disk layout rooted at the store directory.
    layout: Layout,
    /// Effective configuration.
    config: Config,
    /// In-process locks (entities, links, indexes, manifests).
    locks: Arc<ResourceLockManager>,
    /// Cross-process locks guarding records and index documents.
    file_locks: Arc<FileLockManager>,
    /// Wiring handed to every repository.
    ctx: RepoContext,
    entity_repos: Mutex<HashMap<(String, EntityType), Arc<EntityRepository>>>,
    link_repos: Mutex<HashMap<String, Arc<LinkRepository>>>,
    histories: Mutex<HashMap<String, Arc<VersionHistoryService>>>,
}

impl PlanStore {
    /// Opens (creating if needed) a store at `root`, reading
    /// `<root>/config.toml` when present.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the lock
    /// directory cannot be prepared.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use plandoc_core::PlanStore;
    ///
    /// let store = PlanStore::open("./plans-data").unwrap();
    /// ```
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let config = Config::load(root.as_ref())?;
        Self::open_with_config(root, config)
    }

    /// Opens a store at `root` with an explicit configuration.
    pub fn open_with_config(root: impl AsRef<Path>, config: Config) -> Result<Self> {
        config.validate()?;
        let layout = Layout::new(root);
        fs::create_dir_all(layout.plans_dir())?;

        let locks = Arc::new(ResourceLockManager::new(config.locks.dispose_grace()));
        let file_locks = Arc::new(FileLockManager::new(
            layout.locks_dir(),
            config.file_locks.clone(),
        ));
        let sweep = file_locks.initialize()?;
        info!(
            root = %layout.root().display(),
            scanned = sweep.scanned,
            stale_removed = sweep.removed,
            "plan store opened"
        );

        let ctx = RepoContext::new(layout.clone(), Arc::clone(&locks), config.clone())
            .with_file_locks(Arc::clone(&file_locks));

        Ok(Self {
            layout,
            config,
            locks,
            file_locks,
            ctx,
            entity_repos: Mutex::new(HashMap::new()),
            link_repos: Mutex::new(HashMap::new()),
            histories: Mutex::new(HashMap::new()),
        })
    }

    /// Store root directory.
    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    /// Effective configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// On-disk layout.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The shared in-process lock manager.
    pub fn locks(&self) -> &Arc<ResourceLockManager> {
        &self.locks
    }

    /// The cross-process lock manager.
    pub fn file_locks(&self) -> &Arc<FileLockManager> {
        &self.file_locks
    }

    fn plan_lock_key(plan_id: &str) -> String {
        format!("plan:{}", plan_id)
    }

    /// Read-modify-write of a manifest under its `plan:<id>` lock.
    fn modify_manifest<F>(&self, plan_id: &str, f: F) -> Result<PlanManifest>
    where
        F: FnOnce(&mut PlanManifest),
    {
        let options = self.ctx.lock_options();
        self.locks
            .with_lock(&Self::plan_lock_key(plan_id), &options, |_| {
                let mut manifest = self.get_plan(plan_id)?;
                f(&mut manifest);
                manifest.updated_at = Utc::now();
                write_json_atomic(&self.layout.manifest_path(plan_id), &manifest)?;
                Ok(manifest)
            })
    }

    /// Creates a plan and its manifest.
    ///
    /// # Errors
    ///
    /// - `Validation` for a bad id, an empty name or an out-of-range policy
    /// - `DuplicateKey` if a plan with that id exists
    pub fn create_plan(&self, new: NewPlan) -> Result<PlanManifest> {
        let id = new
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        ensure_id("id", &id)?;
        if new.name.trim().is_empty() {
            return Err(StoreError::invalid("name", "must not be empty"));
        }
        let history = new
            .history
            .unwrap_or_else(|| HistoryPolicy::from(&self.config.history));
        history.validate()?;

        let options = self.ctx.lock_options();
        let manifest = self.locks.with_lock(&Self::plan_lock_key(&id), &options, |_| {
            let path = self.layout.manifest_path(&id);
            if path.exists() {
                return Err(StoreError::DuplicateKey {
                    kind: "plan".to_string(),
                    key: id.clone(),
                });
            }
            let now = Utc::now();
            let manifest = PlanManifest {
                id: id.clone(),
                name: new.name,
                description: new.description,
                history,
                stats: PlanStats {
                    computed_at: Some(now),
                    ..PlanStats::default()
                },
                created_at: now,
                updated_at: now,
            };
            write_json_atomic(&path, &manifest)?;
            Ok(manifest)
        })?;

        info!(plan_id = %manifest.id, "plan created");
        Ok(manifest)
    }

    /// Loads a plan manifest.
    ///
    /// # Errors
    ///
    /// `NotFound` if the plan does not exist.
    pub fn get_plan(&self, plan_id: &str) -> Result<PlanManifest> {
        ensure_id("planId", plan_id)?;
        read_json(&self.layout.manifest_path(plan_id))?
            .ok_or_else(|| StoreError::not_found("plan", plan_id))
    }

    /// Every plan with a readable manifest, oldest first.
    pub fn list_plans(&self) -> Result<Vec<PlanManifest>> {
        let entries = match fs::read_dir(self.layout.plans_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut plans = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path().join("manifest.json");
            if let Some(manifest) = read_json::<PlanManifest>(&path)? {
                plans.push(manifest);
            }
        }
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(plans)
    }

    /// Replaces a plan's snapshot retention policy. Takes effect on the next
    /// update; existing snapshots are rotated then.
    pub fn set_history_policy(&self, plan_id: &str, policy: HistoryPolicy) -> Result<PlanManifest> {
        policy.validate()?;
        let manifest = self.modify_manifest(plan_id, |m| m.history = policy)?;
        info!(
            plan_id,
            enable_history = policy.enable_history,
            max_history_depth = policy.max_history_depth,
            "history policy updated"
        );
        Ok(manifest)
    }

    /// Recounts entities and links and stores the result in the manifest.
    pub fn refresh_stats(&self, plan_id: &str) -> Result<PlanStats> {
        let mut stats = PlanStats::default();
        for entity_type in EntityType::ALL {
            let count = self.entities(plan_id, entity_type)?.count()?;
            stats.set_count(entity_type, count);
        }
        stats.links = self.links(plan_id)?.count()?;
        stats.computed_at = Some(Utc::now());

        let manifest = self.modify_manifest(plan_id, |m| m.stats = stats.clone())?;
        debug!(plan_id, links = stats.links, "plan stats refreshed");
        Ok(manifest.stats)
    }

    /// Repository of `entity_type` entities in `plan_id`. Updates through it
    /// are snapshotted according to the plan's history policy.
    ///
    /// # Errors
    ///
    /// `NotFound` if the plan does not exist.
    pub fn entities(&self, plan_id: &str, entity_type: EntityType) -> Result<Arc<EntityRepository>> {
        let key = (plan_id.to_string(), entity_type);
        if let Some(repo) = self.entity_repos.lock().get(&key) {
            return Ok(Arc::clone(repo));
        }
        self.get_plan(plan_id)?;
        let history = self.history(plan_id)?;

        let mut repos = self.entity_repos.lock();
        let repo = repos.entry(key).or_insert_with(|| {
            Arc::new(EntityRepository::new(&self.ctx, plan_id, entity_type).with_history(history))
        });
        Ok(Arc::clone(repo))
    }

    /// Link repository of `plan_id`.
    pub fn links(&self, plan_id: &str) -> Result<Arc<LinkRepository>> {
        if let Some(repo) = self.link_repos.lock().get(plan_id) {
            return Ok(Arc::clone(repo));
        }
        self.get_plan(plan_id)?;

        let mut repos = self.link_repos.lock();
        let repo = repos
            .entry(plan_id.to_string())
            .or_insert_with(|| Arc::new(LinkRepository::new(&self.ctx, plan_id)));
        Ok(Arc::clone(repo))
    }

    /// Version history of `plan_id`.
    pub fn history(&self, plan_id: &str) -> Result<Arc<VersionHistoryService>> {
        if let Some(service) = self.histories.lock().get(plan_id) {
            return Ok(Arc::clone(service));
        }
        self.get_plan(plan_id)?;

        let mut histories = self.histories.lock();
        let service = histories.entry(plan_id.to_string()).or_insert_with(|| {
            Arc::new(VersionHistoryService::new(self.layout.clone(), plan_id))
        });
        Ok(Arc::clone(service))
    }

    /// Batch and direct operation execution.
    pub fn batch(&self) -> BatchService<'_> {
        BatchService::new(self)
    }

    /// Releases every lock held by this store. Later lock acquisitions fail
    /// with `LockUnavailable`.
    pub fn dispose(&self) {
        self.locks.dispose();
        self.file_locks.dispose();
        info!(root = %self.layout.root().display(), "plan store disposed");
    }
}
