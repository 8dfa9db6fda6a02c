use super::assertions::{Assertion, ErrorMatch};
use super::steps::ScenarioStep;
use super::workspace::TestWorkspace;
use anyhow::{anyhow, bail, ensure, Context, Result};
use plandoc_core::{
    BatchOperation, Config, EntityType, EntityUpdate, HistoryPolicy, NewEntity, NewLink, NewPlan,
    PlanStore, RelationType, StoreError,
};
use serde_json::Value;
use std::collections::HashMap;
use std::thread;

/// Executes scenarios against a real store on disk
pub struct ScenarioRunner {
    workspace: TestWorkspace,
    store: Option<PlanStore>,
    crashed: bool,
    current_step: usize,
    last_race: Option<(usize, usize)>,
}

impl ScenarioRunner {
    /// Create a new runner with initial files
    pub fn new(initial_files: HashMap<String, Vec<u8>>, config: Option<&Config>) -> Result<Self> {
        super::init_tracing();
        let workspace = TestWorkspace::with_files(initial_files, config)?;
        let store = workspace.open_store()?;

        Ok(Self {
            workspace,
            store: Some(store),
            crashed: false,
            current_step: 0,
            last_race: None,
        })
    }

    /// Get current step number
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Execute all steps in sequence
    pub fn execute(&mut self, steps: &[ScenarioStep]) -> Result<()> {
        for (i, step) in steps.iter().enumerate() {
            self.current_step = i;
            self.execute_step(step)
                .with_context(|| format!("Step {}: {:?}", i, step))?;
        }
        Ok(())
    }

    fn store(&self) -> Result<&PlanStore> {
        self.store
            .as_ref()
            .ok_or_else(|| anyhow!("store not available (crashed?)"))
    }

    /// Execute a single step
    fn execute_step(&mut self, step: &ScenarioStep) -> Result<()> {
        match step {
            ScenarioStep::CreatePlan { id, history } => {
                let mut new = NewPlan::named(id.as_str()).id(id.as_str());
                if let Some((enabled, depth)) = history {
                    new = new.with_history(*enabled, *depth);
                }
                self.store()?.create_plan(new)?;
                Ok(())
            }
            ScenarioStep::SetHistoryDepth { plan, depth } => {
                let policy = HistoryPolicy {
                    enable_history: *depth > 0,
                    max_history_depth: *depth,
                };
                self.store()?.set_history_policy(plan, policy)?;
                Ok(())
            }

            ScenarioStep::CreateEntity {
                plan,
                entity_type,
                id,
                fields,
            } => {
                let new = NewEntity::from_value(fields.clone())?.id(id.as_str());
                self.store()?.entities(plan, *entity_type)?.create(new)?;
                Ok(())
            }
            ScenarioStep::UpdateEntity {
                plan,
                entity_type,
                id,
                fields,
                expected_version,
                author,
            } => self.handle_update(plan, *entity_type, id, fields, *expected_version, author.as_deref()),
            ScenarioStep::DeleteEntity {
                plan,
                entity_type,
                id,
            } => {
                self.store()?.entities(plan, *entity_type)?.delete(id)?;
                Ok(())
            }

            ScenarioStep::CreateLink {
                plan,
                source,
                target,
                relation,
            } => {
                self.store()?
                    .links(plan)?
                    .create_link(NewLink::new(source.as_str(), target.as_str(), *relation))?;
                Ok(())
            }
            ScenarioStep::DeleteLinksFor { plan, entity } => {
                self.store()?.links(plan)?.delete_links_for_entity(entity)?;
                Ok(())
            }
            ScenarioStep::ConcurrentLinkCreates {
                plan,
                source,
                target,
                relation,
                threads,
            } => self.handle_race(plan, source, target, *relation, *threads),

            ScenarioStep::Batch { plan, operations } => self.handle_batch(plan, operations),

            ScenarioStep::RebuildIndex { plan, entity_type } => {
                self.store()?.entities(plan, *entity_type)?.rebuild_index()?;
                Ok(())
            }
            ScenarioStep::WriteRaw { path, content } => self.workspace.write_file(path, content),

            ScenarioStep::Crash => self.handle_crash(),
            ScenarioStep::Restart => self.handle_restart(),

            ScenarioStep::ExpectFailure { step, error } => self.handle_expect_failure(step, *error),

            ScenarioStep::Assert { assertion } => self.handle_assertion(assertion),
        }
    }

    // ===== Step handlers =====

    fn handle_update(
        &self,
        plan: &str,
        entity_type: EntityType,
        id: &str,
        fields: &Value,
        expected_version: Option<u64>,
        author: Option<&str>,
    ) -> Result<()> {
        let patch = fields
            .as_object()
            .cloned()
            .ok_or_else(|| anyhow!("update fields must be a JSON object"))?;
        let mut update = EntityUpdate::patch(patch);
        if let Some(version) = expected_version {
            update = update.expect_version(version);
        }
        if let Some(author) = author {
            update = update.by(author);
        }
        self.store()?.entities(plan, entity_type)?.update(id, update)?;
        Ok(())
    }

    fn handle_race(
        &mut self,
        plan: &str,
        source: &str,
        target: &str,
        relation: RelationType,
        threads: usize,
    ) -> Result<()> {
        let links = self.store()?.links(plan)?;
        let outcomes = thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let links = &links;
                    scope.spawn(move || links.create_link(NewLink::new(source, target, relation)))
                })
                .collect();
            handles.into_iter().map(|h| h.join()).collect::<Vec<_>>()
        });

        let mut succeeded = 0;
        let mut conflicts = 0;
        for outcome in outcomes {
            match outcome.map_err(|_| anyhow!("link creation thread panicked"))? {
                Ok(_) => succeeded += 1,
                Err(e) if e.is_conflict() => conflicts += 1,
                Err(e) => bail!("unexpected race outcome: {}", e),
            }
        }
        self.last_race = Some((succeeded, conflicts));
        Ok(())
    }

    fn handle_batch(&self, plan: &str, operations: &[BatchOperation]) -> Result<()> {
        self.store()?
            .batch()
            .execute_batch(plan, operations.to_vec())?;
        Ok(())
    }

    fn handle_crash(&mut self) -> Result<()> {
        // Leak the store so nothing is released or cleaned up
        if let Some(store) = self.store.take() {
            std::mem::forget(store);
        }
        self.crashed = true;
        Ok(())
    }

    fn handle_restart(&mut self) -> Result<()> {
        if !self.crashed {
            return Err(anyhow!("Cannot restart - not crashed"));
        }
        self.store = Some(self.workspace.open_store()?);
        self.crashed = false;
        Ok(())
    }

    fn handle_expect_failure(&mut self, step: &ScenarioStep, expected: ErrorMatch) -> Result<()> {
        match self.execute_step(step) {
            Ok(()) => bail!("expected {:?} failure, step succeeded", expected),
            Err(e) => {
                let store_err = e
                    .downcast_ref::<StoreError>()
                    .ok_or_else(|| anyhow!("expected a store error, got: {:?}", e))?;
                ensure!(
                    expected.matches(store_err),
                    "expected {:?} failure, got: {}",
                    expected,
                    store_err
                );
                Ok(())
            }
        }
    }

    // ===== Assertions =====

    fn handle_assertion(&self, assertion: &Assertion) -> Result<()> {
        let store = self.store()?;
        match assertion {
            Assertion::EntityExists {
                plan,
                entity_type,
                id,
            } => {
                ensure!(
                    store.entities(plan, *entity_type)?.exists(id)?,
                    "{} {} does not exist",
                    entity_type,
                    id
                );
                Ok(())
            }
            Assertion::EntityMissing {
                plan,
                entity_type,
                id,
            } => {
                ensure!(
                    !store.entities(plan, *entity_type)?.exists(id)?,
                    "{} {} still exists",
                    entity_type,
                    id
                );
                Ok(())
            }
            Assertion::EntityVersion {
                plan,
                entity_type,
                id,
                version,
            } => {
                let entity = store.entities(plan, *entity_type)?.find_by_id(id)?;
                ensure!(
                    entity.version == *version,
                    "{} is at version {}, expected {}",
                    id,
                    entity.version,
                    version
                );
                Ok(())
            }
            Assertion::FieldEquals {
                plan,
                entity_type,
                id,
                field,
                value,
            } => {
                let entity = store.entities(plan, *entity_type)?.find_by_id(id)?;
                let actual = entity.field(field).cloned().unwrap_or(Value::Null);
                ensure!(
                    &actual == value,
                    "{}.{} is {}, expected {}",
                    id,
                    field,
                    actual,
                    value
                );
                Ok(())
            }
            Assertion::EntityCount {
                plan,
                entity_type,
                count,
            } => {
                let actual = store.entities(plan, *entity_type)?.count()?;
                ensure!(actual == *count, "{} {}s, expected {}", actual, entity_type, count);
                Ok(())
            }
            Assertion::LinkExists {
                plan,
                source,
                target,
                relation,
            } => {
                ensure!(
                    store.links(plan)?.link_exists(source, target, *relation)?,
                    "no {} link from {} to {}",
                    relation,
                    source,
                    target
                );
                Ok(())
            }
            Assertion::LinkCount { plan, count } => {
                let actual = store.links(plan)?.count()?;
                ensure!(actual == *count, "{} links, expected {}", actual, count);
                Ok(())
            }
            Assertion::ConcurrentOutcome {
                succeeded,
                conflicts,
            } => {
                let (ok, conflicted) = self
                    .last_race
                    .ok_or_else(|| anyhow!("no concurrent step has run"))?;
                ensure!(
                    ok == *succeeded && conflicted == *conflicts,
                    "race ended ok={} conflicts={}, expected ok={} conflicts={}",
                    ok,
                    conflicted,
                    succeeded,
                    conflicts
                );
                Ok(())
            }
            Assertion::HistoryVersions { plan, id, versions } => {
                let actual = store.history(plan)?.list_versions(id)?;
                ensure!(
                    &actual == versions,
                    "history of {} is {:?}, expected {:?}",
                    id,
                    actual,
                    versions
                );
                Ok(())
            }
            Assertion::DiffFields {
                plan,
                id,
                version1,
                version2,
                fields,
            } => {
                let diff = store.history(plan)?.diff(id, *version1, *version2)?;
                let changed: Vec<&String> = diff.changes.keys().collect();
                let expected: Vec<&String> = fields.iter().collect();
                ensure!(
                    changed == expected,
                    "diff of {} changed {:?}, expected {:?}",
                    id,
                    changed,
                    expected
                );
                Ok(())
            }
            Assertion::StatsCount {
                plan,
                entity_type,
                count,
            } => {
                let stats = store.get_plan(plan)?.stats;
                ensure!(
                    stats.count(*entity_type) == *count,
                    "manifest counts {} {}s, expected {}",
                    stats.count(*entity_type),
                    entity_type,
                    count
                );
                Ok(())
            }
            Assertion::StatsLinks { plan, count } => {
                let stats = store.get_plan(plan)?.stats;
                ensure!(
                    stats.links == *count,
                    "manifest counts {} links, expected {}",
                    stats.links,
                    count
                );
                Ok(())
            }
            Assertion::FileExists { path } => {
                ensure!(self.workspace.file_exists(path), "{} does not exist", path);
                Ok(())
            }
            Assertion::FileMissing { path } => {
                ensure!(!self.workspace.file_exists(path), "{} still exists", path);
                Ok(())
            }
            Assertion::Custom(check) => check(store),
        }
    }
}
