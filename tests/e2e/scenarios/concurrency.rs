use crate::harness::{Assertion, Scenario};
use plandoc_core::EntityType::{Decision, Requirement};
use plandoc_core::{EntityUpdate, LockOptions, RelationType};
use serde_json::json;
use std::thread;

#[test]
fn test_racing_link_creates_admit_one() {
    Scenario::new("link_race")
        .plan("p")
        .create("p", Requirement, "r1", json!({"title": "a"}))
        .create("p", Decision, "d1", json!({"title": "b"}))
        .race_link("p", "d1", "r1", RelationType::References, 20)
        .assert(Assertion::ConcurrentOutcome {
            succeeded: 1,
            conflicts: 19,
        })
        .assert_links("p", 1)
        .run()
        .expect("scenario should pass");
}

#[test]
fn test_racing_versioned_updates_admit_one() {
    Scenario::new("update_race")
        .plan("p")
        .create("p", Requirement, "r1", json!({"title": "a"}))
        .assert(Assertion::Custom(Box::new(|store| {
            let repo = store.entities("p", Requirement)?;
            let outcomes: Vec<_> = thread::scope(|scope| {
                let handles: Vec<_> = (0..8)
                    .map(|i| {
                        let repo = &repo;
                        scope.spawn(move || {
                            let patch = json!({ "title": format!("writer {}", i) });
                            let patch = patch.as_object().cloned().unwrap_or_default();
                            repo.update("r1", EntityUpdate::patch(patch).expect_version(1))
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join()).collect()
            });

            let mut ok = 0;
            for outcome in outcomes {
                match outcome.map_err(|_| anyhow::anyhow!("writer panicked"))? {
                    Ok(_) => ok += 1,
                    Err(e) => anyhow::ensure!(e.is_conflict(), "unexpected error: {}", e),
                }
            }
            anyhow::ensure!(ok == 1, "{} writers succeeded", ok);
            Ok(())
        })))
        .assert_version("p", Requirement, "r1", 2)
        .assert_history("p", "r1", &[1])
        .run()
        .unwrap();
}

#[test]
fn test_unversioned_updates_all_commit() {
    Scenario::new("unversioned_updates")
        .plan_with_history("p", 10)
        .create("p", Requirement, "r1", json!({"title": "a"}))
        .assert(Assertion::Custom(Box::new(|store| {
            let repo = store.entities("p", Requirement)?;
            let outcomes: Vec<_> = thread::scope(|scope| {
                let handles: Vec<_> = (0..6)
                    .map(|i| {
                        let repo = &repo;
                        scope.spawn(move || {
                            let mut patch = serde_json::Map::new();
                            patch.insert(format!("field{}", i), json!(i));
                            repo.update("r1", EntityUpdate::patch(patch))
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join()).collect()
            });
            for outcome in outcomes {
                outcome.map_err(|_| anyhow::anyhow!("writer panicked"))??;
            }
            let entity = repo.find_by_id("r1")?;
            for i in 0..6 {
                anyhow::ensure!(entity.field(&format!("field{}", i)).is_some(), "field{} lost", i);
            }
            Ok(())
        })))
        .assert_version("p", Requirement, "r1", 7)
        .assert_history("p", "r1", &[1, 2, 3, 4, 5, 6])
        .run()
        .unwrap();
}

#[test]
fn test_reentrant_holds_count_down() {
    Scenario::new("reentrant_locks")
        .plan("p")
        .assert(Assertion::Custom(Box::new(|store| {
            let locks = store.locks();
            let options = LockOptions::default().holder("agent-1").reentrant();

            let first = locks.acquire("plan-review", &options)?.into_result("plan-review")?;
            let second = locks.acquire("plan-review", &options)?.into_result("plan-review")?;
            let third = locks.acquire("plan-review", &options)?.into_result("plan-review")?;
            anyhow::ensure!(first.lock_id == second.lock_id && second.lock_id == third.lock_id);

            let holder = locks
                .get_lock_holder("plan-review")
                .ok_or_else(|| anyhow::anyhow!("no holder"))?;
            anyhow::ensure!(holder.ref_count == 3, "ref count {}", holder.ref_count);

            let other = LockOptions::try_once().holder("agent-2");
            anyhow::ensure!(!locks.acquire("plan-review", &other)?.is_acquired());

            locks.release(&first.lock_id)?;
            locks.release(&first.lock_id)?;
            anyhow::ensure!(locks.is_locked("plan-review"));
            locks.release(&first.lock_id)?;
            anyhow::ensure!(!locks.is_locked("plan-review"));
            anyhow::ensure!(locks.release(&first.lock_id).is_err());
            Ok(())
        })))
        .run()
        .unwrap();
}
