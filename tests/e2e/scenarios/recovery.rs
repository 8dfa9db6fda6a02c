use crate::harness::{Assertion, ErrorMatch, Scenario};
use plandoc_core::EntityType::{Decision, Requirement};
use plandoc_core::{BatchOperation, Config, NewEntity, RelationType};
use serde_json::json;

#[test]
fn test_state_survives_restart() {
    Scenario::new("restart")
        .plan("p")
        .create("p", Requirement, "r1", json!({"title": "a"}))
        .create("p", Decision, "d1", json!({"title": "b"}))
        .update("p", Requirement, "r1", json!({"title": "a2"}))
        .link("p", "d1", "r1", RelationType::References)
        .batch(
            "p",
            vec![BatchOperation::create(
                Decision,
                NewEntity::from_value(json!({"title": "c"})).expect("object payload"),
            )],
        )
        .crash()
        .restart()
        .assert_version("p", Requirement, "r1", 2)
        .assert_count("p", Decision, 2)
        .assert_links("p", 1)
        .assert_history("p", "r1", &[1])
        .assert(Assertion::StatsCount {
            plan: "p".into(),
            entity_type: Decision,
            count: 2,
        })
        .create("p", Requirement, "r1", json!({"title": "dup"}))
        .fails_with(ErrorMatch::Conflict)
        .run()
        .expect("scenario should pass");
}

#[test]
fn test_orphaned_lock_files_are_swept_on_open() {
    let mut config = Config::default();
    config.file_locks.stale_threshold_secs = 0;

    Scenario::new("stale_lock_sweep")
        .with_config(config)
        .with_file("locks/0badc0de.lock", b"pid=4242\n")
        .assert(Assertion::FileMissing {
            path: "locks/0badc0de.lock".into(),
        })
        .plan("p")
        .crash()
        .write_raw("locks/feedface.lock", b"pid=4343\n")
        .restart()
        .assert(Assertion::FileMissing {
            path: "locks/feedface.lock".into(),
        })
        .run()
        .unwrap();
}

#[test]
fn test_recent_lock_files_are_kept() {
    Scenario::new("fresh_lock_kept")
        .with_file("locks/0badc0de.lock", b"pid=4242\n")
        .assert(Assertion::FileExists {
            path: "locks/0badc0de.lock".into(),
        })
        .run()
        .unwrap();
}

#[test]
fn test_corrupted_index_is_rebuilt() {
    Scenario::new("index_rebuild")
        .plan("p")
        .create("p", Requirement, "r1", json!({"title": "a"}))
        .create("p", Requirement, "r2", json!({"title": "b"}))
        .create("p", Requirement, "r3", json!({"title": "c"}))
        .crash()
        .write_raw("plans/p/indexes/requirement.json", b"{ not json")
        .restart()
        .create("p", Requirement, "r4", json!({"title": "d"}))
        .fails_with(ErrorMatch::IndexCorrupted)
        .assert(Assertion::FileMissing {
            path: "plans/p/requirements/r4.json".into(),
        })
        .rebuild_index("p", Requirement)
        .assert_count("p", Requirement, 3)
        .create("p", Requirement, "r4", json!({"title": "d"}))
        .assert_count("p", Requirement, 4)
        .run()
        .unwrap();
}

#[test]
fn test_stray_temp_files_are_ignored() {
    Scenario::new("temp_files")
        .plan("p")
        .create("p", Requirement, "r1", json!({"title": "a"}))
        .crash()
        .write_raw("plans/p/requirements/r2.json.0f3a.tmp", b"{\"partial\": ")
        .restart()
        .rebuild_index("p", Requirement)
        .assert_count("p", Requirement, 1)
        .run()
        .unwrap();
}
