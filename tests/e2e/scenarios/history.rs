use crate::harness::{Assertion, ErrorMatch, Scenario};
use plandoc_core::EntityType::Requirement;
use plandoc_core::Pagination;
use serde_json::json;

#[test]
fn test_depth_one_keeps_latest_snapshot() {
    Scenario::new("depth_one")
        .plan_with_history("p", 1)
        .create("p", Requirement, "r1", json!({"title": "a"}))
        .update_times("p", Requirement, "r1", 3)
        .assert_version("p", Requirement, "r1", 4)
        .assert_history("p", "r1", &[3])
        .run()
        .expect("scenario should pass");
}

#[test]
fn test_depth_one_keeps_previous_title() {
    Scenario::new("depth_one_titles")
        .plan_with_history("p", 1)
        .create("p", Requirement, "r1", json!({"title": "V1"}))
        .update_at("p", Requirement, "r1", 1, json!({"title": "V2"}))
        .update_at("p", Requirement, "r1", 2, json!({"title": "V3"}))
        .assert(Assertion::FieldEquals {
            plan: "p".into(),
            entity_type: Requirement,
            id: "r1".into(),
            field: "title".into(),
            value: json!("V3"),
        })
        .assert(Assertion::Custom(Box::new(|store| {
            let page = store.history("p")?.get_history("r1", Pagination::default())?;
            anyhow::ensure!(page.total == 1, "{} snapshots retained", page.total);
            let title = page.items.first().and_then(|s| s.data.str_field("title"));
            anyhow::ensure!(title == Some("V2"), "kept title {:?}", title);
            Ok(())
        })))
        .run()
        .unwrap();
}

#[test]
fn test_depth_three_after_five_updates() {
    Scenario::new("depth_three")
        .plan_with_history("p", 3)
        .create("p", Requirement, "r1", json!({"title": "a"}))
        .update_times("p", Requirement, "r1", 5)
        .assert_version("p", Requirement, "r1", 6)
        .assert_history("p", "r1", &[3, 4, 5])
        .run()
        .unwrap();
}

#[test]
fn test_depth_zero_disables_history() {
    Scenario::new("depth_zero")
        .plan_with_history("p", 0)
        .create("p", Requirement, "r1", json!({"title": "a"}))
        .update_times("p", Requirement, "r1", 2)
        .assert_history("p", "r1", &[])
        .assert(Assertion::FileMissing {
            path: "plans/p/history/r1".into(),
        })
        .run()
        .unwrap();
}

#[test]
fn test_history_survives_deletion() {
    Scenario::new("history_survives_deletion")
        .plan("p")
        .create("p", Requirement, "r1", json!({"title": "a"}))
        .update_times("p", Requirement, "r1", 2)
        .delete("p", Requirement, "r1")
        .assert(Assertion::EntityMissing {
            plan: "p".into(),
            entity_type: Requirement,
            id: "r1".into(),
        })
        .assert_history("p", "r1", &[1, 2])
        .run()
        .unwrap();
}

#[test]
fn test_lowering_depth_rotates_on_next_update() {
    Scenario::new("lower_depth")
        .plan_with_history("p", 5)
        .create("p", Requirement, "r1", json!({"title": "a"}))
        .update_times("p", Requirement, "r1", 4)
        .assert_history("p", "r1", &[1, 2, 3, 4])
        .set_history_depth("p", 2)
        .assert_history("p", "r1", &[1, 2, 3, 4])
        .update("p", Requirement, "r1", json!({"title": "b"}))
        .assert_history("p", "r1", &[4, 5])
        .run()
        .unwrap();
}

#[test]
fn test_diff_between_snapshot_and_live() {
    Scenario::new("diff")
        .plan("p")
        .create("p", Requirement, "r1", json!({"title": "a", "priority": "low"}))
        .update("p", Requirement, "r1", json!({"title": "b"}))
        .update("p", Requirement, "r1", json!({"priority": "high", "owner": "sam"}))
        .assert(Assertion::DiffFields {
            plan: "p".into(),
            id: "r1".into(),
            version1: 1,
            version2: 3,
            fields: vec!["owner".into(), "priority".into(), "title".into()],
        })
        .assert(Assertion::DiffFields {
            plan: "p".into(),
            id: "r1".into(),
            version1: 2,
            version2: 2,
            fields: vec![],
        })
        .assert(Assertion::Custom(Box::new(|store| {
            let diff = store.history("p")?.diff("r1", 3, 1)?;
            anyhow::ensure!(diff.changes["title"].from == json!("b"));
            anyhow::ensure!(diff.changes["title"].to == json!("a"));
            anyhow::ensure!(diff.changes["owner"].to.is_null());
            Ok(())
        })))
        .run()
        .unwrap();
}

#[test]
fn test_stale_version_is_rejected() {
    Scenario::new("stale_version")
        .plan("p")
        .create("p", Requirement, "r1", json!({"title": "a"}))
        .update_at("p", Requirement, "r1", 1, json!({"title": "b"}))
        .update_at("p", Requirement, "r1", 1, json!({"title": "c"}))
        .fails_with(ErrorMatch::Conflict)
        .assert_version("p", Requirement, "r1", 2)
        .assert(Assertion::FieldEquals {
            plan: "p".into(),
            entity_type: Requirement,
            id: "r1".into(),
            field: "title".into(),
            value: json!("b"),
        })
        .assert_history("p", "r1", &[1])
        .run()
        .unwrap();
}
