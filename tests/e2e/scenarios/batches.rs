use crate::harness::{Assertion, ErrorMatch, Scenario};
use plandoc_core::EntityType::{Phase, Requirement, Solution};
use plandoc_core::{BatchOperation, EntityUpdate, NewEntity, NewLink, RelationType};
use serde_json::{json, Value};

fn payload(value: Value) -> NewEntity {
    NewEntity::from_value(value).expect("payload must be an object")
}

#[test]
fn test_failed_batch_persists_nothing() {
    Scenario::new("failed_batch")
        .plan("p")
        .batch(
            "p",
            vec![
                BatchOperation::create(Requirement, payload(json!({"title": "a"}))),
                BatchOperation::create(Requirement, payload(json!({"title": "b"}))),
                BatchOperation::update(Requirement, "ghost", EntityUpdate::default()),
                BatchOperation::create(Phase, payload(json!({"title": "c"}))),
                BatchOperation::create(Phase, payload(json!({"title": "d"}))),
            ],
        )
        .fails_with(ErrorMatch::NotFound)
        .assert_count("p", Requirement, 0)
        .assert_count("p", Phase, 0)
        .assert(Assertion::StatsCount {
            plan: "p".into(),
            entity_type: Requirement,
            count: 0,
        })
        .run()
        .expect("scenario should pass");
}

#[test]
fn test_placeholders_wire_a_plan_together() {
    Scenario::new("placeholders")
        .plan("p")
        .batch(
            "p",
            vec![
                BatchOperation::create_as("$req", Requirement, payload(json!({"title": "Login"})).id("req-1")),
                BatchOperation::create_as(
                    "$sol",
                    Solution,
                    payload(json!({"title": "OAuth", "addressing": ["$req"]})).id("sol-1"),
                ),
                BatchOperation::link(NewLink::new("$sol", "$req", RelationType::Addresses)),
                BatchOperation::update(
                    Requirement,
                    "$req",
                    EntityUpdate::patch(json!({"status": "planned"}).as_object().cloned().unwrap_or_default()),
                ),
            ],
        )
        .assert(Assertion::FieldEquals {
            plan: "p".into(),
            entity_type: Solution,
            id: "sol-1".into(),
            field: "addressing".into(),
            value: json!(["req-1"]),
        })
        .assert(Assertion::LinkExists {
            plan: "p".into(),
            source: "sol-1".into(),
            target: "req-1".into(),
            relation: RelationType::Addresses,
        })
        // created and updated in the same batch: no pre-batch state to keep
        .assert_version("p", Requirement, "req-1", 2)
        .assert_history("p", "req-1", &[])
        .assert(Assertion::StatsCount {
            plan: "p".into(),
            entity_type: Solution,
            count: 1,
        })
        .assert(Assertion::StatsLinks {
            plan: "p".into(),
            count: 1,
        })
        .run()
        .unwrap();
}

#[test]
fn test_unresolved_placeholder_fails() {
    Scenario::new("unresolved_placeholder")
        .plan("p")
        .batch(
            "p",
            vec![
                BatchOperation::create(Requirement, payload(json!({"title": "a"}))),
                BatchOperation::link(NewLink::new("$missing", "x", RelationType::Blocks)),
            ],
        )
        .fails_with(ErrorMatch::Validation)
        .assert_count("p", Requirement, 0)
        .assert_links("p", 0)
        .run()
        .unwrap();
}

#[test]
fn test_batch_updates_snapshot_pre_batch_state() {
    Scenario::new("batch_history")
        .plan("p")
        .create("p", Requirement, "r1", json!({"title": "v1"}))
        .batch(
            "p",
            vec![
                BatchOperation::update(
                    Requirement,
                    "r1",
                    EntityUpdate::patch(json!({"title": "v2"}).as_object().cloned().unwrap_or_default())
                        .expect_version(1)
                        .by("erin"),
                ),
                BatchOperation::update(
                    Requirement,
                    "r1",
                    EntityUpdate::patch(json!({"title": "v3"}).as_object().cloned().unwrap_or_default())
                        .expect_version(2),
                ),
            ],
        )
        .assert_version("p", Requirement, "r1", 3)
        .assert_history("p", "r1", &[1])
        .assert(Assertion::Custom(Box::new(|store| {
            let snapshot = store.history("p")?.get_version("r1", 1)?;
            anyhow::ensure!(snapshot.author.as_deref() == Some("erin"));
            anyhow::ensure!(snapshot.data.str_field("title") == Some("v1"));
            Ok(())
        })))
        .run()
        .unwrap();
}

#[test]
fn test_batch_links_and_deletes() {
    Scenario::new("batch_links_and_deletes")
        .plan("p")
        .create("p", Requirement, "r1", json!({"title": "a"}))
        .batch(
            "p",
            vec![
                BatchOperation::create_as("$a", Phase, payload(json!({"title": "design"})).id("ph-a")),
                BatchOperation::create_as("$b", Phase, payload(json!({"title": "build"})).id("ph-b")),
                BatchOperation::link_as("$l", NewLink::new("$b", "$a", RelationType::DependsOn)),
                BatchOperation::link(NewLink::new("$a", "r1", RelationType::Implements)),
                BatchOperation::unlink("$l"),
                BatchOperation::delete(Requirement, "r1"),
            ],
        )
        .assert_count("p", Phase, 2)
        .assert_count("p", Requirement, 0)
        // links are not cascaded on entity deletion
        .assert_links("p", 1)
        .assert(Assertion::LinkExists {
            plan: "p".into(),
            source: "ph-a".into(),
            target: "r1".into(),
            relation: RelationType::Implements,
        })
        .assert(Assertion::StatsLinks {
            plan: "p".into(),
            count: 1,
        })
        .run()
        .unwrap();
}
