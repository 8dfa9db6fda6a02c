use crate::harness::{Assertion, ErrorMatch, Scenario};
use plandoc_core::EntityType::{Artifact, Phase, Requirement};
use plandoc_core::{LinkDirection, RelationType};
use serde_json::json;

#[test]
fn test_link_lifecycle() {
    Scenario::new("link_lifecycle")
        .plan("p")
        .create("p", Requirement, "r1", json!({"title": "a"}))
        .create("p", Phase, "ph1", json!({"title": "b"}))
        .create("p", Artifact, "a1", json!({"title": "c"}))
        .link("p", "ph1", "r1", RelationType::Implements)
        .link("p", "ph1", "a1", RelationType::HasArtifact)
        .link("p", "a1", "r1", RelationType::Validates)
        .link("p", "ph1", "r1", RelationType::Implements)
        .fails_with(ErrorMatch::Conflict)
        .link("p", "r1", "r1", RelationType::Blocks)
        .fails_with(ErrorMatch::Validation)
        .assert_links("p", 3)
        .assert(Assertion::Custom(Box::new(|store| {
            let links = store.links("p")?;
            let outgoing = links.find_links_for_entity("ph1", LinkDirection::Outgoing, None)?;
            anyhow::ensure!(outgoing.len() == 2);
            let incoming = links.find_links_by_target("r1", Some(RelationType::Validates))?;
            anyhow::ensure!(incoming.len() == 1 && incoming[0].source_id == "a1");
            let both = links.find_links_for_entity("a1", LinkDirection::Both, None)?;
            anyhow::ensure!(both.len() == 2);
            Ok(())
        })))
        .unlink_all("p", "r1")
        .assert_links("p", 1)
        .assert(Assertion::LinkExists {
            plan: "p".into(),
            source: "ph1".into(),
            target: "a1".into(),
            relation: RelationType::HasArtifact,
        })
        .run()
        .expect("scenario should pass");
}

#[test]
fn test_entity_deletion_keeps_links() {
    Scenario::new("no_cascade")
        .plan("p")
        .create("p", Requirement, "r1", json!({"title": "a"}))
        .create("p", Requirement, "r2", json!({"title": "b"}))
        .link("p", "r2", "r1", RelationType::DerivedFrom)
        .delete("p", Requirement, "r1")
        .assert_links("p", 1)
        .delete("p", Requirement, "r1")
        .fails_with(ErrorMatch::NotFound)
        .run()
        .unwrap();
}
