//! End-to-end scenarios for the branch- and time-versioned graph core:
//! create/read with schema defaults, branch isolation, diff classification,
//! conflict detection, clean merges, and relationship flag changes.

use std::sync::Once;
use std::time::Duration;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use arbor::diff::DiffAction;
use arbor::initialization::{create_branch, initialize};
use arbor::model::branch::Branch;
use arbor::{
    ArborConfig, ArborError, AttributeKind, AttributeSchema, EdgeLabel, InMemoryTemporalStore, ModifiedPath,
    Node, NodeManager, NodeSchema, QueryOptions, Registry, RelationshipSchema, Timestamp,
};

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });
}

async fn setup() -> (InMemoryTemporalStore, Registry) {
    init_tracing();
    let store = InMemoryTemporalStore::new();
    let registry = Registry::new();
    initialize(&store, &registry).await.unwrap();

    let criticality = NodeSchema::new("Criticality")
        .attribute(AttributeSchema::new("name", AttributeKind::String))
        .attribute(AttributeSchema::new("level", AttributeKind::Integer))
        .attribute(AttributeSchema::new("color", AttributeKind::String).with_default(json!("#444444")))
        .attribute(AttributeSchema::new("description", AttributeKind::String).optional());
    let person = NodeSchema::new("Person")
        .attribute(AttributeSchema::new("name", AttributeKind::String))
        .attribute(AttributeSchema::new("height", AttributeKind::Integer).optional());
    let car = NodeSchema::new("Car")
        .attribute(AttributeSchema::new("name", AttributeKind::String))
        .attribute(AttributeSchema::new("nbr_seats", AttributeKind::Integer))
        .attribute(AttributeSchema::new("is_electric", AttributeKind::Boolean))
        .relationship(RelationshipSchema::new("owner", "Person"));
    let tag = NodeSchema::new("Tag")
        .attribute(AttributeSchema::new("name", AttributeKind::String))
        .agnostic();

    registry.schema.set("main", criticality).await.unwrap();
    registry.schema.set("main", person).await.unwrap();
    registry.schema.set("main", car).await.unwrap();
    registry.schema.set("main", tag).await.unwrap();

    (store, registry)
}

fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Let the microsecond clock advance past the last write, so branch points
/// and diff marks are strictly ordered against fixture edges.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(2)).await;
}

async fn create_node(
    store: &InMemoryTemporalStore,
    registry: &Registry,
    kind: &str,
    branch: &Branch,
    pairs: &[(&str, Value)],
) -> Node {
    let schema = registry.schema_for(kind, &branch.name).await.unwrap();
    let mut node = Node::new(schema, branch.clone(), &fields(pairs)).unwrap();
    node.save(store, registry, None).await.unwrap();
    node
}

// ---------------------------------------------------------------------------
// Create + read
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_and_read_applies_schema_defaults() {
    let (store, registry) = setup().await;
    let main = registry.default_branch().await.unwrap();

    let created = create_node(
        &store,
        &registry,
        "Criticality",
        &main,
        &[("name", json!("low")), ("level", json!(4))],
    )
    .await;

    let manager = NodeManager::new(&store, &registry);
    let node = manager
        .get_one(created.uuid, &main, &QueryOptions::default())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(node.value("name"), Some(&json!("low")));
    assert_eq!(node.value("level"), Some(&json!(4)));
    assert_eq!(node.value("color"), Some(&json!("#444444")));
    assert_eq!(node.value("description"), None);

    let name = node.attribute("name").unwrap();
    assert!(name.is_visible);
    assert!(!name.is_protected);
}

#[tokio::test]
async fn query_by_kind_with_value_filter() {
    let (store, registry) = setup().await;
    let main = registry.default_branch().await.unwrap();

    create_node(&store, &registry, "Criticality", &main, &[("name", json!("low")), ("level", json!(4))]).await;
    create_node(&store, &registry, "Criticality", &main, &[("name", json!("high")), ("level", json!(1))]).await;

    let config = ArborConfig::default();
    let manager = NodeManager::from_config(&store, &registry, &config.main);
    let all = manager.query("Criticality", None, &main, &QueryOptions::default()).await.unwrap();
    assert_eq!(all.len(), 2);

    let mut filters = std::collections::HashMap::new();
    filters.insert("name".to_string(), json!("low"));
    let low = manager
        .query("Criticality", Some(&filters), &main, &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(low.len(), 1);
    assert_eq!(low[0].value("level"), Some(&json!(4)));
}

// ---------------------------------------------------------------------------
// Branch isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn branch_update_is_isolated_and_time_travel_works() {
    let (store, registry) = setup().await;
    let main = registry.default_branch().await.unwrap();

    let john = create_node(
        &store,
        &registry,
        "Person",
        &main,
        &[("name", json!("John")), ("height", json!(180))],
    )
    .await;

    settle().await;
    let b2 = create_branch(&store, &registry, "b2", None).await.unwrap();
    let t0 = b2.branched_from;

    let manager = NodeManager::new(&store, &registry);
    let mut on_b2 = manager
        .get_one(john.uuid, &b2, &QueryOptions::default())
        .await
        .unwrap()
        .unwrap();
    on_b2.set_value("height", json!(200)).unwrap();
    on_b2.save(&store, &registry, None).await.unwrap();

    // The default branch still sees the original value.
    let on_main = manager
        .get_one(john.uuid, &main, &QueryOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(on_main.value("height"), Some(&json!(180)));

    // The branch sees the new value.
    let reread = manager
        .get_one(john.uuid, &b2, &QueryOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reread.value("height"), Some(&json!(200)));

    // Reading the branch just before its divergence point travels back.
    let before = manager
        .get_one(john.uuid, &b2, &QueryOptions::at(t0.add_micros(-1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before.value("height"), Some(&json!(180)));
}

// ---------------------------------------------------------------------------
// Diff classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn diff_classifies_added_removed_and_updated() {
    let (store, registry) = setup().await;
    let main = registry.default_branch().await.unwrap();

    let node_b = create_node(&store, &registry, "Person", &main, &[("name", json!("B"))]).await;
    let node_c = create_node(&store, &registry, "Criticality", &main, &[("name", json!("x")), ("level", json!(1))])
        .await;

    settle().await;
    let b2 = create_branch(&store, &registry, "b2", None).await.unwrap();
    let manager = NodeManager::new(&store, &registry);

    // Add node A on the branch.
    let node_a = create_node(&store, &registry, "Person", &b2, &[("name", json!("A"))]).await;

    // Delete node B on the branch.
    let mut b_on_b2 = manager.get_one(node_b.uuid, &b2, &QueryOptions::default()).await.unwrap().unwrap();
    b_on_b2.delete(&store, &registry, None).await.unwrap();

    // Update C.name on the branch.
    let mut c_on_b2 = manager.get_one(node_c.uuid, &b2, &QueryOptions::default()).await.unwrap().unwrap();
    c_on_b2.set_value("name", json!("y")).unwrap();
    c_on_b2.save(&store, &registry, None).await.unwrap();

    let mut diff = b2.diff(&store, &registry, false, None, None).await.unwrap();
    let nodes = diff.get_nodes().await.unwrap();
    let changes = &nodes["b2"];

    assert_eq!(changes[&node_a.uuid].action, DiffAction::Added);
    assert_eq!(changes[&node_b.uuid].action, DiffAction::Removed);

    let c_change = &changes[&node_c.uuid];
    assert_eq!(c_change.action, DiffAction::Updated);
    let name_change = &c_change.attributes["name"];
    assert_eq!(name_change.action, DiffAction::Updated);
    let value_change = &name_change.properties[&EdgeLabel::HasValue];
    assert_eq!(value_change.action, DiffAction::Updated);
    assert!(value_change.origin_rel_id.is_some());

    // The deleted node is gone on the branch but intact on the default.
    assert!(manager.get_one(node_b.uuid, &b2, &QueryOptions::default()).await.unwrap().is_none());
    assert!(manager.get_one(node_b.uuid, &main, &QueryOptions::default()).await.unwrap().is_some());

    // Attributes of the added node are classified as additions.
    let a_change = &changes[&node_a.uuid];
    assert_eq!(a_change.attributes["name"].action, DiffAction::Added);
    assert_eq!(
        a_change.attributes["name"].properties[&EdgeLabel::HasValue].action,
        DiffAction::Added
    );
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_updates_conflict_and_block_merge() {
    let (store, registry) = setup().await;
    let main = registry.default_branch().await.unwrap();

    let node_c = create_node(&store, &registry, "Criticality", &main, &[("name", json!("x")), ("level", json!(1))])
        .await;
    settle().await;
    let b2 = create_branch(&store, &registry, "b2", None).await.unwrap();
    let manager = NodeManager::new(&store, &registry);

    // Update the same attribute on both branches after the divergence point.
    let mut on_main = manager.get_one(node_c.uuid, &main, &QueryOptions::default()).await.unwrap().unwrap();
    on_main.set_value("name", json!("z")).unwrap();
    on_main.save(&store, &registry, None).await.unwrap();

    let mut on_b2 = manager.get_one(node_c.uuid, &b2, &QueryOptions::default()).await.unwrap().unwrap();
    on_b2.set_value("name", json!("y")).unwrap();
    on_b2.save(&store, &registry, None).await.unwrap();

    let mut diff = b2.diff(&store, &registry, false, None, None).await.unwrap();
    let conflicts = diff.get_conflicts().await.unwrap();
    assert_eq!(
        conflicts,
        vec![ModifiedPath::Node {
            node: node_c.uuid,
            attribute: "name".to_string(),
            property: EdgeLabel::HasValue,
        }]
    );

    let mut b2 = registry.get_branch("b2").await.unwrap();
    let err = b2.merge(&store, &registry, None).await.unwrap_err();
    assert!(matches!(err, ArborError::Conflict(paths) if paths.len() == 1));
}

#[tokio::test]
async fn conflict_set_is_symmetric() {
    let (store, registry) = setup().await;
    let main = registry.default_branch().await.unwrap();

    let node_c = create_node(&store, &registry, "Criticality", &main, &[("name", json!("x")), ("level", json!(1))])
        .await;
    settle().await;
    let b2 = create_branch(&store, &registry, "b2", None).await.unwrap();
    let manager = NodeManager::new(&store, &registry);

    let mut on_main = manager.get_one(node_c.uuid, &main, &QueryOptions::default()).await.unwrap().unwrap();
    on_main.set_value("name", json!("z")).unwrap();
    on_main.save(&store, &registry, None).await.unwrap();

    let mut on_b2 = manager.get_one(node_c.uuid, &b2, &QueryOptions::default()).await.unwrap().unwrap();
    on_b2.set_value("name", json!("y")).unwrap();
    on_b2.save(&store, &registry, None).await.unwrap();

    let mut diff = b2.diff(&store, &registry, false, None, None).await.unwrap();
    let paths = diff.get_modified_paths().await.unwrap();
    let conflicts = diff.get_conflicts().await.unwrap();

    let mut forward: Vec<ModifiedPath> = paths["b2"].intersection(&paths["main"]).cloned().collect();
    let mut backward: Vec<ModifiedPath> = paths["main"].intersection(&paths["b2"]).cloned().collect();
    forward.sort();
    backward.sort();
    assert_eq!(forward, backward);
    assert_eq!(conflicts, forward);
}

#[tokio::test]
async fn branch_only_paths_never_mention_the_origin() {
    let (store, registry) = setup().await;
    let main = registry.default_branch().await.unwrap();

    let node_c = create_node(&store, &registry, "Criticality", &main, &[("name", json!("x")), ("level", json!(1))])
        .await;
    settle().await;
    let b2 = create_branch(&store, &registry, "b2", None).await.unwrap();
    let manager = NodeManager::new(&store, &registry);

    let mut on_main = manager.get_one(node_c.uuid, &main, &QueryOptions::default()).await.unwrap().unwrap();
    on_main.set_value("name", json!("z")).unwrap();
    on_main.save(&store, &registry, None).await.unwrap();

    let mut on_b2 = manager.get_one(node_c.uuid, &b2, &QueryOptions::default()).await.unwrap().unwrap();
    on_b2.set_value("name", json!("y")).unwrap();
    on_b2.save(&store, &registry, None).await.unwrap();

    let mut diff = b2.diff(&store, &registry, true, None, None).await.unwrap();
    let paths = diff.get_modified_paths().await.unwrap();
    assert!(paths.contains_key("b2"));
    assert!(!paths.contains_key("main"));

    // Conflicts are vacuously empty in branch-only mode.
    assert!(diff.get_conflicts().await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn merge_replays_description_change_onto_default() {
    let (store, registry) = setup().await;
    let main = registry.default_branch().await.unwrap();

    let node_c = create_node(&store, &registry, "Criticality", &main, &[("name", json!("x")), ("level", json!(1))])
        .await;
    settle().await;
    let mut b2 = create_branch(&store, &registry, "b2", None).await.unwrap();
    let before_merge = b2.branched_from;
    let manager = NodeManager::new(&store, &registry);

    let mut on_b2 = manager.get_one(node_c.uuid, &b2, &QueryOptions::default()).await.unwrap().unwrap();
    on_b2.set_value("description", json!("from-b2")).unwrap();
    on_b2.save(&store, &registry, None).await.unwrap();

    settle().await;
    b2.merge(&store, &registry, None).await.unwrap();

    // The default branch now shows the branch's change.
    let on_main = manager.get_one(node_c.uuid, &main, &QueryOptions::default()).await.unwrap().unwrap();
    assert_eq!(on_main.value("description"), Some(&json!("from-b2")));

    // The branch was rebased forward.
    let rebased = registry.get_branch("b2").await.unwrap();
    assert!(rebased.branched_from > before_merge);

    // A subsequent diff of the branch is empty.
    let mut diff = rebased.diff(&store, &registry, false, None, None).await.unwrap();
    assert!(!diff.has_changes().await.unwrap());
    assert!(diff.get_conflicts().await.unwrap().is_empty());
}

#[tokio::test]
async fn merge_replays_added_and_removed_nodes() {
    let (store, registry) = setup().await;
    let main = registry.default_branch().await.unwrap();

    let node_b = create_node(&store, &registry, "Person", &main, &[("name", json!("B"))]).await;
    settle().await;
    let mut b2 = create_branch(&store, &registry, "b2", None).await.unwrap();
    let manager = NodeManager::new(&store, &registry);

    let node_a = create_node(&store, &registry, "Person", &b2, &[("name", json!("A"))]).await;
    let mut b_on_b2 = manager.get_one(node_b.uuid, &b2, &QueryOptions::default()).await.unwrap().unwrap();
    b_on_b2.delete(&store, &registry, None).await.unwrap();

    b2.merge(&store, &registry, None).await.unwrap();

    // The added node is visible on the default branch, the removed one gone.
    assert!(manager.get_one(node_a.uuid, &main, &QueryOptions::default()).await.unwrap().is_some());
    assert!(manager.get_one(node_b.uuid, &main, &QueryOptions::default()).await.unwrap().is_none());
}

#[tokio::test]
async fn merge_rejects_the_default_branch() {
    let (store, registry) = setup().await;
    let mut main = registry.default_branch().await.unwrap();
    let err = main.merge(&store, &registry, None).await.unwrap_err();
    assert!(matches!(err, ArborError::Validation(_)));
}

#[tokio::test]
async fn deep_hierarchies_are_rejected() {
    let (store, registry) = setup().await;
    let mut branch = create_branch(&store, &registry, "b2", None).await.unwrap();
    branch.hierarchy_level = 3;

    let err = branch.diff(&store, &registry, false, None, None).await.unwrap_err();
    assert!(matches!(err, ArborError::Integrity(_)));
    let err = branch.merge(&store, &registry, None).await.unwrap_err();
    assert!(matches!(err, ArborError::Integrity(_)));
}

// ---------------------------------------------------------------------------
// Relationships
// ---------------------------------------------------------------------------

#[tokio::test]
async fn relationship_flags_roundtrip_and_diff_as_single_property() {
    let (store, registry) = setup().await;
    let main = registry.default_branch().await.unwrap();

    let p1 = create_node(&store, &registry, "Person", &main, &[("name", json!("P1"))]).await;
    let car = create_node(
        &store,
        &registry,
        "Car",
        &main,
        &[
            ("name", json!("smart")),
            ("nbr_seats", json!(2)),
            ("is_electric", json!(true)),
            ("owner", json!({"id": p1.uuid.to_string(), "is_visible": false, "is_protected": true})),
        ],
    )
    .await;

    let manager = NodeManager::new(&store, &registry);
    let mut loaded = manager.get_one(car.uuid, &main, &QueryOptions::default()).await.unwrap().unwrap();
    {
        let rels = loaded.relationships_named("owner");
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].peer_uuid, p1.uuid);
        assert!(!rels[0].is_visible);
        assert!(rels[0].is_protected);
    }

    // Flip is_visible and diff the default branch across the flip.
    settle().await;
    let mark = Timestamp::now();
    loaded.relationship_mut("owner").unwrap().is_visible = true;
    loaded.save(&store, &registry, None).await.unwrap();

    let mut diff = main.diff(&store, &registry, false, Some(mark), None).await.unwrap();
    let rels = diff.get_relationships().await.unwrap();
    let by_rel = &rels["main"]["owner__person"];
    assert_eq!(by_rel.len(), 1);

    let element = by_rel.values().next().unwrap();
    assert_eq!(element.action, DiffAction::Updated);
    assert_eq!(element.properties.len(), 1);
    let change = &element.properties[&EdgeLabel::IsVisible];
    assert_eq!(change.kind, EdgeLabel::IsVisible);
    assert_eq!(change.action, DiffAction::Updated);

    // The flipped flag reads back.
    let reread = manager.get_one(car.uuid, &main, &QueryOptions::default()).await.unwrap().unwrap();
    assert!(reread.relationships_named("owner")[0].is_visible);
}

#[tokio::test]
async fn relationship_created_on_branch_merges_onto_default() {
    let (store, registry) = setup().await;
    let main = registry.default_branch().await.unwrap();

    let p1 = create_node(&store, &registry, "Person", &main, &[("name", json!("P1"))]).await;
    let car = create_node(
        &store,
        &registry,
        "Car",
        &main,
        &[("name", json!("kona")), ("nbr_seats", json!(5)), ("is_electric", json!(true))],
    )
    .await;

    settle().await;
    let mut b2 = create_branch(&store, &registry, "b2", None).await.unwrap();
    let manager = NodeManager::new(&store, &registry);

    let mut on_b2 = manager.get_one(car.uuid, &b2, &QueryOptions::default()).await.unwrap().unwrap();
    on_b2.add_relationship("owner", &json!(p1.uuid.to_string())).unwrap();
    on_b2.save(&store, &registry, None).await.unwrap();

    // Visible on the branch, absent on the default.
    let on_b2 = manager.get_one(car.uuid, &b2, &QueryOptions::default()).await.unwrap().unwrap();
    assert_eq!(on_b2.relationships_named("owner").len(), 1);
    let on_main = manager.get_one(car.uuid, &main, &QueryOptions::default()).await.unwrap().unwrap();
    assert!(on_main.relationships_named("owner").is_empty());

    b2.merge(&store, &registry, None).await.unwrap();

    let on_main = manager.get_one(car.uuid, &main, &QueryOptions::default()).await.unwrap().unwrap();
    assert_eq!(on_main.relationships_named("owner").len(), 1);
    assert_eq!(on_main.relationships_named("owner")[0].peer_uuid, p1.uuid);
}

#[tokio::test]
async fn attribute_delete_diffs_and_merges() {
    let (store, registry) = setup().await;
    let main = registry.default_branch().await.unwrap();

    let node_c = create_node(
        &store,
        &registry,
        "Criticality",
        &main,
        &[("name", json!("x")), ("level", json!(1)), ("description", json!("old"))],
    )
    .await;
    settle().await;
    let mut b2 = create_branch(&store, &registry, "b2", None).await.unwrap();
    let manager = NodeManager::new(&store, &registry);

    let mut on_b2 = manager.get_one(node_c.uuid, &b2, &QueryOptions::default()).await.unwrap().unwrap();
    on_b2.delete_attribute("description", &store, &registry, None).await.unwrap();

    // The attribute is gone on the branch and intact on the default.
    let reread = manager.get_one(node_c.uuid, &b2, &QueryOptions::default()).await.unwrap().unwrap();
    assert!(reread.attribute("description").is_none());
    let on_main = manager.get_one(node_c.uuid, &main, &QueryOptions::default()).await.unwrap().unwrap();
    assert_eq!(on_main.value("description"), Some(&json!("old")));

    let mut diff = b2.diff(&store, &registry, false, None, None).await.unwrap();
    let nodes = diff.get_nodes().await.unwrap();
    let attr_change = &nodes["b2"][&node_c.uuid].attributes["description"];
    assert_eq!(attr_change.action, DiffAction::Removed);
    assert!(attr_change.origin_rel_id.is_some());
    assert_eq!(
        attr_change.properties[&EdgeLabel::HasValue].action,
        DiffAction::Removed
    );

    b2.merge(&store, &registry, None).await.unwrap();
    let on_main = manager.get_one(node_c.uuid, &main, &QueryOptions::default()).await.unwrap().unwrap();
    assert!(on_main.attribute("description").is_none());
}

#[tokio::test]
async fn relationship_delete_diffs_and_merges() {
    let (store, registry) = setup().await;
    let main = registry.default_branch().await.unwrap();

    let p1 = create_node(&store, &registry, "Person", &main, &[("name", json!("P1"))]).await;
    let car = create_node(
        &store,
        &registry,
        "Car",
        &main,
        &[
            ("name", json!("smart")),
            ("nbr_seats", json!(2)),
            ("is_electric", json!(true)),
            ("owner", json!(p1.uuid.to_string())),
        ],
    )
    .await;

    settle().await;
    let mut b2 = create_branch(&store, &registry, "b2", None).await.unwrap();
    let manager = NodeManager::new(&store, &registry);

    let mut on_b2 = manager.get_one(car.uuid, &b2, &QueryOptions::default()).await.unwrap().unwrap();
    on_b2.remove_relationship("owner", &store, &registry, None).await.unwrap();

    let reread = manager.get_one(car.uuid, &b2, &QueryOptions::default()).await.unwrap().unwrap();
    assert!(reread.relationships_named("owner").is_empty());
    let on_main = manager.get_one(car.uuid, &main, &QueryOptions::default()).await.unwrap().unwrap();
    assert_eq!(on_main.relationships_named("owner").len(), 1);

    let mut diff = b2.diff(&store, &registry, false, None, None).await.unwrap();
    let rels = diff.get_relationships().await.unwrap();
    let element = rels["b2"]["owner__person"].values().next().unwrap().clone();
    assert_eq!(element.action, DiffAction::Removed);
    assert_eq!(element.nodes.len(), 2);

    b2.merge(&store, &registry, None).await.unwrap();
    let on_main = manager.get_one(car.uuid, &main, &QueryOptions::default()).await.unwrap().unwrap();
    assert!(on_main.relationships_named("owner").is_empty());
}

// ---------------------------------------------------------------------------
// Global branch & read options
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agnostic_entities_are_shared_across_branches() {
    let (store, registry) = setup().await;
    let main = registry.default_branch().await.unwrap();
    settle().await;
    let b2 = create_branch(&store, &registry, "b2", None).await.unwrap();

    // Created against the branch, stored under the global branch.
    let tag = create_node(&store, &registry, "Tag", &b2, &[("name", json!("blue"))]).await;

    let manager = NodeManager::new(&store, &registry);
    let from_main = manager.get_one(tag.uuid, &main, &QueryOptions::default()).await.unwrap();
    let from_b2 = manager.get_one(tag.uuid, &b2, &QueryOptions::default()).await.unwrap();
    assert!(from_main.is_some());
    assert!(from_b2.is_some());
    assert_eq!(from_main.unwrap().value("name"), Some(&json!("blue")));
}

// ---------------------------------------------------------------------------
// Repository collaborator
// ---------------------------------------------------------------------------

struct StubRepositoryConnector {
    repository: arbor::repository::RepositorySummary,
    changed_files: Vec<String>,
    check_failures: Vec<String>,
}

#[async_trait::async_trait]
impl arbor::repository::RepositoryConnector for StubRepositoryConnector {
    async fn list_repositories(
        &self,
        branch: &str,
    ) -> arbor::ArborResult<Vec<arbor::repository::RepositorySummary>> {
        let mut repository = self.repository.clone();
        if branch != "main" {
            repository.commit = format!("{}-{}", repository.commit, branch);
        }
        Ok(vec![repository])
    }

    async fn diff_against_commit(
        &self,
        _repository: &arbor::repository::RepositorySummary,
        _commit: &str,
    ) -> arbor::ArborResult<Vec<String>> {
        Ok(self.changed_files.clone())
    }

    async fn run_checks(
        &self,
        _repository: &arbor::repository::RepositorySummary,
    ) -> arbor::ArborResult<Vec<String>> {
        Ok(self.check_failures.clone())
    }

    async fn merge(&self, _repository: &arbor::repository::RepositorySummary) -> arbor::ArborResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn file_diffs_come_from_the_repository_connector() {
    let (store, registry) = setup().await;
    registry.set_repository_connector(std::sync::Arc::new(StubRepositoryConnector {
        repository: arbor::repository::RepositorySummary {
            uuid: Uuid::new_v4(),
            name: "infra-configs".to_string(),
            commit: "abc123".to_string(),
        },
        changed_files: vec!["topologies/dc1.yml".to_string()],
        check_failures: Vec::new(),
    }));

    let b2 = create_branch(&store, &registry, "b2", None).await.unwrap();
    let mut diff = b2.diff(&store, &registry, false, None, None).await.unwrap();
    let files = diff.get_files().await.unwrap();

    assert_eq!(files["b2"].len(), 1);
    assert_eq!(files["b2"][0].repository_name, "infra-configs");
    assert_eq!(files["b2"][0].files, vec!["topologies/dc1.yml".to_string()]);
}

#[tokio::test]
async fn failing_repository_checks_block_the_merge() {
    let (store, registry) = setup().await;
    registry.set_repository_connector(std::sync::Arc::new(StubRepositoryConnector {
        repository: arbor::repository::RepositorySummary {
            uuid: Uuid::new_v4(),
            name: "infra-configs".to_string(),
            commit: "abc123".to_string(),
        },
        changed_files: Vec::new(),
        check_failures: vec!["rendering failed for dc1".to_string()],
    }));

    let mut b2 = create_branch(&store, &registry, "b2", None).await.unwrap();

    let validation = b2.validate(&store, &registry).await.unwrap();
    assert!(!validation.passed);
    assert_eq!(validation.messages, vec!["rendering failed for dc1".to_string()]);

    let err = b2.merge(&store, &registry, None).await.unwrap_err();
    assert!(matches!(err, ArborError::Validation(_)));
}

#[tokio::test]
async fn reads_accept_the_configured_deadline() {
    let (store, registry) = setup().await;
    let main = registry.default_branch().await.unwrap();
    let node = create_node(&store, &registry, "Person", &main, &[("name", json!("John"))]).await;

    let config = ArborConfig::default();
    let manager = NodeManager::from_config(&store, &registry, &config.main);
    let options = QueryOptions::bounded(&config.main);
    assert_eq!(options.deadline, Some(config.main.query_timeout()));

    let found = manager.get_one(node.uuid, &main, &options).await.unwrap();
    assert!(found.is_some());

    let missing = manager.get_one(Uuid::new_v4(), &main, &options).await.unwrap();
    assert!(missing.is_none());
}
