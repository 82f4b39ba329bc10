pub mod graph;
pub mod manager;

pub use graph::{InMemoryTemporalStore, SurrealTemporalStore, TemporalStore};
pub use manager::{NodeManager, QueryOptions};

use uuid::Uuid;

use crate::error::ArborResult;
use crate::model::edge::{EdgeLabel, EdgeRecord, EdgeStatus};
use crate::model::timestamp::Timestamp;

// ---------------------------------------------------------------------------
// Persistence primitives
// ---------------------------------------------------------------------------
// Every mutation in the core goes through these three helpers. An edge is
// mutated exactly once, to close it; subsequent changes are new edges. This
// append-only discipline is what makes the diff engine possible.

/// Append a new edge between two vertices with validity starting at `at`.
pub async fn add_relationship(
    store: &dyn TemporalStore,
    source: Uuid,
    target: Uuid,
    label: EdgeLabel,
    branch_name: &str,
    branch_level: u8,
    at: Timestamp,
    status: EdgeStatus,
) -> ArborResult<Uuid> {
    let edge = EdgeRecord::new(label, source, target, branch_name, branch_level, at, status);
    store.add_edge(edge).await
}

/// Close the validity interval of each edge at `at`. Only edges whose
/// interval is still open are touched.
pub async fn close_relationships(
    store: &dyn TemporalStore,
    ids: &[Uuid],
    at: Timestamp,
) -> ArborResult<()> {
    store.close_edges(ids, &at).await
}

/// Logically delete a node on a branch: close the node's open edges on that
/// branch, then append a DELETED IS_PART_OF anchor recording the removal.
pub async fn delete_node(
    store: &dyn TemporalStore,
    node_db_id: Uuid,
    branch_vertex_id: Uuid,
    branch_name: &str,
    branch_level: u8,
    at: Timestamp,
) -> ArborResult<()> {
    let mut incident = store.edges_from(&node_db_id, None).await?;
    incident.extend(store.edges_to(&node_db_id, None).await?);

    let to_close: Vec<Uuid> = incident
        .iter()
        .filter(|edge| edge.branch == branch_name && edge.is_open())
        .map(|edge| edge.id)
        .collect();
    if !to_close.is_empty() {
        store.close_edges(&to_close, &at).await?;
    }

    add_relationship(
        store,
        node_db_id,
        branch_vertex_id,
        EdgeLabel::IsPartOf,
        branch_name,
        branch_level,
        at,
        EdgeStatus::Deleted,
    )
    .await?;
    Ok(())
}
