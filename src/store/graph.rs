use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::db::{ArborDatabase, QueryKind};
use crate::error::{ArborError, ArborResult};
use crate::model::edge::{EdgeLabel, EdgeRecord, EdgeStatus, VertexRecord};
use crate::model::timestamp::Timestamp;

// ---------------------------------------------------------------------------
// TemporalStore trait: vertices + labeled edges with validity metadata
// ---------------------------------------------------------------------------

/// Trait for temporal graph backends. Edges are append-only; the only
/// permitted mutation is closing an open validity interval, which each
/// implementation must apply at most once per edge.
#[async_trait]
pub trait TemporalStore: Send + Sync {
    /// Add a vertex.
    async fn add_vertex(&self, vertex: VertexRecord) -> ArborResult<()>;

    /// Get a vertex by storage id.
    async fn get_vertex(&self, id: &Uuid) -> ArborResult<Option<VertexRecord>>;

    /// Replace a vertex's labels and properties.
    async fn update_vertex(&self, vertex: VertexRecord) -> ArborResult<()>;

    /// All vertices carrying a label.
    async fn vertices_with_label(&self, label: &str) -> ArborResult<Vec<VertexRecord>>;

    /// The vertex carrying a label whose `uuid` property matches.
    async fn vertex_by_entity_uuid(&self, label: &str, uuid: &Uuid) -> ArborResult<Option<VertexRecord>>;

    /// Append an edge, returning its storage id.
    async fn add_edge(&self, edge: EdgeRecord) -> ArborResult<Uuid>;

    /// Get an edge by storage id.
    async fn get_edge(&self, id: &Uuid) -> ArborResult<Option<EdgeRecord>>;

    /// Set `to = at` on each edge whose interval is still open.
    async fn close_edges(&self, ids: &[Uuid], at: &Timestamp) -> ArborResult<()>;

    /// Outbound edges of a vertex, optionally filtered by label.
    async fn edges_from(&self, source: &Uuid, labels: Option<&[EdgeLabel]>) -> ArborResult<Vec<EdgeRecord>>;

    /// Inbound edges of a vertex, optionally filtered by label.
    async fn edges_to(&self, target: &Uuid, labels: Option<&[EdgeLabel]>) -> ArborResult<Vec<EdgeRecord>>;

    /// Edges of the given labels and branches touching a diff window: their
    /// interval either starts at/after `window_from` or was closed at/before
    /// it.
    async fn edges_in_window(
        &self,
        labels: &[EdgeLabel],
        branches: &[String],
        window_from: &Timestamp,
    ) -> ArborResult<Vec<EdgeRecord>>;

    /// Begin a transactional unit.
    async fn begin(&self) -> ArborResult<()>;

    /// Commit the current transactional unit.
    async fn commit(&self) -> ArborResult<()>;

    /// Abort the current transactional unit, undoing its writes.
    async fn cancel(&self) -> ArborResult<()>;
}

// ---------------------------------------------------------------------------
// InMemoryTemporalStore: development and tests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct StoreState {
    vertices: HashMap<Uuid, VertexRecord>,
    edges: HashMap<Uuid, EdgeRecord>,
    outbound: HashMap<Uuid, Vec<Uuid>>,
    inbound: HashMap<Uuid, Vec<Uuid>>,
}

/// In-memory temporal store backed by adjacency maps. Transactions snapshot
/// the full state; cancel restores it.
#[derive(Default)]
pub struct InMemoryTemporalStore {
    state: RwLock<StoreState>,
    snapshot: Mutex<Option<StoreState>>,
}

impl InMemoryTemporalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn vertex_count(&self) -> usize {
        self.state.read().await.vertices.len()
    }

    pub async fn edge_count(&self) -> usize {
        self.state.read().await.edges.len()
    }
}

#[async_trait]
impl TemporalStore for InMemoryTemporalStore {
    async fn add_vertex(&self, vertex: VertexRecord) -> ArborResult<()> {
        let mut state = self.state.write().await;
        if state.vertices.contains_key(&vertex.id) {
            return Err(ArborError::Internal(format!("duplicate vertex {}", vertex.id)));
        }
        state.outbound.entry(vertex.id).or_default();
        state.inbound.entry(vertex.id).or_default();
        state.vertices.insert(vertex.id, vertex);
        Ok(())
    }

    async fn get_vertex(&self, id: &Uuid) -> ArborResult<Option<VertexRecord>> {
        Ok(self.state.read().await.vertices.get(id).cloned())
    }

    async fn update_vertex(&self, vertex: VertexRecord) -> ArborResult<()> {
        let mut state = self.state.write().await;
        if !state.vertices.contains_key(&vertex.id) {
            return Err(ArborError::Internal(format!("unknown vertex {}", vertex.id)));
        }
        state.vertices.insert(vertex.id, vertex);
        Ok(())
    }

    async fn vertices_with_label(&self, label: &str) -> ArborResult<Vec<VertexRecord>> {
        let state = self.state.read().await;
        Ok(state
            .vertices
            .values()
            .filter(|v| v.has_label(label))
            .cloned()
            .collect())
    }

    async fn vertex_by_entity_uuid(&self, label: &str, uuid: &Uuid) -> ArborResult<Option<VertexRecord>> {
        let wanted = uuid.to_string();
        let state = self.state.read().await;
        Ok(state
            .vertices
            .values()
            .find(|v| v.has_label(label) && v.property_str("uuid") == Some(wanted.as_str()))
            .cloned())
    }

    async fn add_edge(&self, edge: EdgeRecord) -> ArborResult<Uuid> {
        let mut state = self.state.write().await;
        if !state.vertices.contains_key(&edge.source) {
            return Err(ArborError::Internal(format!("edge source {} does not exist", edge.source)));
        }
        if !state.vertices.contains_key(&edge.target) {
            return Err(ArborError::Internal(format!("edge target {} does not exist", edge.target)));
        }
        let id = edge.id;
        state.outbound.entry(edge.source).or_default().push(id);
        state.inbound.entry(edge.target).or_default().push(id);
        state.edges.insert(id, edge);
        Ok(id)
    }

    async fn get_edge(&self, id: &Uuid) -> ArborResult<Option<EdgeRecord>> {
        Ok(self.state.read().await.edges.get(id).cloned())
    }

    async fn close_edges(&self, ids: &[Uuid], at: &Timestamp) -> ArborResult<()> {
        let mut state = self.state.write().await;
        for id in ids {
            if let Some(edge) = state.edges.get_mut(id) {
                if edge.to.is_none() {
                    edge.to = Some(*at);
                }
            }
        }
        Ok(())
    }

    async fn edges_from(&self, source: &Uuid, labels: Option<&[EdgeLabel]>) -> ArborResult<Vec<EdgeRecord>> {
        let state = self.state.read().await;
        let ids = state.outbound.get(source).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.edges.get(id))
            .filter(|edge| labels.map_or(true, |wanted| wanted.contains(&edge.label)))
            .cloned()
            .collect())
    }

    async fn edges_to(&self, target: &Uuid, labels: Option<&[EdgeLabel]>) -> ArborResult<Vec<EdgeRecord>> {
        let state = self.state.read().await;
        let ids = state.inbound.get(target).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.edges.get(id))
            .filter(|edge| labels.map_or(true, |wanted| wanted.contains(&edge.label)))
            .cloned()
            .collect())
    }

    async fn edges_in_window(
        &self,
        labels: &[EdgeLabel],
        branches: &[String],
        window_from: &Timestamp,
    ) -> ArborResult<Vec<EdgeRecord>> {
        let state = self.state.read().await;
        Ok(state
            .edges
            .values()
            .filter(|edge| labels.contains(&edge.label))
            .filter(|edge| branches.iter().any(|b| b == &edge.branch))
            .filter(|edge| edge.from >= *window_from || edge.to.map_or(false, |to| to <= *window_from))
            .cloned()
            .collect())
    }

    async fn begin(&self) -> ArborResult<()> {
        let mut snapshot = self.snapshot.lock().await;
        if snapshot.is_some() {
            return Err(ArborError::Transaction("transaction already in progress".into()));
        }
        *snapshot = Some(self.state.read().await.clone());
        Ok(())
    }

    async fn commit(&self) -> ArborResult<()> {
        let mut snapshot = self.snapshot.lock().await;
        if snapshot.take().is_none() {
            return Err(ArborError::Transaction("no transaction in progress".into()));
        }
        Ok(())
    }

    async fn cancel(&self) -> ArborResult<()> {
        let mut snapshot = self.snapshot.lock().await;
        match snapshot.take() {
            Some(saved) => {
                *self.state.write().await = saved;
                Ok(())
            }
            None => Err(ArborError::Transaction("no transaction in progress".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// SurrealTemporalStore
// ---------------------------------------------------------------------------

/// Row shape for vertices in the `vertex` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VertexRow {
    uid: String,
    labels: Vec<String>,
    properties: Map<String, Value>,
}

/// Row shape for edges in the `edge` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EdgeRow {
    uid: String,
    label: EdgeLabel,
    source: String,
    target: String,
    branch: String,
    from: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    to: Option<String>,
    status: EdgeStatus,
    hierarchy_level: u8,
}

impl VertexRow {
    fn from_record(vertex: &VertexRecord) -> Self {
        Self {
            uid: vertex.id.to_string(),
            labels: vertex.labels.clone(),
            properties: vertex.properties.clone(),
        }
    }

    fn into_record(self) -> ArborResult<VertexRecord> {
        Ok(VertexRecord {
            id: Uuid::parse_str(&self.uid)
                .map_err(|e| ArborError::Backend(format!("bad vertex id {}: {}", self.uid, e)))?,
            labels: self.labels,
            properties: self.properties,
        })
    }
}

impl EdgeRow {
    fn from_record(edge: &EdgeRecord) -> Self {
        Self {
            uid: edge.id.to_string(),
            label: edge.label,
            source: edge.source.to_string(),
            target: edge.target.to_string(),
            branch: edge.branch.clone(),
            from: edge.from.to_rfc3339(),
            to: edge.to.map(|t| t.to_rfc3339()),
            status: edge.status,
            hierarchy_level: edge.hierarchy_level,
        }
    }

    fn into_record(self) -> ArborResult<EdgeRecord> {
        Ok(EdgeRecord {
            id: Uuid::parse_str(&self.uid)
                .map_err(|e| ArborError::Backend(format!("bad edge id {}: {}", self.uid, e)))?,
            label: self.label,
            source: Uuid::parse_str(&self.source)
                .map_err(|e| ArborError::Backend(format!("bad edge source {}: {}", self.source, e)))?,
            target: Uuid::parse_str(&self.target)
                .map_err(|e| ArborError::Backend(format!("bad edge target {}: {}", self.target, e)))?,
            branch: self.branch,
            from: Timestamp::parse(&self.from)?,
            to: self.to.as_deref().map(Timestamp::parse).transpose()?,
            status: self.status,
            hierarchy_level: self.hierarchy_level,
        })
    }
}

/// SurrealDB-backed temporal store. Vertices live in a single `vertex`
/// table and edges in a single `edge` table, so the diff window scan is one
/// indexed query.
#[derive(Clone)]
pub struct SurrealTemporalStore {
    db: ArborDatabase,
    /// The shared connection runs at most one transaction at a time.
    in_transaction: Arc<Mutex<bool>>,
}

impl SurrealTemporalStore {
    pub fn new(db: ArborDatabase) -> Self {
        Self {
            db,
            in_transaction: Arc::new(Mutex::new(false)),
        }
    }

    fn backend_err(context: &str, err: impl std::fmt::Display) -> ArborError {
        ArborError::Backend(format!("{}: {}", context, err))
    }

    async fn select_edges(&self, query: &str, params: Vec<(String, Value)>) -> ArborResult<Vec<EdgeRecord>> {
        let mut response = self
            .db
            .run(QueryKind::Read, query, params)
            .await
            .map_err(|e| Self::backend_err("edge query failed", e))?;
        let rows: Vec<EdgeRow> = response
            .take(0)
            .map_err(|e| Self::backend_err("edge rows did not parse", e))?;
        rows.into_iter().map(EdgeRow::into_record).collect()
    }

    async fn select_vertices(&self, query: &str, params: Vec<(String, Value)>) -> ArborResult<Vec<VertexRecord>> {
        let mut response = self
            .db
            .run(QueryKind::Read, query, params)
            .await
            .map_err(|e| Self::backend_err("vertex query failed", e))?;
        let rows: Vec<VertexRow> = response
            .take(0)
            .map_err(|e| Self::backend_err("vertex rows did not parse", e))?;
        rows.into_iter().map(VertexRow::into_record).collect()
    }
}

#[async_trait]
impl TemporalStore for SurrealTemporalStore {
    async fn add_vertex(&self, vertex: VertexRecord) -> ArborResult<()> {
        let row = VertexRow::from_record(&vertex);
        let uid = row.uid.clone();
        self.db
            .create_with_id("vertex", &uid, row)
            .await
            .map_err(|e| Self::backend_err("failed to create vertex", e))?;
        Ok(())
    }

    async fn get_vertex(&self, id: &Uuid) -> ArborResult<Option<VertexRecord>> {
        let row: Option<VertexRow> = self
            .db
            .select("vertex", &id.to_string())
            .await
            .map_err(|e| Self::backend_err("failed to get vertex", e))?;
        row.map(VertexRow::into_record).transpose()
    }

    async fn update_vertex(&self, vertex: VertexRecord) -> ArborResult<()> {
        let row = VertexRow::from_record(&vertex);
        let uid = row.uid.clone();
        self.db
            .update("vertex", &uid, row)
            .await
            .map_err(|e| Self::backend_err("failed to update vertex", e))?;
        Ok(())
    }

    async fn vertices_with_label(&self, label: &str) -> ArborResult<Vec<VertexRecord>> {
        self.select_vertices(
            "SELECT * FROM vertex WHERE labels CONTAINS $label",
            vec![("label".into(), json!(label))],
        )
        .await
    }

    async fn vertex_by_entity_uuid(&self, label: &str, uuid: &Uuid) -> ArborResult<Option<VertexRecord>> {
        let mut vertices = self
            .select_vertices(
                "SELECT * FROM vertex WHERE labels CONTAINS $label AND properties.uuid = $uuid",
                vec![
                    ("label".into(), json!(label)),
                    ("uuid".into(), json!(uuid.to_string())),
                ],
            )
            .await?;
        Ok(vertices.pop())
    }

    async fn add_edge(&self, edge: EdgeRecord) -> ArborResult<Uuid> {
        let id = edge.id;
        let row = EdgeRow::from_record(&edge);
        let uid = row.uid.clone();
        self.db
            .create_with_id("edge", &uid, row)
            .await
            .map_err(|e| Self::backend_err("failed to create edge", e))?;
        Ok(id)
    }

    async fn get_edge(&self, id: &Uuid) -> ArborResult<Option<EdgeRecord>> {
        let row: Option<EdgeRow> = self
            .db
            .select("edge", &id.to_string())
            .await
            .map_err(|e| Self::backend_err("failed to get edge", e))?;
        row.map(EdgeRow::into_record).transpose()
    }

    async fn close_edges(&self, ids: &[Uuid], at: &Timestamp) -> ArborResult<()> {
        for id in ids {
            self.db
                .run(
                    QueryKind::Write,
                    "UPDATE type::thing('edge', $id) SET `to` = $to WHERE `to` IS NONE",
                    vec![
                        ("id".into(), json!(id.to_string())),
                        ("to".into(), json!(at.to_rfc3339())),
                    ],
                )
                .await
                .map_err(|e| Self::backend_err("failed to close edge", e))?;
        }
        Ok(())
    }

    async fn edges_from(&self, source: &Uuid, labels: Option<&[EdgeLabel]>) -> ArborResult<Vec<EdgeRecord>> {
        match labels {
            Some(labels) => {
                self.select_edges(
                    "SELECT * FROM edge WHERE source = $source AND label IN $labels",
                    vec![
                        ("source".into(), json!(source.to_string())),
                        ("labels".into(), serde_json::to_value(labels)?),
                    ],
                )
                .await
            }
            None => {
                self.select_edges(
                    "SELECT * FROM edge WHERE source = $source",
                    vec![("source".into(), json!(source.to_string()))],
                )
                .await
            }
        }
    }

    async fn edges_to(&self, target: &Uuid, labels: Option<&[EdgeLabel]>) -> ArborResult<Vec<EdgeRecord>> {
        match labels {
            Some(labels) => {
                self.select_edges(
                    "SELECT * FROM edge WHERE target = $target AND label IN $labels",
                    vec![
                        ("target".into(), json!(target.to_string())),
                        ("labels".into(), serde_json::to_value(labels)?),
                    ],
                )
                .await
            }
            None => {
                self.select_edges(
                    "SELECT * FROM edge WHERE target = $target",
                    vec![("target".into(), json!(target.to_string()))],
                )
                .await
            }
        }
    }

    async fn edges_in_window(
        &self,
        labels: &[EdgeLabel],
        branches: &[String],
        window_from: &Timestamp,
    ) -> ArborResult<Vec<EdgeRecord>> {
        self.select_edges(
            "SELECT * FROM edge WHERE label IN $labels AND branch IN $branches \
             AND (`from` >= $window OR (`to` IS NOT NONE AND `to` <= $window))",
            vec![
                ("labels".into(), serde_json::to_value(labels)?),
                ("branches".into(), serde_json::to_value(branches)?),
                ("window".into(), json!(window_from.to_rfc3339())),
            ],
        )
        .await
    }

    async fn begin(&self) -> ArborResult<()> {
        let mut open = self.in_transaction.lock().await;
        if *open {
            return Err(ArborError::Transaction("transaction already in progress".into()));
        }
        self.db
            .begin_transaction()
            .await
            .map_err(|e| ArborError::Transaction(format!("failed to begin: {}", e)))?;
        *open = true;
        Ok(())
    }

    async fn commit(&self) -> ArborResult<()> {
        let mut open = self.in_transaction.lock().await;
        if !*open {
            return Err(ArborError::Transaction("no transaction in progress".into()));
        }
        *open = false;
        self.db
            .commit_transaction()
            .await
            .map_err(|e| ArborError::Transaction(format!("failed to commit: {}", e)))
    }

    async fn cancel(&self) -> ArborResult<()> {
        let mut open = self.in_transaction.lock().await;
        if !*open {
            return Err(ArborError::Transaction("no transaction in progress".into()));
        }
        *open = false;
        self.db
            .cancel_transaction()
            .await
            .map_err(|e| ArborError::Transaction(format!("failed to cancel: {}", e)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::edge::vertex_labels;

    async fn two_vertices(store: &InMemoryTemporalStore) -> (Uuid, Uuid) {
        let a = VertexRecord::new(vec![vertex_labels::NODE.to_string()]);
        let b = VertexRecord::new(vec![vertex_labels::BRANCH.to_string()]);
        let (ida, idb) = (a.id, b.id);
        store.add_vertex(a).await.unwrap();
        store.add_vertex(b).await.unwrap();
        (ida, idb)
    }

    #[tokio::test]
    async fn test_add_edge_requires_endpoints() {
        let store = InMemoryTemporalStore::new();
        let edge = EdgeRecord::new(
            EdgeLabel::IsPartOf,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "main",
            1,
            Timestamp::now(),
            EdgeStatus::Active,
        );
        assert!(store.add_edge(edge).await.is_err());
    }

    #[tokio::test]
    async fn test_close_edges_is_idempotent() {
        let store = InMemoryTemporalStore::new();
        let (a, b) = two_vertices(&store).await;
        let t0 = Timestamp::now();
        let edge = EdgeRecord::new(EdgeLabel::IsPartOf, a, b, "main", 1, t0, EdgeStatus::Active);
        let id = store.add_edge(edge).await.unwrap();

        let close_at = t0.add_micros(10);
        store.close_edges(&[id], &close_at).await.unwrap();
        // A second close at a later time must not move the interval end.
        store.close_edges(&[id], &close_at.add_micros(50)).await.unwrap();

        let closed = store.get_edge(&id).await.unwrap().unwrap();
        assert_eq!(closed.to, Some(close_at));
    }

    #[tokio::test]
    async fn test_edges_in_window() {
        let store = InMemoryTemporalStore::new();
        let (a, b) = two_vertices(&store).await;
        let t0 = Timestamp::now();

        // Old edge, still open: outside the window.
        let old = EdgeRecord::new(EdgeLabel::IsPartOf, a, b, "main", 1, t0.add_micros(-100), EdgeStatus::Active);
        let old_id = store.add_edge(old).await.unwrap();

        // Edge created inside the window.
        let fresh = EdgeRecord::new(EdgeLabel::IsPartOf, a, b, "change-dc1", 2, t0.add_micros(5), EdgeStatus::Active);
        store.add_edge(fresh).await.unwrap();

        let branches = vec!["main".to_string(), "change-dc1".to_string()];
        let hits = store
            .edges_in_window(&[EdgeLabel::IsPartOf], &branches, &t0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].branch, "change-dc1");

        // Closing the old edge before the window start brings it into scope.
        store.close_edges(&[old_id], &t0.add_micros(-10)).await.unwrap();
        let hits = store
            .edges_in_window(&[EdgeLabel::IsPartOf], &branches, &t0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_transaction_cancel_restores_state() {
        let store = InMemoryTemporalStore::new();
        let (a, b) = two_vertices(&store).await;

        store.begin().await.unwrap();
        // One transaction at a time; overlap is an error on every backend.
        assert!(store.begin().await.is_err());
        let edge = EdgeRecord::new(EdgeLabel::IsPartOf, a, b, "main", 1, Timestamp::now(), EdgeStatus::Active);
        store.add_edge(edge).await.unwrap();
        assert_eq!(store.edge_count().await, 1);
        store.cancel().await.unwrap();
        assert_eq!(store.edge_count().await, 0);
        assert!(store.cancel().await.is_err());

        store.begin().await.unwrap();
        let edge = EdgeRecord::new(EdgeLabel::IsPartOf, a, b, "main", 1, Timestamp::now(), EdgeStatus::Active);
        store.add_edge(edge).await.unwrap();
        store.commit().await.unwrap();
        assert_eq!(store.edge_count().await, 1);
    }

    #[tokio::test]
    async fn test_vertex_by_entity_uuid() {
        let store = InMemoryTemporalStore::new();
        let uuid = Uuid::new_v4();
        let vertex = VertexRecord::new(vec![vertex_labels::NODE.to_string(), "Person".to_string()])
            .with_property("uuid", json!(uuid.to_string()));
        store.add_vertex(vertex).await.unwrap();

        let found = store
            .vertex_by_entity_uuid(vertex_labels::NODE, &uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.entity_uuid(), Some(uuid));
        assert!(store
            .vertex_by_entity_uuid(vertex_labels::NODE, &Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }
}
