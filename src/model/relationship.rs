use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{ArborError, ArborResult, ValidationError};
use crate::model::branch::{Branch, GLOBAL_BRANCH_NAME};
use crate::model::edge::{vertex_labels, EdgeLabel, EdgeStatus, VertexRecord};
use crate::model::timestamp::Timestamp;
use crate::schema::{BranchSupport, RelationshipSchema};
use crate::store::graph::TemporalStore;
use crate::store::manager::RelationshipRow;
use crate::store::{add_relationship, close_relationships};

// ---------------------------------------------------------------------------
// Relationship: a first-class vertex joined to its endpoints by IS_RELATED
// ---------------------------------------------------------------------------

/// A relationship between two nodes. Modeled as a vertex rather than a bare
/// edge so the four property edges carry their own validity independently
/// and traversal is symmetric from either endpoint.
#[derive(Debug, Clone)]
pub struct Relationship {
    /// Stable uuid of the Relationship vertex.
    pub uuid: Uuid,
    pub db_id: Option<Uuid>,
    /// The relationship identifier stored on the vertex.
    pub name: String,
    pub schema: RelationshipSchema,
    /// Owning node, by stable uuid.
    pub node_uuid: Uuid,
    pub node_db_id: Option<Uuid>,
    /// Peer node, by stable uuid.
    pub peer_uuid: Uuid,
    pub peer_db_id: Option<Uuid>,
    pub is_visible: bool,
    pub is_protected: bool,
    pub source_id: Option<Uuid>,
    pub owner_id: Option<Uuid>,
    pub updated_at: Option<Timestamp>,
}

impl Relationship {
    /// Build a relationship from caller input: either a bare peer id or an
    /// extended form `{"id": .., "is_visible": .., "is_protected": ..,
    /// "source": .., "owner": ..}`.
    pub fn new(schema: &RelationshipSchema, node_uuid: Uuid, input: &Value) -> Result<Self, ValidationError> {
        let mut is_visible = true;
        let mut is_protected = false;
        let mut source_id = None;
        let mut owner_id = None;

        let peer_uuid = match input {
            Value::String(s) => Uuid::parse_str(s).ok(),
            Value::Object(map) => {
                if let Some(v) = map.get("is_visible").and_then(Value::as_bool) {
                    is_visible = v;
                }
                if let Some(v) = map.get("is_protected").and_then(Value::as_bool) {
                    is_protected = v;
                }
                source_id = map.get("source").and_then(parse_uuid_value);
                owner_id = map.get("owner").and_then(parse_uuid_value);
                map.get("id").and_then(parse_uuid_value)
            }
            _ => None,
        };

        let peer_uuid = peer_uuid.ok_or_else(|| {
            ValidationError::single(&schema.name, "a peer id is required for a relationship")
        })?;

        Ok(Self {
            uuid: Uuid::new_v4(),
            db_id: None,
            name: schema.identifier.clone(),
            schema: schema.clone(),
            node_uuid,
            node_db_id: None,
            peer_uuid,
            peer_db_id: None,
            is_visible,
            is_protected,
            source_id,
            owner_id,
            updated_at: None,
        })
    }

    pub fn effective_branch(&self, branch: &Branch) -> (String, u8) {
        match self.schema.branch {
            BranchSupport::Agnostic => (GLOBAL_BRANCH_NAME.to_string(), 1),
            BranchSupport::Aware => (branch.name.clone(), branch.hierarchy_level),
        }
    }

    /// Create the Relationship vertex, both endpoint edges, and the flag
    /// property edges.
    pub async fn create(
        &mut self,
        store: &dyn TemporalStore,
        branch: &Branch,
        at: Timestamp,
    ) -> ArborResult<()> {
        let node_db_id = self
            .node_db_id
            .ok_or_else(|| ArborError::Internal("relationship created before its node".into()))?;
        let peer = store
            .vertex_by_entity_uuid(vertex_labels::NODE, &self.peer_uuid)
            .await?
            .ok_or(ArborError::NodeNotFound(self.peer_uuid))?;
        self.peer_db_id = Some(peer.id);

        let (branch_name, branch_level) = self.effective_branch(branch);

        let rel_vertex = VertexRecord::new(vec![vertex_labels::RELATIONSHIP.to_string()])
            .with_property("uuid", json!(self.uuid.to_string()))
            .with_property("name", json!(self.name));
        let rel_db_id = rel_vertex.id;
        store.add_vertex(rel_vertex).await?;
        self.db_id = Some(rel_db_id);

        // Endpoint edges point into the Relationship vertex from both sides.
        add_relationship(store, node_db_id, rel_db_id, EdgeLabel::IsRelated, &branch_name, branch_level, at, EdgeStatus::Active)
            .await?;
        add_relationship(store, peer.id, rel_db_id, EdgeLabel::IsRelated, &branch_name, branch_level, at, EdgeStatus::Active)
            .await?;

        self.append_value_edge(store, EdgeLabel::IsVisible, json!(self.is_visible), &branch_name, branch_level, at)
            .await?;
        self.append_value_edge(store, EdgeLabel::IsProtected, json!(self.is_protected), &branch_name, branch_level, at)
            .await?;

        if let Some(source) = self.source_id {
            self.append_peer_edge(store, EdgeLabel::HasSource, source, &branch_name, branch_level, at)
                .await?;
        }
        if let Some(owner) = self.owner_id {
            self.append_peer_edge(store, EdgeLabel::HasOwner, owner, &branch_name, branch_level, at)
                .await?;
        }

        self.updated_at = Some(at);
        Ok(())
    }

    /// Update the relationship's properties against the currently visible
    /// state, following the same append-and-close discipline as attributes.
    pub async fn save(
        &mut self,
        store: &dyn TemporalStore,
        branch: &Branch,
        current: &RelationshipRow,
        at: Timestamp,
    ) -> ArborResult<()> {
        let (branch_name, branch_level) = self.effective_branch(branch);
        self.db_id = Some(current.rel_vertex.id);

        let flags = [
            (EdgeLabel::IsVisible, self.is_visible),
            (EdgeLabel::IsProtected, self.is_protected),
        ];
        for (label, desired) in flags {
            if let Some(slot) = current.properties.get(&label) {
                let stored = slot.vertex.property("value").and_then(Value::as_bool);
                if stored != Some(desired) {
                    self.append_value_edge(store, label, json!(desired), &branch_name, branch_level, at)
                        .await?;
                    if slot.edge.branch == branch_name {
                        close_relationships(store, &[slot.edge.id], at).await?;
                    }
                }
            }
        }

        let peers = [
            (EdgeLabel::HasSource, self.source_id),
            (EdgeLabel::HasOwner, self.owner_id),
        ];
        for (label, desired) in peers {
            let Some(desired) = desired else { continue };
            let current_peer = current
                .properties
                .get(&label)
                .and_then(|slot| slot.vertex.entity_uuid());
            if current_peer != Some(desired) {
                self.append_peer_edge(store, label, desired, &branch_name, branch_level, at)
                    .await?;
                if let Some(slot) = current.properties.get(&label) {
                    if slot.edge.branch == branch_name {
                        close_relationships(store, &[slot.edge.id], at).await?;
                    }
                }
            }
        }

        self.updated_at = Some(at);
        Ok(())
    }

    /// Logical delete: DELETED endpoint edges plus DELETED property edges,
    /// closing the superseded same-branch intervals.
    pub async fn delete(
        &mut self,
        store: &dyn TemporalStore,
        branch: &Branch,
        current: &RelationshipRow,
        at: Timestamp,
    ) -> ArborResult<()> {
        let (branch_name, branch_level) = self.effective_branch(branch);
        let rel_db_id = current.rel_vertex.id;
        let mut to_close = Vec::new();

        add_relationship(
            store,
            current.node_edge.source,
            rel_db_id,
            EdgeLabel::IsRelated,
            &branch_name,
            branch_level,
            at,
            EdgeStatus::Deleted,
        )
        .await?;
        add_relationship(
            store,
            current.peer_edge.source,
            rel_db_id,
            EdgeLabel::IsRelated,
            &branch_name,
            branch_level,
            at,
            EdgeStatus::Deleted,
        )
        .await?;
        if current.node_edge.branch == branch_name {
            to_close.push(current.node_edge.id);
        }
        if current.peer_edge.branch == branch_name {
            to_close.push(current.peer_edge.id);
        }

        for slot in current.properties.values() {
            add_relationship(
                store,
                rel_db_id,
                slot.vertex.id,
                slot.edge.label,
                &branch_name,
                branch_level,
                at,
                EdgeStatus::Deleted,
            )
            .await?;
            if slot.edge.branch == branch_name {
                to_close.push(slot.edge.id);
            }
        }

        if !to_close.is_empty() {
            close_relationships(store, &to_close, at).await?;
        }

        self.updated_at = Some(at);
        Ok(())
    }

    async fn append_value_edge(
        &self,
        store: &dyn TemporalStore,
        label: EdgeLabel,
        value: Value,
        branch_name: &str,
        branch_level: u8,
        at: Timestamp,
    ) -> ArborResult<()> {
        let rel_db_id = self
            .db_id
            .ok_or_else(|| ArborError::Internal("relationship has no storage id".into()))?;
        let value_vertex = VertexRecord::new(vec![vertex_labels::ATTRIBUTE_VALUE.to_string()])
            .with_property("value", value);
        let value_db_id = value_vertex.id;
        store.add_vertex(value_vertex).await?;
        add_relationship(store, rel_db_id, value_db_id, label, branch_name, branch_level, at, EdgeStatus::Active)
            .await?;
        Ok(())
    }

    async fn append_peer_edge(
        &self,
        store: &dyn TemporalStore,
        label: EdgeLabel,
        peer_uuid: Uuid,
        branch_name: &str,
        branch_level: u8,
        at: Timestamp,
    ) -> ArborResult<()> {
        let rel_db_id = self
            .db_id
            .ok_or_else(|| ArborError::Internal("relationship has no storage id".into()))?;
        let peer = store
            .vertex_by_entity_uuid(vertex_labels::NODE, &peer_uuid)
            .await?
            .ok_or(ArborError::NodeNotFound(peer_uuid))?;
        add_relationship(store, rel_db_id, peer.id, label, branch_name, branch_level, at, EdgeStatus::Active)
            .await?;
        Ok(())
    }

    pub fn to_view(&self) -> Value {
        json!({
            "id": self.uuid.to_string(),
            "peer": self.peer_uuid.to_string(),
            "is_visible": self.is_visible,
            "is_protected": self.is_protected,
            "source": self.source_id.map(|id| id.to_string()),
            "owner": self.owner_id.map(|id| id.to_string()),
        })
    }
}

fn parse_uuid_value(value: &Value) -> Option<Uuid> {
    match value {
        Value::String(s) => Uuid::parse_str(s).ok(),
        Value::Object(map) => map.get("id").and_then(parse_uuid_value),
        _ => None,
    }
}

/// Hydrate a relationship from a stored row, oriented so that `node_uuid`
/// is the reading side.
pub fn relationship_from_row(
    schema: &RelationshipSchema,
    node_uuid: Uuid,
    row: &RelationshipRow,
) -> Relationship {
    let mut relationship = Relationship {
        uuid: row.rel_vertex.entity_uuid().unwrap_or_else(Uuid::new_v4),
        db_id: Some(row.rel_vertex.id),
        name: schema.identifier.clone(),
        schema: schema.clone(),
        node_uuid,
        node_db_id: Some(row.node_edge.source),
        peer_uuid: row.peer_vertex.entity_uuid().unwrap_or_else(Uuid::new_v4),
        peer_db_id: Some(row.peer_vertex.id),
        is_visible: true,
        is_protected: false,
        source_id: None,
        owner_id: None,
        updated_at: Some(row.node_edge.from),
    };

    if let Some(slot) = row.properties.get(&EdgeLabel::IsVisible) {
        if let Some(flag) = slot.vertex.property("value").and_then(Value::as_bool) {
            relationship.is_visible = flag;
        }
    }
    if let Some(slot) = row.properties.get(&EdgeLabel::IsProtected) {
        if let Some(flag) = slot.vertex.property("value").and_then(Value::as_bool) {
            relationship.is_protected = flag;
        }
    }
    relationship.source_id = row
        .properties
        .get(&EdgeLabel::HasSource)
        .and_then(|slot| slot.vertex.entity_uuid());
    relationship.owner_id = row
        .properties
        .get(&EdgeLabel::HasOwner)
        .and_then(|slot| slot.vertex.entity_uuid());

    relationship
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
