use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ArborError, ArborResult};
use crate::model::attribute::attribute_from_row;
use crate::model::branch::{Branch, BranchFilter};
use crate::model::edge::{vertex_labels, EdgeLabel, EdgeRecord, VertexRecord};
use crate::model::node::Node;
use crate::model::relationship::relationship_from_row;
use crate::model::timestamp::Timestamp;
use crate::registry::Registry;
use crate::schema::BranchSupport;
use crate::store::graph::TemporalStore;

/// Bounded parallelism for materializing result sets.
const DEFAULT_FAN_OUT: usize = 8;

// ---------------------------------------------------------------------------
// Row types shared by the read path and the diff engine
// ---------------------------------------------------------------------------

/// A winning property edge and the vertex it points to.
#[derive(Debug, Clone)]
pub struct PropertySlot {
    pub edge: EdgeRecord,
    pub vertex: VertexRecord,
}

/// The visible state of one attribute of one node: the attribute vertex, the
/// winning HAS_ATTRIBUTE edge, and the winning edge per property kind.
#[derive(Debug, Clone)]
pub struct AttributeRow {
    pub node_db_id: Uuid,
    pub node_uuid: Uuid,
    pub node_labels: Vec<String>,
    pub attr_vertex: VertexRecord,
    pub attr_name: String,
    pub has_attribute: EdgeRecord,
    pub properties: HashMap<EdgeLabel, PropertySlot>,
}

/// The visible state of one relationship seen from one endpoint.
#[derive(Debug, Clone)]
pub struct RelationshipRow {
    pub rel_vertex: VertexRecord,
    /// IS_RELATED edge from the reading node into the Relationship vertex.
    pub node_edge: EdgeRecord,
    /// IS_RELATED edge from the peer into the Relationship vertex.
    pub peer_edge: EdgeRecord,
    pub peer_vertex: VertexRecord,
    pub properties: HashMap<EdgeLabel, PropertySlot>,
}

/// A node vertex together with its winning IS_PART_OF anchor.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub vertex: VertexRecord,
    pub is_part_of: EdgeRecord,
}

/// Options for read operations.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Read time; defaults to now.
    pub at: Option<Timestamp>,
    /// Restrict hydration to these attribute/relationship names.
    pub fields: Option<Vec<String>>,
    /// Deadline for the whole read; exceeded deadlines fail with Timeout.
    pub deadline: Option<Duration>,
}

impl QueryOptions {
    pub fn at(at: Timestamp) -> Self {
        Self {
            at: Some(at),
            ..Default::default()
        }
    }

    /// Options with the configured read deadline applied.
    pub fn bounded(settings: &crate::config::MainSettings) -> Self {
        Self {
            deadline: Some(settings.query_timeout()),
            ..Default::default()
        }
    }

    fn wants(&self, name: &str) -> bool {
        self.fields
            .as_ref()
            .map_or(true, |fields| fields.iter().any(|f| f == name))
    }
}

// ---------------------------------------------------------------------------
// NodeManager: loads, queries, and persists entities through the store
// ---------------------------------------------------------------------------

/// The read side of the entity layer. All reads resolve visibility through
/// `BranchFilter`; the manager only composes filter decisions with store
/// scans.
pub struct NodeManager<'a> {
    store: &'a dyn TemporalStore,
    registry: &'a Registry,
    fan_out: usize,
}

impl<'a> NodeManager<'a> {
    pub fn new(store: &'a dyn TemporalStore, registry: &'a Registry) -> Self {
        Self {
            store,
            registry,
            fan_out: DEFAULT_FAN_OUT,
        }
    }

    /// A manager with the configured fan-out limit for client-facing reads.
    pub fn from_config(
        store: &'a dyn TemporalStore,
        registry: &'a Registry,
        settings: &crate::config::MainSettings,
    ) -> Self {
        Self::new(store, registry).with_fan_out(settings.concurrent_queries)
    }

    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out.max(1);
        self
    }

    // -----------------------------------------------------------------------
    // Public reads
    // -----------------------------------------------------------------------

    /// Load one node by uuid at a branch; `None` when the node is not
    /// visible from `(branch, at)`.
    pub async fn get_one(
        &self,
        uuid: Uuid,
        branch: &Branch,
        options: &QueryOptions,
    ) -> ArborResult<Option<Node>> {
        match options.deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.get_one_inner(uuid, branch, options))
                .await
                .map_err(|_| ArborError::Timeout(deadline))?,
            None => self.get_one_inner(uuid, branch, options).await,
        }
    }

    async fn get_one_inner(
        &self,
        uuid: Uuid,
        branch: &Branch,
        options: &QueryOptions,
    ) -> ArborResult<Option<Node>> {
        let Some(vertex) = self
            .store
            .vertex_by_entity_uuid(vertex_labels::NODE, &uuid)
            .await?
        else {
            return Ok(None);
        };
        self.load_node(vertex, branch, options).await
    }

    /// Load several nodes concurrently, bounded by the fan-out limit.
    pub async fn get_many(
        &self,
        uuids: &[Uuid],
        branch: &Branch,
        options: &QueryOptions,
    ) -> ArborResult<Vec<Node>> {
        let results: Vec<ArborResult<Option<Node>>> = stream::iter(uuids.iter().copied())
            .map(|uuid| self.get_one_inner(uuid, branch, options))
            .buffer_unordered(self.fan_out)
            .collect()
            .await;

        let mut nodes = Vec::new();
        for result in results {
            if let Some(node) = result? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// Query all visible nodes of a kind, with optional attribute-value
    /// equality filters keyed by attribute name.
    pub async fn query(
        &self,
        kind: &str,
        filters: Option<&HashMap<String, Value>>,
        branch: &Branch,
        options: &QueryOptions,
    ) -> ArborResult<Vec<Node>> {
        match options.deadline {
            Some(deadline) => {
                tokio::time::timeout(deadline, self.query_inner(kind, filters, branch, options))
                    .await
                    .map_err(|_| ArborError::Timeout(deadline))?
            }
            None => self.query_inner(kind, filters, branch, options).await,
        }
    }

    async fn query_inner(
        &self,
        kind: &str,
        filters: Option<&HashMap<String, Value>>,
        branch: &Branch,
        options: &QueryOptions,
    ) -> ArborResult<Vec<Node>> {
        let vertices = self.store.vertices_with_label(kind).await?;

        let results: Vec<ArborResult<Option<Node>>> = stream::iter(vertices)
            .map(|vertex| self.load_node(vertex, branch, options))
            .buffer_unordered(self.fan_out)
            .collect()
            .await;

        let mut nodes = Vec::new();
        for result in results {
            let Some(node) = result? else { continue };
            let matches = filters.map_or(true, |wanted| {
                wanted
                    .iter()
                    .all(|(name, value)| node.value(name) == Some(value))
            });
            if matches {
                nodes.push(node);
            }
        }
        nodes.sort_by_key(|n| n.uuid);
        Ok(nodes)
    }

    /// Hydrate a node from its vertex if it is visible from `(branch, at)`.
    async fn load_node(
        &self,
        vertex: VertexRecord,
        branch: &Branch,
        options: &QueryOptions,
    ) -> ArborResult<Option<Node>> {
        let at = Timestamp::or_now(options.at);
        let Some(kind) = vertex.property_str("kind").map(str::to_string) else {
            return Ok(None);
        };
        let schema = self.registry.schema_for(&kind, &branch.name).await?;

        // Branch-agnostic entities live on the global branch; their reads use
        // the global filter regardless of the requested branch.
        let filter = match schema.branch {
            BranchSupport::Agnostic => self.registry.global_branch_record()?.filter_at(at),
            BranchSupport::Aware => branch.filter_at(at),
        };

        let anchors = self.store.edges_from(&vertex.id, Some(&[EdgeLabel::IsPartOf])).await?;
        let candidates: Vec<&EdgeRecord> = anchors.iter().collect();
        let Some(anchor) = filter.pick_active(&candidates) else {
            return Ok(None);
        };

        let uuid = vertex
            .entity_uuid()
            .ok_or_else(|| ArborError::Integrity(format!("node vertex {} has no uuid", vertex.id)))?;

        let mut attributes = BTreeMap::new();
        for row in self.attribute_rows(&[vertex.id], &filter).await? {
            if !options.wants(&row.attr_name) {
                continue;
            }
            let Some(attr_schema) = schema.get_attribute(&row.attr_name) else {
                continue;
            };
            let attribute = attribute_from_row(attr_schema, &row)?;
            attributes.insert(row.attr_name.clone(), attribute);
        }

        let updated_at = Some(anchor.from);
        let mut node = Node::hydrate(
            schema.clone(),
            branch.clone(),
            uuid,
            vertex.id,
            attributes,
            BTreeMap::new(),
            updated_at,
        );

        for row in self.relationship_rows(vertex.id, &filter).await? {
            let Some(rel_name) = row.rel_vertex.property_str("name") else {
                continue;
            };
            let Some(rel_schema) = schema
                .relationships
                .iter()
                .find(|r| r.identifier == rel_name)
            else {
                continue;
            };
            if !options.wants(&rel_schema.name) {
                continue;
            }
            let relationship = relationship_from_row(rel_schema, uuid, &row);
            node.insert_relationship(&rel_schema.name.clone(), relationship);
        }

        Ok(Some(node))
    }

    // -----------------------------------------------------------------------
    // Row readers, shared with the entity save path and the diff engine
    // -----------------------------------------------------------------------

    /// The visible attribute state of the given node vertices.
    pub async fn attribute_rows(
        &self,
        node_db_ids: &[Uuid],
        filter: &BranchFilter,
    ) -> ArborResult<Vec<AttributeRow>> {
        let mut rows = Vec::new();

        for node_db_id in node_db_ids {
            let Some(node_vertex) = self.store.get_vertex(node_db_id).await? else {
                continue;
            };
            let node_uuid = node_vertex
                .entity_uuid()
                .ok_or_else(|| ArborError::Integrity(format!("node vertex {} has no uuid", node_db_id)))?;

            let has_attr_edges = self
                .store
                .edges_from(node_db_id, Some(&[EdgeLabel::HasAttribute]))
                .await?;

            // Group candidates per attribute vertex and resolve each cell.
            let mut per_attr: HashMap<Uuid, Vec<&EdgeRecord>> = HashMap::new();
            for edge in &has_attr_edges {
                per_attr.entry(edge.target).or_default().push(edge);
            }

            for (attr_db_id, candidates) in per_attr {
                let Some(winner) = filter.pick_active(&candidates) else {
                    continue;
                };
                let Some(attr_vertex) = self.store.get_vertex(&attr_db_id).await? else {
                    continue;
                };
                let attr_name = attr_vertex
                    .property_str("name")
                    .unwrap_or_default()
                    .to_string();

                let mut properties = HashMap::new();
                for label in EdgeLabel::ATTRIBUTE_PROPERTIES {
                    let edges = self.store.edges_from(&attr_db_id, Some(&[label])).await?;
                    let candidates: Vec<&EdgeRecord> = edges.iter().collect();
                    if let Some(edge) = filter.pick_active(&candidates) {
                        if let Some(vertex) = self.store.get_vertex(&edge.target).await? {
                            properties.insert(label, PropertySlot { edge: edge.clone(), vertex });
                        }
                    }
                }

                rows.push(AttributeRow {
                    node_db_id: *node_db_id,
                    node_uuid,
                    node_labels: node_vertex.labels.clone(),
                    attr_vertex,
                    attr_name,
                    has_attribute: winner.clone(),
                    properties,
                });
            }
        }

        Ok(rows)
    }

    /// Attribute rows keyed by node uuid rather than storage id.
    pub async fn attribute_rows_by_node_uuid(
        &self,
        node_uuids: &[Uuid],
        filter: &BranchFilter,
    ) -> ArborResult<Vec<AttributeRow>> {
        let mut db_ids = Vec::new();
        for uuid in node_uuids {
            if let Some(vertex) = self
                .store
                .vertex_by_entity_uuid(vertex_labels::NODE, uuid)
                .await?
            {
                db_ids.push(vertex.id);
            }
        }
        self.attribute_rows(&db_ids, filter).await
    }

    /// The visible relationships of one node vertex.
    pub async fn relationship_rows(
        &self,
        node_db_id: Uuid,
        filter: &BranchFilter,
    ) -> ArborResult<Vec<RelationshipRow>> {
        let own_edges = self
            .store
            .edges_from(&node_db_id, Some(&[EdgeLabel::IsRelated]))
            .await?;

        let mut per_rel: HashMap<Uuid, Vec<&EdgeRecord>> = HashMap::new();
        for edge in &own_edges {
            per_rel.entry(edge.target).or_default().push(edge);
        }

        let mut rows = Vec::new();
        for (rel_db_id, candidates) in per_rel {
            let Some(node_edge) = filter.pick_active(&candidates) else {
                continue;
            };
            let Some(rel_vertex) = self.store.get_vertex(&rel_db_id).await? else {
                continue;
            };

            let endpoint_edges = self
                .store
                .edges_to(&rel_db_id, Some(&[EdgeLabel::IsRelated]))
                .await?;
            let peer_candidates: Vec<&EdgeRecord> = endpoint_edges
                .iter()
                .filter(|edge| edge.source != node_db_id)
                .collect();
            let Some(peer_edge) = filter.pick_active(&peer_candidates) else {
                continue;
            };
            let Some(peer_vertex) = self.store.get_vertex(&peer_edge.source).await? else {
                continue;
            };

            let mut properties = HashMap::new();
            for label in EdgeLabel::RELATIONSHIP_PROPERTIES {
                let edges = self.store.edges_from(&rel_db_id, Some(&[label])).await?;
                let candidates: Vec<&EdgeRecord> = edges.iter().collect();
                if let Some(edge) = filter.pick_active(&candidates) {
                    if let Some(vertex) = self.store.get_vertex(&edge.target).await? {
                        properties.insert(label, PropertySlot { edge: edge.clone(), vertex });
                    }
                }
            }

            rows.push(RelationshipRow {
                rel_vertex,
                node_edge: node_edge.clone(),
                peer_edge: peer_edge.clone(),
                peer_vertex,
                properties,
            });
        }

        Ok(rows)
    }

    /// The winning property edge per kind for the given relationship
    /// vertices; used by the diff to join origin-branch values.
    pub async fn relationship_property_edges(
        &self,
        rel_uuids: &[Uuid],
        filter: &BranchFilter,
    ) -> ArborResult<HashMap<(Uuid, EdgeLabel), EdgeRecord>> {
        let mut out = HashMap::new();
        for rel_uuid in rel_uuids {
            let Some(rel_vertex) = self
                .store
                .vertex_by_entity_uuid(vertex_labels::RELATIONSHIP, rel_uuid)
                .await?
            else {
                continue;
            };
            for label in EdgeLabel::RELATIONSHIP_PROPERTIES {
                let edges = self.store.edges_from(&rel_vertex.id, Some(&[label])).await?;
                let candidates: Vec<&EdgeRecord> = edges.iter().collect();
                if let Some(edge) = filter.pick_active(&candidates) {
                    out.insert((*rel_uuid, label), edge.clone());
                }
            }
        }
        Ok(out)
    }

    /// Node vertices plus their winning IS_PART_OF anchor; used by the merge
    /// to locate the origin edges a change supersedes.
    pub async fn node_info(
        &self,
        node_uuids: &[Uuid],
        filter: &BranchFilter,
    ) -> ArborResult<HashMap<Uuid, NodeInfo>> {
        let mut out = HashMap::new();
        for uuid in node_uuids {
            let Some(vertex) = self
                .store
                .vertex_by_entity_uuid(vertex_labels::NODE, uuid)
                .await?
            else {
                continue;
            };
            let anchors = self.store.edges_from(&vertex.id, Some(&[EdgeLabel::IsPartOf])).await?;
            let candidates: Vec<&EdgeRecord> = anchors.iter().collect();
            if let Some(anchor) = filter.pick_active(&candidates) {
                out.insert(
                    *uuid,
                    NodeInfo {
                        vertex,
                        is_part_of: anchor.clone(),
                    },
                );
            }
        }
        Ok(out)
    }
}
