use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::model::timestamp::Timestamp;

// ---------------------------------------------------------------------------
// Edge labels: the only edge types reserved by the core
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeLabel {
    /// Anchors a Node vertex to a Branch vertex.
    IsPartOf,
    /// Joins a Node vertex to one of its Attribute vertices.
    HasAttribute,
    /// Joins an Attribute vertex to its current AttributeValue vertex.
    HasValue,
    /// Flag property: visibility of an attribute or relationship.
    IsVisible,
    /// Flag property: protection of an attribute or relationship.
    IsProtected,
    /// Node property: the account or node a value originated from.
    HasSource,
    /// Node property: the account or node owning a value.
    HasOwner,
    /// Joins a Relationship vertex to one of its two endpoint nodes.
    IsRelated,
}

impl EdgeLabel {
    /// The five property edges hanging off an Attribute vertex.
    pub const ATTRIBUTE_PROPERTIES: [EdgeLabel; 5] = [
        EdgeLabel::HasValue,
        EdgeLabel::IsVisible,
        EdgeLabel::IsProtected,
        EdgeLabel::HasSource,
        EdgeLabel::HasOwner,
    ];

    /// The four property edges hanging off a Relationship vertex.
    pub const RELATIONSHIP_PROPERTIES: [EdgeLabel; 4] = [
        EdgeLabel::IsVisible,
        EdgeLabel::IsProtected,
        EdgeLabel::HasSource,
        EdgeLabel::HasOwner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeLabel::IsPartOf => "IS_PART_OF",
            EdgeLabel::HasAttribute => "HAS_ATTRIBUTE",
            EdgeLabel::HasValue => "HAS_VALUE",
            EdgeLabel::IsVisible => "IS_VISIBLE",
            EdgeLabel::IsProtected => "IS_PROTECTED",
            EdgeLabel::HasSource => "HAS_SOURCE",
            EdgeLabel::HasOwner => "HAS_OWNER",
            EdgeLabel::IsRelated => "IS_RELATED",
        }
    }
}

impl fmt::Display for EdgeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Edge status: logical removal preserves history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeStatus {
    Active,
    Deleted,
}

// ---------------------------------------------------------------------------
// EdgeRecord: a labeled edge with branch + validity metadata
// ---------------------------------------------------------------------------

/// A single edge in the temporal store. Edges are append-only: the only
/// permitted mutation is closing an open validity interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Storage identifier of the edge.
    pub id: Uuid,
    pub label: EdgeLabel,
    /// Vertex the edge leaves from.
    pub source: Uuid,
    /// Vertex the edge points to.
    pub target: Uuid,
    /// Branch this edge belongs to.
    pub branch: String,
    /// Start of the validity interval.
    pub from: Timestamp,
    /// End of the validity interval; `None` means open-ended.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to: Option<Timestamp>,
    pub status: EdgeStatus,
    pub hierarchy_level: u8,
}

impl EdgeRecord {
    /// A fresh ACTIVE edge open from `at`.
    pub fn new(
        label: EdgeLabel,
        source: Uuid,
        target: Uuid,
        branch: impl Into<String>,
        hierarchy_level: u8,
        at: Timestamp,
        status: EdgeStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            label,
            source,
            target,
            branch: branch.into(),
            from: at,
            to: None,
            status,
            hierarchy_level,
        }
    }

    /// Whether the validity interval contains `at`.
    pub fn interval_contains(&self, at: &Timestamp) -> bool {
        self.from <= *at && self.to.map_or(true, |to| to >= *at)
    }

    pub fn is_open(&self) -> bool {
        self.to.is_none()
    }
}

// ---------------------------------------------------------------------------
// VertexRecord: a labeled vertex with a free-form property bag
// ---------------------------------------------------------------------------

/// Vertex labels used by the core.
pub mod vertex_labels {
    pub const NODE: &str = "Node";
    pub const ATTRIBUTE: &str = "Attribute";
    pub const ATTRIBUTE_VALUE: &str = "AttributeValue";
    pub const RELATIONSHIP: &str = "Relationship";
    pub const BRANCH: &str = "Branch";
    pub const ROOT: &str = "Root";
}

/// A vertex in the temporal store. Nodes carry `Node` plus a per-kind label;
/// all other entities carry exactly one label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexRecord {
    /// Storage identifier (`db_id` at the entity layer).
    pub id: Uuid,
    pub labels: Vec<String>,
    pub properties: Map<String, Value>,
}

impl VertexRecord {
    pub fn new(labels: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            labels,
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    /// The stable entity uuid carried in the property bag.
    pub fn entity_uuid(&self) -> Option<Uuid> {
        self.property_str("uuid").and_then(|s| Uuid::parse_str(s).ok())
    }
}
