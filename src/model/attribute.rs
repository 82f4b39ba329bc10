use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{ArborResult, ValidationError};
use crate::model::branch::{Branch, GLOBAL_BRANCH_NAME};
use crate::model::edge::{vertex_labels, EdgeLabel, EdgeStatus, VertexRecord};
use crate::model::timestamp::Timestamp;
use crate::schema::{AttributeSchema, BranchSupport};
use crate::store::graph::TemporalStore;
use crate::store::manager::AttributeRow;
use crate::store::{add_relationship, close_relationships};

// ---------------------------------------------------------------------------
// AttributeKind: kind is data, not type
// ---------------------------------------------------------------------------

/// The kind of scalar an attribute stores. Each kind carries its own format
/// validation and its own serialized representation in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeKind {
    String,
    Integer,
    Boolean,
    IPNetwork,
    IPHost,
    List,
    #[serde(rename = "JSON")]
    Json,
    Password,
    Any,
}

impl AttributeKind {
    /// Validate the shape of a value for this kind.
    pub fn validate_format(&self, value: &Value, name: &str) -> Result<(), ValidationError> {
        let ok = match self {
            AttributeKind::String | AttributeKind::Password => value.is_string(),
            AttributeKind::Integer => value.is_i64() || value.is_u64(),
            AttributeKind::Boolean => value.is_boolean(),
            AttributeKind::IPNetwork => match value.as_str() {
                Some(text) => parse_ip_network(text).is_some(),
                None => false,
            },
            AttributeKind::IPHost => match value.as_str() {
                Some(text) => parse_ip_host(text).is_some(),
                None => false,
            },
            AttributeKind::List => value.is_array(),
            AttributeKind::Json => value.is_object() || value.is_array(),
            AttributeKind::Any => true,
        };

        if ok {
            Ok(())
        } else {
            Err(ValidationError::single(
                name,
                format!("{} is not a valid {:?}", value, self),
            ))
        }
    }

    /// Serialize a value into its stored representation. Lists and JSON use
    /// a stable textual encoding, IP kinds canonicalise with prefix length,
    /// and passwords are hashed one-way before store.
    pub fn serialize(&self, value: &Value) -> ArborResult<Value> {
        match self {
            AttributeKind::List | AttributeKind::Json => Ok(Value::String(serde_json::to_string(value)?)),
            AttributeKind::IPNetwork => {
                let text = value.as_str().unwrap_or_default();
                let net = parse_ip_network(text).ok_or_else(|| {
                    ValidationError::single("value", format!("{} is not a valid IPNetwork", text))
                })?;
                Ok(Value::String(net.to_string()))
            }
            AttributeKind::IPHost => {
                let text = value.as_str().unwrap_or_default();
                let net = parse_ip_host(text).ok_or_else(|| {
                    ValidationError::single("value", format!("{} is not a valid IPHost", text))
                })?;
                Ok(Value::String(net.to_string()))
            }
            AttributeKind::Password => {
                let text = value.as_str().unwrap_or_default();
                let hashed = bcrypt::hash(text, bcrypt::DEFAULT_COST)
                    .map_err(|e| crate::error::ArborError::Internal(format!("password hash failed: {}", e)))?;
                Ok(Value::String(hashed))
            }
            _ => Ok(value.clone()),
        }
    }

    /// Deserialize a stored value. Passwords never round-trip the plaintext;
    /// the stored hash is the value.
    pub fn deserialize(&self, value: &Value) -> ArborResult<Value> {
        match self {
            AttributeKind::List | AttributeKind::Json => match value.as_str() {
                Some(text) => Ok(serde_json::from_str(text)?),
                None => Ok(value.clone()),
            },
            _ => Ok(value.clone()),
        }
    }
}

fn parse_ip_network(text: &str) -> Option<ipnet::IpNet> {
    if let Ok(addr) = text.parse::<std::net::IpAddr>() {
        let prefix = match addr {
            std::net::IpAddr::V4(_) => 32,
            std::net::IpAddr::V6(_) => 128,
        };
        return ipnet::IpNet::new(addr, prefix).ok();
    }
    let net = text.parse::<ipnet::IpNet>().ok()?;
    // A network address must not carry host bits.
    if net.addr() != net.network() {
        return None;
    }
    Some(net)
}

fn parse_ip_host(text: &str) -> Option<ipnet::IpNet> {
    if let Ok(addr) = text.parse::<std::net::IpAddr>() {
        let prefix = match addr {
            std::net::IpAddr::V4(_) => 32,
            std::net::IpAddr::V6(_) => 128,
        };
        return ipnet::IpNet::new(addr, prefix).ok();
    }
    text.parse::<ipnet::IpNet>().ok()
}

// ---------------------------------------------------------------------------
// Validation against an attribute schema
// ---------------------------------------------------------------------------

/// Validate a value against the attribute schema: presence for non-optional
/// attributes, kind-specific format, then regex / bounds / enum membership.
pub fn validate(value: Option<&Value>, name: &str, schema: &AttributeSchema) -> Result<(), ValidationError> {
    let value = match value {
        None | Some(Value::Null) => {
            if schema.optional {
                return Ok(());
            }
            return Err(ValidationError::single(
                name,
                format!("A value must be provided for {}", name),
            ));
        }
        Some(value) => value,
    };

    schema.kind.validate_format(value, name)?;
    validate_content(value, name, schema)
}

fn validate_content(value: &Value, name: &str, schema: &AttributeSchema) -> Result<(), ValidationError> {
    if let Some(pattern) = &schema.regex {
        let re = regex::Regex::new(pattern).map_err(|_| {
            ValidationError::single(name, format!("The regex defined in the schema is not valid ({:?})", pattern))
        })?;
        let text = value_as_text(value);
        if !re.is_match(&text) {
            return Err(ValidationError::single(
                name,
                format!("{} must conform with the regex: {:?}", text, pattern),
            ));
        }
    }

    if schema.min_length.is_some() || schema.max_length.is_some() {
        let len = match value {
            Value::String(s) => s.chars().count(),
            Value::Array(items) => items.len(),
            _ => value_as_text(value).chars().count(),
        };
        if let Some(min) = schema.min_length {
            if len < min {
                return Err(ValidationError::single(
                    name,
                    format!("{} must have a minimum length of {}", value, min),
                ));
            }
        }
        if let Some(max) = schema.max_length {
            if len > max {
                return Err(ValidationError::single(
                    name,
                    format!("{} must have a maximum length of {}", value, max),
                ));
            }
        }
    }

    if let Some(allowed) = &schema.enum_values {
        if !allowed.contains(value) {
            return Err(ValidationError::single(
                name,
                format!("{} must be one of {:?}", value, allowed),
            ));
        }
    }

    Ok(())
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Attribute: owned by exactly one Node via HAS_ATTRIBUTE
// ---------------------------------------------------------------------------

/// An attribute of a node. The value and the four flag/node properties each
/// hang off the Attribute vertex via their own edge, so each carries its own
/// validity interval.
#[derive(Debug, Clone)]
pub struct Attribute {
    /// Stable uuid of the Attribute vertex.
    pub uuid: Uuid,
    /// Storage id of the Attribute vertex, set once persisted or loaded.
    pub db_id: Option<Uuid>,
    pub name: String,
    pub schema: AttributeSchema,
    /// In-memory scalar; `None` models an absent optional value.
    pub value: Option<Value>,
    pub is_visible: bool,
    pub is_protected: bool,
    /// uuid of the node a value originated from.
    pub source_id: Option<Uuid>,
    /// uuid of the node owning the value.
    pub owner_id: Option<Uuid>,
    pub updated_at: Option<Timestamp>,
    /// Owning node, by stable uuid (resolved through the node manager, never
    /// a back-reference).
    pub node_uuid: Uuid,
    pub node_db_id: Option<Uuid>,
}

impl Attribute {
    /// Build an attribute from caller input. Input is either a bare scalar
    /// or an extended form `{"value": .., "is_visible": .., "is_protected":
    /// .., "source": .., "owner": ..}`. Schema defaults apply when no value
    /// is provided; the result is validated.
    pub fn new(
        schema: &AttributeSchema,
        node_uuid: Uuid,
        input: Option<&Value>,
    ) -> Result<Self, ValidationError> {
        let mut value = None;
        let mut is_visible = true;
        let mut is_protected = false;
        let mut source_id = None;
        let mut owner_id = None;

        match input {
            Some(Value::Object(map)) if map.contains_key("value") => {
                value = map.get("value").filter(|v| !v.is_null()).cloned();
                if let Some(v) = map.get("is_visible").and_then(Value::as_bool) {
                    is_visible = v;
                }
                if let Some(v) = map.get("is_protected").and_then(Value::as_bool) {
                    is_protected = v;
                }
                source_id = map.get("source").and_then(parse_uuid_value);
                owner_id = map.get("owner").and_then(parse_uuid_value);
            }
            Some(Value::Null) | None => {}
            Some(other) => value = Some(other.clone()),
        }

        if value.is_none() {
            value = schema.default_value.clone();
        }

        validate(value.as_ref(), &schema.name, schema)?;

        Ok(Self {
            uuid: Uuid::new_v4(),
            db_id: None,
            name: schema.name.clone(),
            schema: schema.clone(),
            value,
            is_visible,
            is_protected,
            source_id,
            owner_id,
            updated_at: None,
            node_uuid,
            node_db_id: None,
        })
    }

    /// Replace the in-memory value, validating against the schema.
    pub fn set_value(&mut self, value: Value) -> Result<(), ValidationError> {
        let value = if value.is_null() { None } else { Some(value) };
        validate(value.as_ref(), &self.name, &self.schema)?;
        self.value = value;
        Ok(())
    }

    /// The branch this attribute's edges live on: branch-agnostic schemas
    /// rewrite to the global branch.
    pub fn effective_branch(&self, branch: &Branch) -> (String, u8) {
        match self.schema.branch {
            BranchSupport::Agnostic => (GLOBAL_BRANCH_NAME.to_string(), 1),
            BranchSupport::Aware => (branch.name.clone(), branch.hierarchy_level),
        }
    }

    /// Serialized form stored on the AttributeValue vertex.
    pub fn to_db(&self) -> ArborResult<Value> {
        match &self.value {
            None => Ok(Value::Null),
            Some(value) => self.schema.kind.serialize(value),
        }
    }

    /// Decode a stored value back into the in-memory scalar.
    pub fn from_db(&self, stored: &Value) -> ArborResult<Option<Value>> {
        if stored.is_null() {
            return Ok(None);
        }
        Ok(Some(self.schema.kind.deserialize(stored)?))
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Create the Attribute vertex with its value and property edges. Called
    /// from the node create path; `node_db_id` must already be set.
    pub async fn create(
        &mut self,
        store: &dyn TemporalStore,
        branch: &Branch,
        at: Timestamp,
    ) -> ArborResult<()> {
        let node_db_id = self
            .node_db_id
            .ok_or_else(|| crate::error::ArborError::Internal("attribute created before its node".into()))?;
        let (branch_name, branch_level) = self.effective_branch(branch);

        let attr_vertex = VertexRecord::new(vec![vertex_labels::ATTRIBUTE.to_string()])
            .with_property("uuid", json!(self.uuid.to_string()))
            .with_property("name", json!(self.name));
        let attr_db_id = attr_vertex.id;
        store.add_vertex(attr_vertex).await?;
        self.db_id = Some(attr_db_id);

        add_relationship(
            store,
            node_db_id,
            attr_db_id,
            EdgeLabel::HasAttribute,
            &branch_name,
            branch_level,
            at,
            EdgeStatus::Active,
        )
        .await?;

        self.append_value_edge(store, EdgeLabel::HasValue, self.to_db()?, &branch_name, branch_level, at)
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

    /// Update the attribute in the store: re-validate, read the currently
    /// visible state, and for each field that differs append a new property
    /// vertex and edge, closing the superseded edge when it lives on the
    /// attribute's effective branch.
    pub async fn save(
        &mut self,
        store: &dyn TemporalStore,
        branch: &Branch,
        current: &AttributeRow,
        at: Timestamp,
    ) -> ArborResult<()> {
        validate(self.value.as_ref(), &self.name, &self.schema)?;

        let (branch_name, branch_level) = self.effective_branch(branch);
        self.db_id = Some(current.attr_vertex.id);

        // ---------- Value ----------
        if let Some(slot) = current.properties.get(&EdgeLabel::HasValue) {
            let stored = slot.vertex.property("value").cloned().unwrap_or(Value::Null);
            let current_value = self.from_db(&stored)?;
            if current_value != self.value {
                self.append_value_edge(store, EdgeLabel::HasValue, self.to_db()?, &branch_name, branch_level, at)
                    .await?;
                if slot.edge.branch == branch_name {
                    close_relationships(store, &[slot.edge.id], at).await?;
                }
            }
        }

        // ---------- Flags ----------
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

        // ---------- Node properties ----------
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

    /// Logical delete: append DELETED edges for every live property and the
    /// HAS_ATTRIBUTE edge, closing the superseded same-branch intervals.
    pub async fn delete(
        &mut self,
        store: &dyn TemporalStore,
        branch: &Branch,
        current: &AttributeRow,
        at: Timestamp,
    ) -> ArborResult<()> {
        let (branch_name, branch_level) = self.effective_branch(branch);
        let attr_db_id = current.attr_vertex.id;
        let mut to_close = Vec::new();

        for slot in current.properties.values() {
            add_relationship(
                store,
                attr_db_id,
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

        add_relationship(
            store,
            current.node_db_id,
            attr_db_id,
            EdgeLabel::HasAttribute,
            &branch_name,
            branch_level,
            at,
            EdgeStatus::Deleted,
        )
        .await?;
        if current.has_attribute.branch == branch_name {
            to_close.push(current.has_attribute.id);
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
        let attr_db_id = self
            .db_id
            .ok_or_else(|| crate::error::ArborError::Internal("attribute has no storage id".into()))?;
        let value_vertex = VertexRecord::new(vec![vertex_labels::ATTRIBUTE_VALUE.to_string()])
            .with_property("value", value);
        let value_db_id = value_vertex.id;
        store.add_vertex(value_vertex).await?;
        add_relationship(store, attr_db_id, value_db_id, label, branch_name, branch_level, at, EdgeStatus::Active)
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
        let attr_db_id = self
            .db_id
            .ok_or_else(|| crate::error::ArborError::Internal("attribute has no storage id".into()))?;
        let peer = store
            .vertex_by_entity_uuid(vertex_labels::NODE, &peer_uuid)
            .await?
            .ok_or(crate::error::ArborError::NodeNotFound(peer_uuid))?;
        add_relationship(store, attr_db_id, peer.id, label, branch_name, branch_level, at, EdgeStatus::Active)
            .await?;
        Ok(())
    }

    /// View payload for this attribute.
    pub fn to_view(&self) -> Value {
        json!({
            "id": self.uuid.to_string(),
            "value": self.value.clone().unwrap_or(Value::Null),
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

/// Hydrate an attribute from a stored row.
pub fn attribute_from_row(schema: &AttributeSchema, row: &AttributeRow) -> ArborResult<Attribute> {
    let stored = row
        .properties
        .get(&EdgeLabel::HasValue)
        .and_then(|slot| slot.vertex.property("value"))
        .cloned()
        .unwrap_or(Value::Null);

    let mut attribute = Attribute {
        uuid: row.attr_vertex.entity_uuid().unwrap_or_else(Uuid::new_v4),
        db_id: Some(row.attr_vertex.id),
        name: schema.name.clone(),
        schema: schema.clone(),
        value: None,
        is_visible: true,
        is_protected: false,
        source_id: None,
        owner_id: None,
        updated_at: row
            .properties
            .get(&EdgeLabel::HasValue)
            .map(|slot| slot.edge.from),
        node_uuid: row.node_uuid,
        node_db_id: Some(row.node_db_id),
    };

    attribute.value = attribute.from_db(&stored)?;

    if let Some(slot) = row.properties.get(&EdgeLabel::IsVisible) {
        if let Some(flag) = slot.vertex.property("value").and_then(Value::as_bool) {
            attribute.is_visible = flag;
        }
    }
    if let Some(slot) = row.properties.get(&EdgeLabel::IsProtected) {
        if let Some(flag) = slot.vertex.property("value").and_then(Value::as_bool) {
            attribute.is_protected = flag;
        }
    }
    attribute.source_id = row
        .properties
        .get(&EdgeLabel::HasSource)
        .and_then(|slot| slot.vertex.entity_uuid());
    attribute.owner_id = row
        .properties
        .get(&EdgeLabel::HasOwner)
        .and_then(|slot| slot.vertex.entity_uuid());

    Ok(attribute)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
