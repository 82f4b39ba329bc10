use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{ArborError, ArborResult, ValidationError};
use crate::model::attribute::Attribute;
use crate::model::branch::Branch;
use crate::model::edge::{vertex_labels, EdgeLabel, EdgeStatus, VertexRecord};
use crate::model::relationship::Relationship;
use crate::model::timestamp::Timestamp;
use crate::registry::Registry;
use crate::schema::{BranchSupport, NodeSchema};
use crate::store::graph::TemporalStore;
use crate::store::manager::NodeManager;
use crate::store::{add_relationship, delete_node};

// ---------------------------------------------------------------------------
// Node: the fundamental entity of the graph
// ---------------------------------------------------------------------------

/// A node of the graph: a vertex with a stable uuid, a schema kind, and a
/// set of attributes and outgoing relationships. Anchored to its branch by
/// an IS_PART_OF edge with validity metadata.
#[derive(Debug, Clone)]
pub struct Node {
    /// Stable entity identifier.
    pub uuid: Uuid,
    /// Storage id of the Node vertex, set once persisted or loaded.
    pub db_id: Option<Uuid>,
    pub kind: String,
    pub schema: Arc<NodeSchema>,
    /// The branch this entity was constructed against.
    pub branch: Branch,
    attributes: BTreeMap<String, Attribute>,
    relationships: BTreeMap<String, Vec<Relationship>>,
    pub updated_at: Option<Timestamp>,
}

impl Node {
    /// Build a new node at a branch from caller-supplied fields. Every
    /// attribute of the schema is materialized (schema defaults apply);
    /// unknown fields are a validation error.
    pub fn new(schema: Arc<NodeSchema>, branch: Branch, fields: &Map<String, Value>) -> Result<Self, ValidationError> {
        let uuid = Uuid::new_v4();
        let mut errors = ValidationError::default();

        for key in fields.keys() {
            if schema.get_attribute(key).is_none() && schema.get_relationship(key).is_none() {
                errors.insert(key.clone(), format!("{} is not a valid field for {}", key, schema.kind));
            }
        }

        let mut attributes = BTreeMap::new();
        for attr_schema in &schema.attributes {
            match Attribute::new(attr_schema, uuid, fields.get(&attr_schema.name)) {
                Ok(attribute) => {
                    attributes.insert(attr_schema.name.clone(), attribute);
                }
                Err(err) => {
                    for (field, message) in err.fields {
                        errors.insert(field, message);
                    }
                }
            }
        }

        let mut relationships: BTreeMap<String, Vec<Relationship>> = BTreeMap::new();
        for rel_schema in &schema.relationships {
            let Some(input) = fields.get(&rel_schema.name) else { continue };
            let inputs: Vec<&Value> = match input {
                Value::Array(items) => items.iter().collect(),
                other => vec![other],
            };
            for item in inputs {
                match Relationship::new(rel_schema, uuid, item) {
                    Ok(relationship) => relationships
                        .entry(rel_schema.name.clone())
                        .or_default()
                        .push(relationship),
                    Err(err) => {
                        for (field, message) in err.fields {
                            errors.insert(field, message);
                        }
                    }
                }
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Self {
            uuid,
            db_id: None,
            kind: schema.kind.clone(),
            schema,
            branch,
            attributes,
            relationships,
            updated_at: None,
        })
    }

    /// Hydrate a node loaded from the store.
    pub(crate) fn hydrate(
        schema: Arc<NodeSchema>,
        branch: Branch,
        uuid: Uuid,
        db_id: Uuid,
        attributes: BTreeMap<String, Attribute>,
        relationships: BTreeMap<String, Vec<Relationship>>,
        updated_at: Option<Timestamp>,
    ) -> Self {
        Self {
            kind: schema.kind.clone(),
            uuid,
            db_id: Some(db_id),
            schema,
            branch,
            attributes,
            relationships,
            updated_at,
        }
    }

    // -----------------------------------------------------------------------
    // Field accessors
    // -----------------------------------------------------------------------

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn attribute_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.attributes.get_mut(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.values()
    }

    /// Current in-memory value of an attribute.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name).and_then(|a| a.value.as_ref())
    }

    /// Replace an attribute value, validating against its schema.
    pub fn set_value(&mut self, name: &str, value: Value) -> Result<(), ValidationError> {
        let attribute = self
            .attributes
            .get_mut(name)
            .ok_or_else(|| ValidationError::single(name, format!("{} is not an attribute of {}", name, self.kind)))?;
        attribute.set_value(value)
    }

    pub fn relationships_named(&self, name: &str) -> &[Relationship] {
        self.relationships.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn relationship_mut(&mut self, name: &str) -> Option<&mut Relationship> {
        self.relationships.get_mut(name).and_then(|rels| rels.first_mut())
    }

    /// Attach a new relationship to this node; persisted on the next save.
    pub fn add_relationship(&mut self, name: &str, input: &Value) -> Result<(), ValidationError> {
        let rel_schema = self
            .schema
            .get_relationship(name)
            .ok_or_else(|| {
                ValidationError::single(name, format!("{} is not a relationship of {}", name, self.kind))
            })?
            .clone();
        let relationship = Relationship::new(&rel_schema, self.uuid, input)?;
        self.relationships
            .entry(rel_schema.name.clone())
            .or_default()
            .push(relationship);
        Ok(())
    }

    /// The branch this node's IS_PART_OF edge lives on.
    pub fn effective_branch(&self, registry: &Registry) -> ArborResult<Branch> {
        match self.schema.branch {
            BranchSupport::Agnostic => registry.global_branch_record(),
            BranchSupport::Aware => Ok(self.branch.clone()),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create or update the node. New nodes get a Node vertex, an
    /// IS_PART_OF anchor, and vertices/edges for every attribute and
    /// relationship; existing nodes diff each field against the currently
    /// visible state and emit targeted append/close operations.
    pub async fn save(
        &mut self,
        store: &dyn TemporalStore,
        registry: &Registry,
        at: Option<Timestamp>,
    ) -> ArborResult<()> {
        let at = Timestamp::or_now(at);
        if self.db_id.is_none() {
            self.create(store, registry, at).await
        } else {
            self.update(store, registry, at).await
        }
    }

    async fn create(
        &mut self,
        store: &dyn TemporalStore,
        registry: &Registry,
        at: Timestamp,
    ) -> ArborResult<()> {
        let effective = self.effective_branch(registry)?;
        let anchor = registry.get_branch(&effective.name).await?;
        let anchor_db_id = anchor
            .db_id
            .ok_or_else(|| ArborError::Integrity(format!("branch {} has no vertex", anchor.name)))?;

        let vertex = VertexRecord::new(vec![vertex_labels::NODE.to_string(), self.kind.clone()])
            .with_property("uuid", json!(self.uuid.to_string()))
            .with_property("kind", json!(self.kind));
        let node_db_id = vertex.id;
        store.add_vertex(vertex).await?;
        self.db_id = Some(node_db_id);

        add_relationship(
            store,
            node_db_id,
            anchor_db_id,
            EdgeLabel::IsPartOf,
            &effective.name,
            effective.hierarchy_level,
            at,
            EdgeStatus::Active,
        )
        .await?;

        // Children of a branch-agnostic node follow it onto the global branch.
        for attribute in self.attributes.values_mut() {
            attribute.node_db_id = Some(node_db_id);
            attribute.create(store, &effective, at).await?;
        }

        for rels in self.relationships.values_mut() {
            for relationship in rels {
                relationship.node_db_id = Some(node_db_id);
                relationship.create(store, &effective, at).await?;
            }
        }

        self.updated_at = Some(at);
        Ok(())
    }

    async fn update(
        &mut self,
        store: &dyn TemporalStore,
        registry: &Registry,
        at: Timestamp,
    ) -> ArborResult<()> {
        let manager = NodeManager::new(store, registry);
        let db_id = self.db_id.ok_or_else(|| ArborError::Internal("node has no storage id".into()))?;
        let effective = self.effective_branch(registry)?;

        let filter = effective.filter_at(at);
        let attribute_rows = manager.attribute_rows(&[db_id], &filter).await?;
        for attribute in self.attributes.values_mut() {
            let current = attribute_rows
                .iter()
                .find(|row| row.node_db_id == db_id && row.attr_name == attribute.name);
            if let Some(row) = current {
                attribute.save(store, &effective, row, at).await?;
            } else {
                attribute.node_db_id = Some(db_id);
                attribute.create(store, &effective, at).await?;
            }
        }

        let relationship_rows = manager.relationship_rows(db_id, &filter).await?;
        for rels in self.relationships.values_mut() {
            for relationship in rels {
                let current = relationship_rows
                    .iter()
                    .find(|row| row.rel_vertex.entity_uuid() == Some(relationship.uuid));
                if let Some(row) = current {
                    relationship.save(store, &effective, row, at).await?;
                } else {
                    relationship.node_db_id = Some(db_id);
                    relationship.create(store, &effective, at).await?;
                }
            }
        }

        self.updated_at = Some(at);
        Ok(())
    }

    /// Logically delete one attribute: every live property edge and the
    /// HAS_ATTRIBUTE edge get DELETED successors on this node's branch.
    pub async fn delete_attribute(
        &mut self,
        name: &str,
        store: &dyn TemporalStore,
        registry: &Registry,
        at: Option<Timestamp>,
    ) -> ArborResult<()> {
        let at = Timestamp::or_now(at);
        let db_id = self.db_id.ok_or_else(|| ArborError::Internal("node has no storage id".into()))?;
        let effective = self.effective_branch(registry)?;

        let manager = NodeManager::new(store, registry);
        let rows = manager.attribute_rows(&[db_id], &effective.filter_at(at)).await?;
        let row = rows
            .iter()
            .find(|row| row.attr_name == name)
            .ok_or_else(|| ValidationError::single(name, format!("{} is not a stored attribute of {}", name, self.kind)))?;

        let mut attribute = self
            .attributes
            .remove(name)
            .ok_or_else(|| ValidationError::single(name, format!("{} is not an attribute of {}", name, self.kind)))?;
        attribute.delete(store, &effective, row, at).await?;

        self.updated_at = Some(at);
        Ok(())
    }

    /// Logically delete the relationship(s) with the given name.
    pub async fn remove_relationship(
        &mut self,
        name: &str,
        store: &dyn TemporalStore,
        registry: &Registry,
        at: Option<Timestamp>,
    ) -> ArborResult<()> {
        let at = Timestamp::or_now(at);
        let db_id = self.db_id.ok_or_else(|| ArborError::Internal("node has no storage id".into()))?;
        let effective = self.effective_branch(registry)?;

        let manager = NodeManager::new(store, registry);
        let rows = manager.relationship_rows(db_id, &effective.filter_at(at)).await?;

        let mut removed = self.relationships.remove(name).unwrap_or_default();
        for relationship in &mut removed {
            let row = rows
                .iter()
                .find(|row| row.rel_vertex.entity_uuid() == Some(relationship.uuid))
                .ok_or_else(|| {
                    ValidationError::single(name, format!("{} is not a stored relationship of {}", name, self.kind))
                })?;
            relationship.delete(store, &effective, row, at).await?;
        }

        self.updated_at = Some(at);
        Ok(())
    }

    /// Logical deletion: closes this node's same-branch edges and appends a
    /// DELETED IS_PART_OF anchor; history is preserved.
    pub async fn delete(
        &mut self,
        store: &dyn TemporalStore,
        registry: &Registry,
        at: Option<Timestamp>,
    ) -> ArborResult<()> {
        let at = Timestamp::or_now(at);
        let db_id = self.db_id.ok_or_else(|| ArborError::Internal("node has no storage id".into()))?;
        let effective = self.effective_branch(registry)?;
        let anchor = registry.get_branch(&effective.name).await?;
        let anchor_db_id = anchor
            .db_id
            .ok_or_else(|| ArborError::Integrity(format!("branch {} has no vertex", anchor.name)))?;

        delete_node(store, db_id, anchor_db_id, &effective.name, effective.hierarchy_level, at).await?;
        self.updated_at = Some(at);
        Ok(())
    }

    /// Render a view of the node, optionally restricted to a set of fields.
    pub fn to_view(&self, fields: Option<&[&str]>) -> Value {
        let selected = |name: &str| fields.map_or(true, |wanted| wanted.contains(&name));

        let mut attrs = Map::new();
        for (name, attribute) in &self.attributes {
            if selected(name) {
                attrs.insert(name.clone(), attribute.to_view());
            }
        }

        let mut rels = Map::new();
        for (name, relationships) in &self.relationships {
            if selected(name) {
                let views: Vec<Value> = relationships.iter().map(Relationship::to_view).collect();
                rels.insert(name.clone(), Value::Array(views));
            }
        }

        json!({
            "id": self.uuid.to_string(),
            "kind": self.kind,
            "attributes": Value::Object(attrs),
            "relationships": Value::Object(rels),
        })
    }

    pub(crate) fn insert_relationship(&mut self, name: &str, relationship: Relationship) {
        self.relationships.entry(name.to_string()).or_default().push(relationship);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::attribute::AttributeKind;
    use crate::schema::AttributeSchema;

    fn criticality() -> Arc<NodeSchema> {
        Arc::new(
            NodeSchema::new("Criticality")
                .attribute(AttributeSchema::new("name", AttributeKind::String))
                .attribute(AttributeSchema::new("level", AttributeKind::Integer))
                .attribute(AttributeSchema::new("color", AttributeKind::String).with_default(json!("#444444")))
                .attribute(AttributeSchema::new("description", AttributeKind::String).optional()),
        )
    }

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_new_materializes_all_schema_attributes() {
        let node = Node::new(
            criticality(),
            Branch::default_branch(),
            &fields(&[("name", json!("low")), ("level", json!(4))]),
        )
        .unwrap();

        assert_eq!(node.value("name"), Some(&json!("low")));
        assert_eq!(node.value("level"), Some(&json!(4)));
        assert_eq!(node.value("color"), Some(&json!("#444444")));
        assert_eq!(node.value("description"), None);
        assert!(node.attribute("name").unwrap().is_visible);
        assert!(!node.attribute("name").unwrap().is_protected);
    }

    #[test]
    fn test_new_rejects_unknown_fields() {
        let err = Node::new(
            criticality(),
            Branch::default_branch(),
            &fields(&[("name", json!("low")), ("level", json!(4)), ("bogus", json!(1))]),
        )
        .unwrap_err();
        assert!(err.fields.contains_key("bogus"));
    }

    #[test]
    fn test_new_reports_missing_required_fields() {
        let err = Node::new(criticality(), Branch::default_branch(), &fields(&[("name", json!("low"))]))
            .unwrap_err();
        assert!(err.fields.contains_key("level"));
    }

    #[test]
    fn test_set_value_validates() {
        let mut node = Node::new(
            criticality(),
            Branch::default_branch(),
            &fields(&[("name", json!("low")), ("level", json!(4))]),
        )
        .unwrap();

        node.set_value("level", json!(2)).unwrap();
        assert!(node.set_value("level", json!("high")).is_err());
        assert!(node.set_value("missing", json!(1)).is_err());
    }

    #[test]
    fn test_to_view_field_projection() {
        let node = Node::new(
            criticality(),
            Branch::default_branch(),
            &fields(&[("name", json!("low")), ("level", json!(4))]),
        )
        .unwrap();

        let view = node.to_view(Some(&["name"]));
        let attrs = view.get("attributes").unwrap().as_object().unwrap();
        assert!(attrs.contains_key("name"));
        assert!(!attrs.contains_key("level"));
    }
}
