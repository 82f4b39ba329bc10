use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::{ArborError, ArborResult};
use crate::model::attribute::AttributeKind;

// ---------------------------------------------------------------------------
// Schema value objects
// ---------------------------------------------------------------------------

/// Whether entities of a schema live on the user's branch or on the global
/// branch shared by all branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchSupport {
    Aware,
    Agnostic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeSchema {
    pub name: String,
    pub kind: AttributeKind,
    pub optional: bool,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub enum_values: Option<Vec<Value>>,
    pub branch: BranchSupport,
}

impl AttributeSchema {
    pub fn new(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
            default_value: None,
            regex: None,
            min_length: None,
            max_length: None,
            enum_values: None,
            branch: BranchSupport::Aware,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self.optional = true;
        self
    }

    pub fn with_regex(mut self, regex: impl Into<String>) -> Self {
        self.regex = Some(regex.into());
        self
    }

    pub fn with_length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_length = min;
        self.max_length = max;
        self
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn agnostic(mut self) -> Self {
        self.branch = BranchSupport::Agnostic;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipSchema {
    pub name: String,
    /// Kind of the node on the other side.
    pub peer: String,
    /// Stable identifier stored on the Relationship vertex; defaults to the
    /// sorted pair of kinds joined with the relationship name.
    pub identifier: String,
    pub optional: bool,
    pub branch: BranchSupport,
}

impl RelationshipSchema {
    pub fn new(name: impl Into<String>, peer: impl Into<String>) -> Self {
        let name = name.into();
        let peer = peer.into();
        let identifier = format!("{}__{}", name, peer.to_lowercase());
        Self {
            name,
            peer,
            identifier,
            optional: true,
            branch: BranchSupport::Aware,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSchema {
    /// Schema kind; also the per-kind vertex label.
    pub kind: String,
    pub attributes: Vec<AttributeSchema>,
    pub relationships: Vec<RelationshipSchema>,
    pub branch: BranchSupport,
}

impl NodeSchema {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            branch: BranchSupport::Aware,
        }
    }

    pub fn attribute(mut self, attribute: AttributeSchema) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn relationship(mut self, relationship: RelationshipSchema) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn agnostic(mut self) -> Self {
        self.branch = BranchSupport::Agnostic;
        self
    }

    pub fn get_attribute(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn get_relationship(&self, name: &str) -> Option<&RelationshipSchema> {
        self.relationships.iter().find(|r| r.name == name)
    }
}

// ---------------------------------------------------------------------------
// SchemaRegistry: process-wide, branch-scoped schema catalog
// ---------------------------------------------------------------------------

/// The schemas active on one branch, content-addressed by `hash`.
#[derive(Debug, Clone, Default)]
pub struct SchemaBranch {
    nodes: HashMap<String, Arc<NodeSchema>>,
    hash: String,
}

impl SchemaBranch {
    pub fn get(&self, kind: &str) -> Option<Arc<NodeSchema>> {
        self.nodes.get(kind).cloned()
    }

    pub fn has(&self, kind: &str) -> bool {
        self.nodes.contains_key(kind)
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.nodes.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    fn recompute_hash(&mut self) -> ArborResult<()> {
        let mut hasher = Sha256::new();
        let mut kinds: Vec<&String> = self.nodes.keys().collect();
        kinds.sort();
        for kind in kinds {
            let schema = &self.nodes[kind];
            hasher.update(kind.as_bytes());
            hasher.update(serde_json::to_vec(schema.as_ref())?);
        }
        self.hash = format!("{:x}", hasher.finalize());
        Ok(())
    }
}

/// In-memory, mutable schema catalog keyed by branch name. A branch's schema
/// is duplicated on branch creation; `set` mutations invalidate the
/// content-addressed snapshot cache. Readers snapshot a branch's schema
/// before use and never hold the registry lock across a suspension point.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    branches: RwLock<HashMap<String, SchemaBranch>>,
    snapshots: RwLock<HashMap<String, Arc<SchemaBranch>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a schema on a branch, recomputing the branch hash
    /// and dropping the superseded snapshot.
    pub async fn set(&self, branch: &str, schema: NodeSchema) -> ArborResult<String> {
        let mut branches = self.branches.write().await;
        let entry = branches.entry(branch.to_string()).or_default();
        let old_hash = entry.hash.clone();
        entry.nodes.insert(schema.kind.clone(), Arc::new(schema));
        entry.recompute_hash()?;
        let new_hash = entry.hash.clone();
        drop(branches);

        if !old_hash.is_empty() {
            self.snapshots.write().await.remove(&old_hash);
        }
        Ok(new_hash)
    }

    /// Look up a schema, falling back to the default branch when the kind is
    /// not present on the requested branch.
    pub async fn get(&self, kind: &str, branch: &str, default_branch: &str) -> ArborResult<Arc<NodeSchema>> {
        let branches = self.branches.read().await;
        if let Some(schema) = branches.get(branch).and_then(|b| b.get(kind)) {
            return Ok(schema);
        }
        if branch != default_branch {
            if let Some(schema) = branches.get(default_branch).and_then(|b| b.get(kind)) {
                return Ok(schema);
            }
        }
        Err(ArborError::SchemaNotFound(kind.to_string()))
    }

    pub async fn has(&self, kind: &str, branch: &str, default_branch: &str) -> bool {
        self.get(kind, branch, default_branch).await.is_ok()
    }

    /// Duplicate the source branch's schemas onto a new branch, returning the
    /// (unchanged) schema hash for the new branch record.
    pub async fn duplicate(&self, from: &str, to: &str) -> ArborResult<String> {
        let mut branches = self.branches.write().await;
        let source = branches
            .get(from)
            .cloned()
            .ok_or_else(|| ArborError::BranchNotFound(from.to_string()))?;
        let hash = source.hash.clone();
        branches.insert(to.to_string(), source);
        Ok(hash)
    }

    /// An immutable snapshot of a branch's schemas, served from the
    /// content-addressed cache when the hash is already known.
    pub async fn snapshot(&self, branch: &str) -> ArborResult<Arc<SchemaBranch>> {
        let branches = self.branches.read().await;
        let entry = branches
            .get(branch)
            .ok_or_else(|| ArborError::BranchNotFound(branch.to_string()))?;
        let hash = entry.hash.clone();
        let materialized = entry.clone();
        drop(branches);

        let mut snapshots = self.snapshots.write().await;
        Ok(snapshots
            .entry(hash)
            .or_insert_with(|| Arc::new(materialized))
            .clone())
    }

    pub async fn branch_hash(&self, branch: &str) -> Option<String> {
        self.branches.read().await.get(branch).map(|b| b.hash.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn criticality_schema() -> NodeSchema {
        NodeSchema::new("Criticality")
            .attribute(AttributeSchema::new("name", AttributeKind::String))
            .attribute(AttributeSchema::new("level", AttributeKind::Integer))
            .attribute(AttributeSchema::new("color", AttributeKind::String).with_default(json!("#444444")))
            .attribute(AttributeSchema::new("description", AttributeKind::String).optional())
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let registry = SchemaRegistry::new();
        registry.set("main", criticality_schema()).await.unwrap();

        let schema = registry.get("Criticality", "main", "main").await.unwrap();
        assert_eq!(schema.kind, "Criticality");
        assert!(schema.get_attribute("color").unwrap().default_value.is_some());
        assert!(registry.get("Missing", "main", "main").await.is_err());
    }

    #[tokio::test]
    async fn test_branch_fallback_to_default() {
        let registry = SchemaRegistry::new();
        registry.set("main", criticality_schema()).await.unwrap();

        let schema = registry.get("Criticality", "change-dc1", "main").await.unwrap();
        assert_eq!(schema.kind, "Criticality");
    }

    #[tokio::test]
    async fn test_duplicate_preserves_hash() {
        let registry = SchemaRegistry::new();
        let hash = registry.set("main", criticality_schema()).await.unwrap();
        let duplicated = registry.duplicate("main", "change-dc1").await.unwrap();
        assert_eq!(hash, duplicated);
        assert!(registry.get("Criticality", "change-dc1", "main").await.is_ok());
    }

    #[tokio::test]
    async fn test_set_invalidates_snapshot_hash() {
        let registry = SchemaRegistry::new();
        registry.set("main", criticality_schema()).await.unwrap();
        let before = registry.snapshot("main").await.unwrap();

        registry
            .set("main", NodeSchema::new("Person").attribute(AttributeSchema::new("name", AttributeKind::String)))
            .await
            .unwrap();
        let after = registry.snapshot("main").await.unwrap();

        assert_ne!(before.hash(), after.hash());
        assert!(after.has("Person"));
    }
}
