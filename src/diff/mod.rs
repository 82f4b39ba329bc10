pub mod merge;

use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::debug;
use uuid::Uuid;

use crate::error::{ArborError, ArborResult, ValidationError};
use crate::model::branch::{Branch, BranchFilter};
use crate::model::edge::{vertex_labels, EdgeLabel, EdgeRecord, EdgeStatus, VertexRecord};
use crate::model::timestamp::Timestamp;
use crate::registry::Registry;
use crate::repository::RepositoryFileDiff;
use crate::store::graph::TemporalStore;
use crate::store::manager::NodeManager;

// ---------------------------------------------------------------------------
// Change-set elements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffAction {
    Added,
    Removed,
    Updated,
}

/// One changed property edge (value, flag, source, or owner).
#[derive(Debug, Clone)]
pub struct PropertyDiffElement {
    pub branch: String,
    pub kind: EdgeLabel,
    pub action: DiffAction,
    /// Storage id of the property vertex.
    pub db_id: Uuid,
    /// Storage id of the changed edge.
    pub rel_id: Uuid,
    /// Edge id on the origin branch this change supersedes on merge.
    pub origin_rel_id: Option<Uuid>,
    pub changed_at: Option<Timestamp>,
}

/// One changed attribute of one node.
#[derive(Debug, Clone)]
pub struct NodeAttributeDiffElement {
    pub uuid: Uuid,
    pub name: String,
    pub action: DiffAction,
    pub db_id: Uuid,
    /// Storage id of the HAS_ATTRIBUTE edge seen by the diff.
    pub rel_id: Uuid,
    /// HAS_ATTRIBUTE edge id on the origin branch, for REMOVED attributes.
    pub origin_rel_id: Option<Uuid>,
    pub changed_at: Option<Timestamp>,
    pub properties: HashMap<EdgeLabel, PropertyDiffElement>,
}

/// One changed node.
#[derive(Debug, Clone)]
pub struct NodeDiffElement {
    /// Branch the change occurred on; `None` for nodes only present because
    /// one of their attributes changed.
    pub branch: Option<String>,
    pub labels: Vec<String>,
    pub uuid: Uuid,
    pub action: DiffAction,
    pub db_id: Uuid,
    /// Storage id of the IS_PART_OF edge, for ADDED/REMOVED nodes.
    pub rel_id: Option<Uuid>,
    pub changed_at: Option<Timestamp>,
    pub attributes: HashMap<String, NodeAttributeDiffElement>,
}

/// One endpoint of a changed relationship.
#[derive(Debug, Clone)]
pub struct RelationshipEdgeNodeDiffElement {
    pub uuid: Uuid,
    pub db_id: Uuid,
    /// Storage id of this endpoint's IS_RELATED edge.
    pub rel_id: Uuid,
    pub labels: Vec<String>,
}

/// One changed relationship.
#[derive(Debug, Clone)]
pub struct RelationshipDiffElement {
    pub branch: Option<String>,
    pub uuid: Uuid,
    pub db_id: Uuid,
    pub name: String,
    pub action: DiffAction,
    pub nodes: HashMap<Uuid, RelationshipEdgeNodeDiffElement>,
    pub properties: HashMap<EdgeLabel, PropertyDiffElement>,
    pub changed_at: Option<Timestamp>,
}

/// The full change set of one branch.
#[derive(Debug, Clone, Default)]
pub struct BranchChanges {
    pub nodes: HashMap<Uuid, NodeDiffElement>,
    pub rels: HashMap<String, HashMap<Uuid, RelationshipDiffElement>>,
    pub files: Vec<RepositoryFileDiff>,
}

/// A single mutable cell of the graph, used for conflict detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModifiedPath {
    Node {
        node: Uuid,
        attribute: String,
        property: EdgeLabel,
    },
    Relationship {
        name: String,
        rel: Uuid,
        property: EdgeLabel,
    },
}

impl fmt::Display for ModifiedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModifiedPath::Node { node, attribute, property } => {
                write!(f, "node/{}/{}/{}", node, attribute, property)
            }
            ModifiedPath::Relationship { name, rel, property } => {
                write!(f, "rel/{}/{}/{}", name, rel, property)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Diff: changes of a branch between two timestamps
// ---------------------------------------------------------------------------

/// The diff engine. Enumerates, per branch, every node, attribute,
/// relationship, and property change between `diff_from` and `diff_to`.
/// Results are memoized; conflict and modified-path queries never re-query
/// the store.
pub struct Diff<'a> {
    store: &'a dyn TemporalStore,
    registry: &'a Registry,
    branch: Branch,
    origin_branch: Branch,
    branch_only: bool,
    pub diff_from: Timestamp,
    pub diff_to: Timestamp,
    results: HashMap<String, BranchChanges>,
    nodes_calculated: bool,
    rels_calculated: bool,
    files_calculated: bool,
}

impl<'a> std::fmt::Debug for Diff<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diff")
            .field("branch", &self.branch)
            .field("origin_branch", &self.origin_branch)
            .field("branch_only", &self.branch_only)
            .field("diff_from", &self.diff_from)
            .field("diff_to", &self.diff_to)
            .finish()
    }
}

impl<'a> Diff<'a> {
    /// Build a diff for a branch. `diff_from` defaults to the branch's
    /// divergence point and is mandatory on the default branch; `diff_to`
    /// defaults to now.
    pub async fn new(
        store: &'a dyn TemporalStore,
        registry: &'a Registry,
        branch: &Branch,
        branch_only: bool,
        diff_from: Option<Timestamp>,
        diff_to: Option<Timestamp>,
    ) -> ArborResult<Diff<'a>> {
        if branch.hierarchy_level > 2 {
            return Err(ArborError::Integrity(format!(
                "branch {} has hierarchy level {}; multi-level hierarchies are not supported",
                branch.name, branch.hierarchy_level
            )));
        }

        let diff_from = match diff_from {
            Some(at) => at,
            None if !branch.is_default => branch.branched_from,
            None => {
                return Err(ArborError::Validation(ValidationError::single(
                    "diff_from",
                    format!("diff_from is mandatory when diffing on the default branch {}", branch.name),
                )))
            }
        };
        let diff_to = Timestamp::or_now(diff_to);
        if diff_to < diff_from {
            return Err(ArborError::Validation(ValidationError::single(
                "diff_to",
                "diff_to must be later than diff_from",
            )));
        }

        let origin_branch = if branch.is_default {
            branch.clone()
        } else {
            registry.get_branch(&branch.origin_branch).await?
        };

        Ok(Diff {
            store,
            registry,
            branch: branch.clone(),
            origin_branch,
            branch_only,
            diff_from,
            diff_to,
            results: HashMap::new(),
            nodes_calculated: false,
            rels_calculated: false,
            files_calculated: false,
        })
    }

    pub fn branch_name(&self) -> &str {
        &self.branch.name
    }

    // -----------------------------------------------------------------------
    // Public accessors
    // -----------------------------------------------------------------------

    /// Node change sets, keyed by branch name.
    pub async fn get_nodes(&mut self) -> ArborResult<HashMap<String, HashMap<Uuid, NodeDiffElement>>> {
        self.ensure_nodes().await?;
        Ok(self
            .results
            .iter()
            .map(|(branch, data)| (branch.clone(), data.nodes.clone()))
            .collect())
    }

    /// Relationship change sets, keyed by branch name then relationship name.
    pub async fn get_relationships(
        &mut self,
    ) -> ArborResult<HashMap<String, HashMap<String, HashMap<Uuid, RelationshipDiffElement>>>> {
        self.ensure_rels().await?;
        Ok(self
            .results
            .iter()
            .map(|(branch, data)| (branch.clone(), data.rels.clone()))
            .collect())
    }

    /// Repository file diffs, keyed by branch name. Delegated to the
    /// repository collaborator; repositories absent from the default branch
    /// and empty diffs are skipped.
    pub async fn get_files(&mut self) -> ArborResult<HashMap<String, Vec<RepositoryFileDiff>>> {
        self.ensure_files().await?;
        Ok(self
            .results
            .iter()
            .map(|(branch, data)| (branch.clone(), data.files.clone()))
            .collect())
    }

    /// All modified paths, per branch. With `branch_only` the origin
    /// branch's paths are omitted.
    pub async fn get_modified_paths(&mut self) -> ArborResult<HashMap<String, HashSet<ModifiedPath>>> {
        self.ensure_nodes().await?;
        self.ensure_rels().await?;

        let mut paths: HashMap<String, HashSet<ModifiedPath>> = HashMap::new();
        for (branch_name, data) in &self.results {
            if self.branch_only && branch_name != &self.branch.name {
                continue;
            }
            let entry = paths.entry(branch_name.clone()).or_default();

            for (node_uuid, node) in &data.nodes {
                for (attr_name, attr) in &node.attributes {
                    for property in attr.properties.keys() {
                        entry.insert(ModifiedPath::Node {
                            node: *node_uuid,
                            attribute: attr_name.clone(),
                            property: *property,
                        });
                    }
                }
            }

            for (rel_name, rels) in &data.rels {
                for (rel_uuid, rel) in rels {
                    for property in rel.properties.keys() {
                        entry.insert(ModifiedPath::Relationship {
                            name: rel_name.clone(),
                            rel: *rel_uuid,
                            property: *property,
                        });
                    }
                }
            }
        }

        Ok(paths)
    }

    /// Paths modified on both branches. The intersection is symmetric:
    /// computing it relative to the origin yields the same set.
    pub async fn get_conflicts(&mut self) -> ArborResult<Vec<ModifiedPath>> {
        if self.branch_only {
            return Ok(Vec::new());
        }

        let paths = self.get_modified_paths().await?;
        let branches: Vec<&String> = paths.keys().collect();
        if branches.len() < 2 {
            return Ok(Vec::new());
        }

        let mut conflicts: Vec<ModifiedPath> = paths[branches[0]]
            .intersection(&paths[branches[1]])
            .cloned()
            .collect();
        conflicts.sort();
        if !conflicts.is_empty() {
            debug!(branch = %self.branch.name, count = conflicts.len(), "conflicts detected");
        }
        Ok(conflicts)
    }

    pub async fn has_conflict(&mut self) -> ArborResult<bool> {
        Ok(!self.get_conflicts().await?.is_empty())
    }

    pub async fn has_changes(&mut self) -> ArborResult<bool> {
        let paths = self.get_modified_paths().await?;
        Ok(paths.values().any(|set| !set.is_empty()))
    }

    fn changes_mut(&mut self, branch: &str) -> &mut BranchChanges {
        self.results.entry(branch.to_string()).or_default()
    }

    // -----------------------------------------------------------------------
    // Nodes & attributes
    // -----------------------------------------------------------------------

    async fn ensure_nodes(&mut self) -> ArborResult<()> {
        if self.nodes_calculated {
            return Ok(());
        }
        self.calculate_diff_nodes().await?;
        self.nodes_calculated = true;
        Ok(())
    }

    async fn calculate_diff_nodes(&mut self) -> ArborResult<()> {
        let branch_names = self.branch.diff_branch_names();
        let score_filter = self.branch.filter_at(self.diff_to);

        // ------------------------------------------------------------
        // Nodes that have been added or removed
        // ------------------------------------------------------------
        let mut anchor_edges = self
            .store
            .edges_in_window(&[EdgeLabel::IsPartOf], &branch_names, &self.diff_from)
            .await?;
        anchor_edges.sort_by_key(|e| (e.source, e.from));

        for edge in &anchor_edges {
            // An interval closed before the end of the window is not the
            // edge that defines this node at diff_to.
            if edge.to.map_or(false, |to| to < self.diff_to) {
                continue;
            }
            let Some(vertex) = self.store.get_vertex(&edge.source).await? else {
                continue;
            };
            let Some(node_uuid) = vertex.entity_uuid() else {
                continue;
            };
            let action = match edge.status {
                EdgeStatus::Active => DiffAction::Added,
                EdgeStatus::Deleted => DiffAction::Removed,
            };

            self.changes_mut(&edge.branch).nodes.insert(
                node_uuid,
                NodeDiffElement {
                    branch: Some(edge.branch.clone()),
                    labels: vertex.labels.clone(),
                    uuid: node_uuid,
                    action,
                    db_id: vertex.id,
                    rel_id: Some(edge.id),
                    changed_at: Some(edge.from),
                    attributes: HashMap::new(),
                },
            );
        }

        // ------------------------------------------------------------
        // Attributes that have been added, updated, or removed. The
        // properties are processed in a second pass once the origin
        // values have been queried.
        // ------------------------------------------------------------
        let rows = self.attribute_diff_rows(&branch_names, &score_filter).await?;

        let mut origin_nodes: HashSet<Uuid> = HashSet::new();
        for row in &rows {
            let branch_name = row.prop_edge.branch.clone();

            if !self.changes_mut(&branch_name).nodes.contains_key(&row.node_uuid) {
                self.changes_mut(&branch_name).nodes.insert(
                    row.node_uuid,
                    NodeDiffElement {
                        branch: None,
                        labels: row.node_labels.clone(),
                        uuid: row.node_uuid,
                        action: DiffAction::Updated,
                        db_id: row.node_db_id,
                        rel_id: None,
                        changed_at: None,
                        attributes: HashMap::new(),
                    },
                );
            }

            let diff_to = self.diff_to;
            let diff_from = self.diff_from;
            let node = self
                .changes_mut(&branch_name)
                .nodes
                .get_mut(&row.node_uuid)
                .ok_or_else(|| ArborError::Internal("node change vanished".into()))?;
            let node_action = node.action;

            if node.attributes.contains_key(&row.attr_name) {
                continue;
            }

            let attr_from = row.has_attribute.from;
            if row.has_attribute.to.map_or(false, |to| to < diff_to) {
                continue;
            }

            let (action, changed_at) = if node_action == DiffAction::Added
                && attr_from >= diff_from
                && row.has_attribute.status == EdgeStatus::Active
            {
                (DiffAction::Added, Some(attr_from))
            } else if attr_from >= diff_from && row.has_attribute.status == EdgeStatus::Deleted {
                origin_nodes.insert(row.node_uuid);
                (DiffAction::Removed, Some(attr_from))
            } else {
                origin_nodes.insert(row.node_uuid);
                (DiffAction::Updated, None)
            };

            node.attributes.insert(
                row.attr_name.clone(),
                NodeAttributeDiffElement {
                    uuid: row.attr_uuid,
                    name: row.attr_name.clone(),
                    action,
                    db_id: row.attr_db_id,
                    rel_id: row.has_attribute.id,
                    origin_rel_id: None,
                    changed_at,
                    properties: HashMap::new(),
                },
            );
        }

        // ------------------------------------------------------------
        // Query the origin branch at diff_to for the current value of
        // every updated or removed attribute, then classify properties.
        // ------------------------------------------------------------
        let origin_filter = self.origin_branch.filter_at(self.diff_to);
        let manager = NodeManager::new(self.store, self.registry);
        let origin_ids: Vec<Uuid> = origin_nodes.into_iter().collect();
        let origin_rows = manager
            .attribute_rows_by_node_uuid(&origin_ids, &origin_filter)
            .await?;
        let origin_by_key: HashMap<(Uuid, String), &crate::store::manager::AttributeRow> = origin_rows
            .iter()
            .map(|row| ((row.node_uuid, row.attr_name.clone()), row))
            .collect();

        for row in &rows {
            let branch_name = row.prop_edge.branch.clone();
            let prop_from = row.prop_edge.from;
            if row.prop_edge.to.map_or(false, |to| to < self.diff_to) {
                continue;
            }

            let origin_attr = origin_by_key.get(&(row.node_uuid, row.attr_name.clone()));
            let origin_rel_id = origin_attr
                .and_then(|attr| attr.properties.get(&row.prop_edge.label))
                .map(|slot| slot.edge.id);

            let action = if origin_attr.is_none()
                && prop_from >= self.diff_from
                && row.prop_edge.status == EdgeStatus::Active
            {
                DiffAction::Added
            } else if prop_from >= self.diff_from && row.prop_edge.status == EdgeStatus::Deleted {
                DiffAction::Removed
            } else {
                DiffAction::Updated
            };

            let attr_origin_rel_id = origin_attr.map(|attr| attr.has_attribute.id);
            let Some(node) = self.changes_mut(&branch_name).nodes.get_mut(&row.node_uuid) else {
                continue;
            };
            let Some(attr) = node.attributes.get_mut(&row.attr_name) else {
                continue;
            };
            attr.origin_rel_id = attr_origin_rel_id;
            attr.properties.insert(
                row.prop_edge.label,
                PropertyDiffElement {
                    branch: branch_name.clone(),
                    kind: row.prop_edge.label,
                    action,
                    db_id: row.prop_vertex_id,
                    rel_id: row.prop_edge.id,
                    origin_rel_id,
                    changed_at: Some(prop_from),
                },
            );
        }

        Ok(())
    }

    /// Candidate attribute-property rows in the diff window, de-duplicated
    /// per `(node, branch, attribute, property)` by branch score.
    async fn attribute_diff_rows(
        &self,
        branch_names: &[String],
        score_filter: &BranchFilter,
    ) -> ArborResult<Vec<AttrDiffRow>> {
        let prop_edges = self
            .store
            .edges_in_window(&EdgeLabel::ATTRIBUTE_PROPERTIES, branch_names, &self.diff_from)
            .await?;

        let mut rows = Vec::new();
        for edge in prop_edges {
            let Some(attr_vertex) = self.store.get_vertex(&edge.source).await? else {
                continue;
            };
            // The same property labels also hang off Relationship vertices.
            if !attr_vertex.has_label(vertex_labels::ATTRIBUTE) {
                continue;
            }

            let Some(has_attribute) =
                self.pick_owner_edge(&attr_vertex, EdgeLabel::HasAttribute, &edge.branch, score_filter).await?
            else {
                continue;
            };
            let Some(node_vertex) = self.store.get_vertex(&has_attribute.source).await? else {
                continue;
            };
            let Some(node_uuid) = node_vertex.entity_uuid() else {
                continue;
            };

            rows.push(AttrDiffRow {
                node_uuid,
                node_db_id: node_vertex.id,
                node_labels: node_vertex.labels.clone(),
                attr_uuid: attr_vertex.entity_uuid().unwrap_or_else(Uuid::new_v4),
                attr_db_id: attr_vertex.id,
                attr_name: attr_vertex.property_str("name").unwrap_or_default().to_string(),
                has_attribute,
                prop_vertex_id: edge.target,
                prop_edge: edge,
            });
        }

        // The branch-query set can produce the same logical change through
        // both parent and child visibility; keep the highest branch score.
        let mut best: HashMap<(Uuid, String, String, EdgeLabel), AttrDiffRow> = HashMap::new();
        for row in rows {
            let key = (
                row.node_uuid,
                row.prop_edge.branch.clone(),
                row.attr_name.clone(),
                row.prop_edge.label,
            );
            match best.get(&key) {
                Some(existing)
                    if (score_filter.branch_score(&existing.prop_edge.branch), existing.prop_edge.from)
                        >= (score_filter.branch_score(&row.prop_edge.branch), row.prop_edge.from) => {}
                _ => {
                    best.insert(key, row);
                }
            }
        }

        let mut deduped: Vec<AttrDiffRow> = best.into_values().collect();
        deduped.sort_by(|a, b| {
            (a.node_uuid, &a.attr_name, a.prop_edge.label).cmp(&(b.node_uuid, &b.attr_name, b.prop_edge.label))
        });
        Ok(deduped)
    }

    /// The HAS_ATTRIBUTE edge owning an attribute vertex, preferring the
    /// edge on the same branch as the property change.
    async fn pick_owner_edge(
        &self,
        attr_vertex: &VertexRecord,
        label: EdgeLabel,
        branch: &str,
        score_filter: &BranchFilter,
    ) -> ArborResult<Option<EdgeRecord>> {
        let candidates = self.store.edges_to(&attr_vertex.id, Some(&[label])).await?;
        if let Some(same_branch) = candidates
            .iter()
            .filter(|e| e.branch == branch)
            .max_by_key(|e| e.from)
        {
            return Ok(Some(same_branch.clone()));
        }
        Ok(candidates
            .iter()
            .max_by_key(|e| (score_filter.branch_score(&e.branch), e.from))
            .cloned())
    }

    // -----------------------------------------------------------------------
    // Relationships
    // -----------------------------------------------------------------------

    async fn ensure_rels(&mut self) -> ArborResult<()> {
        if self.rels_calculated {
            return Ok(());
        }
        self.calculate_diff_rels().await?;
        self.rels_calculated = true;
        Ok(())
    }

    fn in_rel_window(&self, edge: &EdgeRecord) -> bool {
        edge.from >= self.diff_from
            && edge.from <= self.diff_to
            && edge.to.map_or(true, |to| to >= self.diff_from && to <= self.diff_to)
    }

    async fn calculate_diff_rels(&mut self) -> ArborResult<()> {
        let branch_names = self.branch.diff_branch_names();
        let score_filter = self.branch.filter_at(self.diff_to);
        let mut rel_uuids_to_query: Vec<Uuid> = Vec::new();

        // ------------------------------------------------------------
        // The main path: endpoint pairs added or deleted in the window
        // ------------------------------------------------------------
        let endpoint_edges = self
            .store
            .edges_in_window(&[EdgeLabel::IsRelated], &branch_names, &self.diff_from)
            .await?;

        let mut per_rel_vertex: HashMap<Uuid, Vec<&EdgeRecord>> = HashMap::new();
        for edge in &endpoint_edges {
            if self.in_rel_window(edge) {
                per_rel_vertex.entry(edge.target).or_default().push(edge);
            }
        }

        // De-duplicate by (branch, sorted endpoints, rel name): the same
        // path is found once from each direction.
        let mut best_pairs: HashMap<(String, Uuid, Uuid, String), EndpointPair> = HashMap::new();
        for (rel_db_id, candidates) in per_rel_vertex {
            let Some(rel_vertex) = self.store.get_vertex(&rel_db_id).await? else {
                continue;
            };
            let rel_name = rel_vertex.property_str("name").unwrap_or_default().to_string();

            for pair in matching_pairs(&candidates) {
                let Some(first_vertex) = self.store.get_vertex(&pair.0.source).await? else {
                    continue;
                };
                let Some(second_vertex) = self.store.get_vertex(&pair.1.source).await? else {
                    continue;
                };
                let Some(first_uuid) = first_vertex.entity_uuid() else { continue };
                let Some(second_uuid) = second_vertex.entity_uuid() else { continue };

                let mut endpoints = [first_uuid, second_uuid];
                endpoints.sort();
                let key = (pair.0.branch.clone(), endpoints[0], endpoints[1], rel_name.clone());
                let entry = EndpointPair {
                    rel_vertex: rel_vertex.clone(),
                    first_edge: pair.0.clone(),
                    first_vertex,
                    second_edge: pair.1.clone(),
                    second_vertex,
                };
                match best_pairs.get(&key) {
                    Some(existing)
                        if (
                            score_filter.branch_score(&existing.first_edge.branch),
                            existing.first_edge.from,
                        ) >= (score_filter.branch_score(&entry.first_edge.branch), entry.first_edge.from) => {}
                    _ => {
                        best_pairs.insert(key, entry);
                    }
                }
            }
        }

        for pair in best_pairs.into_values() {
            let branch_name = pair.first_edge.branch.clone();
            let Some(rel_uuid) = pair.rel_vertex.entity_uuid() else { continue };
            let rel_name = pair.rel_vertex.property_str("name").unwrap_or_default().to_string();

            let action = match pair.first_edge.status {
                EdgeStatus::Active => DiffAction::Added,
                EdgeStatus::Deleted => {
                    rel_uuids_to_query.push(rel_uuid);
                    DiffAction::Removed
                }
            };

            let element = RelationshipDiffElement {
                branch: Some(branch_name.clone()),
                uuid: rel_uuid,
                db_id: pair.rel_vertex.id,
                name: rel_name.clone(),
                action,
                nodes: pair.endpoint_elements(),
                properties: HashMap::new(),
                changed_at: Some(pair.first_edge.from),
            };

            self.changes_mut(&branch_name)
                .rels
                .entry(rel_name)
                .or_default()
                .insert(rel_uuid, element);
        }

        // ------------------------------------------------------------
        // Property edges of relationships changed in the window
        // ------------------------------------------------------------
        let prop_edges = self
            .store
            .edges_in_window(&EdgeLabel::RELATIONSHIP_PROPERTIES, &branch_names, &self.diff_from)
            .await?;
        let path_filter = self.branch.filter_at(self.diff_to);

        let mut prop_rows: Vec<RelPropRow> = Vec::new();
        for edge in prop_edges {
            if !self.in_rel_window(&edge) {
                continue;
            }
            let Some(rel_vertex) = self.store.get_vertex(&edge.source).await? else {
                continue;
            };
            if !rel_vertex.has_label(vertex_labels::RELATIONSHIP) {
                continue;
            }

            // The endpoint pair must be visible on the path at diff_to.
            let endpoint_edges = self
                .store
                .edges_to(&rel_vertex.id, Some(&[EdgeLabel::IsRelated]))
                .await?;
            let visible: Vec<&EdgeRecord> = endpoint_edges
                .iter()
                .filter(|e| path_filter.interval_matches(e))
                .collect();
            let Some(pair) = matching_pairs(&visible)
                .into_iter()
                .max_by_key(|p| (score_filter.branch_score(&p.0.branch), p.0.from))
            else {
                continue;
            };
            let Some(first_vertex) = self.store.get_vertex(&pair.0.source).await? else { continue };
            let Some(second_vertex) = self.store.get_vertex(&pair.1.source).await? else { continue };

            prop_rows.push(RelPropRow {
                pair: EndpointPair {
                    rel_vertex,
                    first_edge: pair.0.clone(),
                    first_vertex,
                    second_edge: pair.1.clone(),
                    second_vertex,
                },
                prop_edge: edge,
            });
        }

        // De-duplicate: (branch, sorted endpoints, rel name, property kind).
        let mut best_props: HashMap<(String, Uuid, Uuid, String, EdgeLabel), RelPropRow> = HashMap::new();
        for row in prop_rows {
            let (Some(first_uuid), Some(second_uuid)) =
                (row.pair.first_vertex.entity_uuid(), row.pair.second_vertex.entity_uuid())
            else {
                continue;
            };
            let mut endpoints = [first_uuid, second_uuid];
            endpoints.sort();
            let rel_name = row.pair.rel_vertex.property_str("name").unwrap_or_default().to_string();
            let key = (
                row.prop_edge.branch.clone(),
                endpoints[0],
                endpoints[1],
                rel_name,
                row.prop_edge.label,
            );
            match best_props.get(&key) {
                Some(existing)
                    if (score_filter.branch_score(&existing.prop_edge.branch), existing.prop_edge.from)
                        >= (score_filter.branch_score(&row.prop_edge.branch), row.prop_edge.from) => {}
                _ => {
                    best_props.insert(key, row);
                }
            }
        }
        let mut prop_rows: Vec<RelPropRow> = best_props.into_values().collect();
        prop_rows.sort_by_key(|row| (row.prop_edge.source, row.prop_edge.label, row.prop_edge.from));

        // Relationships only present because a property changed.
        for row in &prop_rows {
            let branch_name = row.prop_edge.branch.clone();
            let Some(rel_uuid) = row.pair.rel_vertex.entity_uuid() else { continue };
            let rel_name = row.pair.rel_vertex.property_str("name").unwrap_or_default().to_string();

            let exists = self
                .results
                .get(&branch_name)
                .and_then(|data| data.rels.get(&rel_name))
                .map_or(false, |rels| rels.contains_key(&rel_uuid));
            if exists {
                continue;
            }

            let element = RelationshipDiffElement {
                branch: None,
                uuid: rel_uuid,
                db_id: row.pair.rel_vertex.id,
                name: rel_name.clone(),
                action: DiffAction::Updated,
                nodes: row.pair.endpoint_elements(),
                properties: HashMap::new(),
                changed_at: None,
            };
            self.changes_mut(&branch_name)
                .rels
                .entry(rel_name)
                .or_default()
                .insert(rel_uuid, element);
            rel_uuids_to_query.push(rel_uuid);
        }

        // ------------------------------------------------------------
        // Join with the origin branch for superseded edge ids
        // ------------------------------------------------------------
        let origin_filter = self.origin_branch.filter_at(self.diff_to);
        let manager = NodeManager::new(self.store, self.registry);
        let origin_props = manager
            .relationship_property_edges(&rel_uuids_to_query, &origin_filter)
            .await?;

        for row in &prop_rows {
            let branch_name = row.prop_edge.branch.clone();
            let Some(rel_uuid) = row.pair.rel_vertex.entity_uuid() else { continue };
            let rel_name = row.pair.rel_vertex.property_str("name").unwrap_or_default().to_string();
            let prop_from = row.prop_edge.from;

            let origin_prop = origin_props.get(&(rel_uuid, row.prop_edge.label));
            let action = if origin_prop.is_none()
                && prop_from >= self.diff_from
                && row.prop_edge.status == EdgeStatus::Active
            {
                DiffAction::Added
            } else if prop_from >= self.diff_from && row.prop_edge.status == EdgeStatus::Deleted {
                DiffAction::Removed
            } else {
                DiffAction::Updated
            };

            let element = PropertyDiffElement {
                branch: branch_name.clone(),
                kind: row.prop_edge.label,
                action,
                db_id: row.prop_edge.target,
                rel_id: row.prop_edge.id,
                origin_rel_id: origin_prop.map(|edge| edge.id),
                changed_at: Some(prop_from),
            };

            if let Some(rel) = self
                .changes_mut(&branch_name)
                .rels
                .get_mut(&rel_name)
                .and_then(|rels| rels.get_mut(&rel_uuid))
            {
                rel.properties.insert(row.prop_edge.label, element);
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    async fn ensure_files(&mut self) -> ArborResult<()> {
        if self.files_calculated {
            return Ok(());
        }

        let Some(connector) = self.registry.repository_connector() else {
            self.files_calculated = true;
            return Ok(());
        };

        let origin_repos: HashMap<Uuid, _> = connector
            .list_repositories(&self.origin_branch.name)
            .await?
            .into_iter()
            .map(|repo| (repo.uuid, repo))
            .collect();

        let mut files = Vec::new();
        for repo in connector.list_repositories(&self.branch.name).await? {
            let Some(origin_repo) = origin_repos.get(&repo.uuid) else {
                continue;
            };
            let changed = connector.diff_against_commit(&repo, &origin_repo.commit).await?;
            if changed.is_empty() {
                continue;
            }
            files.push(RepositoryFileDiff {
                branch: self.branch.name.clone(),
                repository_uuid: repo.uuid,
                repository_name: repo.name.clone(),
                files: changed,
            });
        }

        let branch_name = self.branch.name.clone();
        self.changes_mut(&branch_name).files = files;
        self.files_calculated = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct AttrDiffRow {
    node_uuid: Uuid,
    node_db_id: Uuid,
    node_labels: Vec<String>,
    attr_uuid: Uuid,
    attr_db_id: Uuid,
    attr_name: String,
    has_attribute: EdgeRecord,
    prop_edge: EdgeRecord,
    prop_vertex_id: Uuid,
}

struct EndpointPair {
    rel_vertex: VertexRecord,
    first_edge: EdgeRecord,
    first_vertex: VertexRecord,
    second_edge: EdgeRecord,
    second_vertex: VertexRecord,
}

impl EndpointPair {
    fn endpoint_elements(&self) -> HashMap<Uuid, RelationshipEdgeNodeDiffElement> {
        let mut nodes = HashMap::new();
        for (edge, vertex) in [(&self.first_edge, &self.first_vertex), (&self.second_edge, &self.second_vertex)] {
            if let Some(uuid) = vertex.entity_uuid() {
                nodes.insert(
                    uuid,
                    RelationshipEdgeNodeDiffElement {
                        uuid,
                        db_id: vertex.id,
                        rel_id: edge.id,
                        labels: vertex.labels.clone(),
                    },
                );
            }
        }
        nodes
    }
}

struct RelPropRow {
    pair: EndpointPair,
    prop_edge: EdgeRecord,
}

/// Endpoint edges pair up when they share branch, interval, and status:
/// the two IS_RELATED edges of one relationship are written as a group.
fn matching_pairs<'e>(candidates: &[&'e EdgeRecord]) -> Vec<(&'e EdgeRecord, &'e EdgeRecord)> {
    let mut groups: HashMap<(String, Timestamp, Option<Timestamp>, EdgeStatus), Vec<&'e EdgeRecord>> =
        HashMap::new();
    for &edge in candidates {
        let key = (edge.branch.clone(), edge.from, edge.to, edge.status);
        groups.entry(key).or_default().push(edge);
    }

    let mut pairs = Vec::new();
    for mut group in groups.into_values() {
        if group.len() == 2 {
            group.sort_by_key(|e| e.source);
            pairs.push((group[0], group[1]));
        }
    }
    pairs
}
