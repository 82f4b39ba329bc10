use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ArborError, ArborResult};
use crate::model::edge::{vertex_labels, EdgeRecord, EdgeStatus, VertexRecord};
use crate::model::timestamp::Timestamp;
use crate::store::graph::TemporalStore;

/// Name of the distinguished merge target.
pub const DEFAULT_BRANCH_NAME: &str = "main";

/// Synthetic branch under which branch-agnostic entities are stored so all
/// user branches share a single copy.
pub const GLOBAL_BRANCH_NAME: &str = "-global-";

// ---------------------------------------------------------------------------
// Branch: a named, time-anchored versioning scope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BranchStatus {
    Open,
    Closed,
}

/// A branch record. Every edge in the store carries the name of exactly one
/// branch; a branch diverges from its origin at `branched_from`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub status: BranchStatus,
    #[serde(default)]
    pub description: Option<String>,
    pub origin_branch: String,
    pub branched_from: Timestamp,
    pub is_default: bool,
    pub is_protected: bool,
    pub is_data_only: bool,
    pub hierarchy_level: u8,
    #[serde(default)]
    pub active_schema_hash: String,
    /// Per-query hint: pretend the branch was just rebased, so reads see the
    /// origin at the query time instead of at `branched_from`. Never persisted.
    #[serde(skip)]
    pub ephemeral_rebase: bool,
    /// Storage id of the Branch vertex, set once persisted.
    #[serde(skip)]
    pub db_id: Option<Uuid>,
}

impl Branch {
    /// A new open branch diverging from `origin` now.
    pub fn new(name: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: BranchStatus::Open,
            description: None,
            origin_branch: origin.into(),
            branched_from: Timestamp::now(),
            is_default: false,
            is_protected: false,
            is_data_only: false,
            hierarchy_level: 2,
            active_schema_hash: String::new(),
            ephemeral_rebase: false,
            db_id: None,
        }
    }

    /// The default branch record created at first-time initialization.
    pub fn default_branch() -> Self {
        Self::default_branch_named(DEFAULT_BRANCH_NAME)
    }

    /// A default branch under a configured name.
    pub fn default_branch_named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            origin_branch: name.clone(),
            name,
            status: BranchStatus::Open,
            description: Some("Default branch".to_string()),
            branched_from: Timestamp::now(),
            is_default: true,
            is_protected: true,
            is_data_only: false,
            hierarchy_level: 1,
            active_schema_hash: String::new(),
            ephemeral_rebase: false,
            db_id: None,
        }
    }

    /// The synthetic global branch holding branch-agnostic entities.
    pub fn global_branch() -> Self {
        Self {
            name: GLOBAL_BRANCH_NAME.to_string(),
            status: BranchStatus::Open,
            description: Some("Global branch for branch-agnostic entities".to_string()),
            origin_branch: GLOBAL_BRANCH_NAME.to_string(),
            branched_from: Timestamp::now(),
            is_default: false,
            is_protected: true,
            is_data_only: true,
            hierarchy_level: 1,
            active_schema_hash: String::new(),
            ephemeral_rebase: false,
            db_id: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    // -----------------------------------------------------------------------
    // Branch-query set: which (branch, time) pairs constitute this branch
    // -----------------------------------------------------------------------

    /// All the branches constituting this branch, with the time at which each
    /// must be read. For the default branch this is the branch itself; for
    /// any other branch it is the origin frozen at `branched_from` plus the
    /// branch itself at the query time.
    pub fn branches_and_times_to_query(&self, at: Timestamp) -> Vec<BranchSlice> {
        if self.is_default || self.name == self.origin_branch {
            return vec![BranchSlice {
                branch: self.name.clone(),
                at,
            }];
        }

        let mut origin_at = self.branched_from;

        // When querying before the beginning of the branch, the origin must
        // be read at the query time itself.
        if self.ephemeral_rebase || at < self.branched_from {
            origin_at = at;
        }

        vec![
            BranchSlice {
                branch: self.origin_branch.clone(),
                at: origin_at,
            },
            BranchSlice {
                branch: self.name.clone(),
                at,
            },
        ]
    }

    /// The read-time filter for this branch at `at`.
    pub fn filter_at(&self, at: Timestamp) -> BranchFilter {
        BranchFilter {
            slices: self.branches_and_times_to_query(at),
        }
    }

    /// The branch names consulted by a diff: the branch itself, plus its
    /// origin unless this is the default branch.
    pub fn diff_branch_names(&self) -> Vec<String> {
        if self.is_default {
            vec![self.name.clone()]
        } else {
            vec![self.name.clone(), self.origin_branch.clone()]
        }
    }

    // -----------------------------------------------------------------------
    // Persistence as a Branch vertex
    // -----------------------------------------------------------------------

    pub fn to_vertex(&self) -> ArborResult<VertexRecord> {
        let props = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => return Err(ArborError::Internal("branch did not serialize to an object".into())),
        };
        Ok(VertexRecord {
            id: self.db_id.unwrap_or_else(Uuid::new_v4),
            labels: vec![vertex_labels::BRANCH.to_string()],
            properties: props,
        })
    }

    pub fn from_vertex(vertex: &VertexRecord) -> ArborResult<Branch> {
        let mut branch: Branch = serde_json::from_value(Value::Object(vertex.properties.clone()))?;
        branch.db_id = Some(vertex.id);
        Ok(branch)
    }

    /// Load a branch by name directly from the store.
    pub async fn get_by_name(store: &dyn TemporalStore, name: &str) -> ArborResult<Branch> {
        let vertices = store.vertices_with_label(vertex_labels::BRANCH).await?;
        vertices
            .iter()
            .find(|v| v.property_str("name") == Some(name))
            .map(Branch::from_vertex)
            .transpose()?
            .ok_or_else(|| ArborError::BranchNotFound(name.to_string()))
    }

    /// Create or update the Branch vertex.
    pub async fn save(&mut self, store: &dyn TemporalStore) -> ArborResult<()> {
        let vertex = self.to_vertex()?;
        if self.db_id.is_some() {
            store.update_vertex(vertex).await
        } else {
            self.db_id = Some(vertex.id);
            store.add_vertex(vertex).await
        }
    }

    /// Advance `branched_from` to now and persist, so subsequent diffs start
    /// from a fresh divergence point.
    pub async fn rebase(&mut self, store: &dyn TemporalStore) -> ArborResult<()> {
        self.branched_from = Timestamp::now();
        self.save(store).await
    }
}

// ---------------------------------------------------------------------------
// BranchFilter: the visibility predicate over edges
// ---------------------------------------------------------------------------

/// One `(branch, time)` entry of a branch-query set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSlice {
    pub branch: String,
    pub at: Timestamp,
}

/// The read-time predicate selecting the slice of history visible from a
/// `(branch, time)` pair. Every read operation goes through this filter; no
/// ad-hoc temporal filtering is permitted elsewhere.
#[derive(Debug, Clone)]
pub struct BranchFilter {
    slices: Vec<BranchSlice>,
}

impl BranchFilter {
    pub fn slices(&self) -> &[BranchSlice] {
        &self.slices
    }

    pub fn branch_names(&self) -> Vec<String> {
        self.slices.iter().map(|s| s.branch.clone()).collect()
    }

    /// Whether the edge's branch and validity interval match one of the
    /// slices, irrespective of edge status.
    pub fn interval_matches(&self, edge: &EdgeRecord) -> bool {
        self.slices
            .iter()
            .any(|s| s.branch == edge.branch && edge.interval_contains(&s.at))
    }

    /// The full visibility predicate: interval match plus ACTIVE status.
    pub fn is_visible(&self, edge: &EdgeRecord) -> bool {
        edge.status == EdgeStatus::Active && self.interval_matches(edge)
    }

    /// Tie-break score for a branch: entries later in the branch-query set
    /// (the queried branch itself) beat earlier ones (the origin), so a
    /// change is always attributed to the branch where it actually occurred.
    pub fn branch_score(&self, branch: &str) -> usize {
        self.slices
            .iter()
            .position(|s| s.branch == branch)
            .map(|idx| idx + 1)
            .unwrap_or(0)
    }

    /// Resolve a group of candidate edges for one logical cell: keep the
    /// interval-matching edge with the highest branch score (latest `from`
    /// wins within a branch), then require it to be ACTIVE.
    pub fn pick_active<'a>(&self, candidates: &[&'a EdgeRecord]) -> Option<&'a EdgeRecord> {
        self.pick_latest(candidates)
            .filter(|edge| edge.status == EdgeStatus::Active)
    }

    /// Like `pick_active` but without the status requirement; used where the
    /// caller needs to observe a DELETED winner (e.g. shadowed deletions).
    pub fn pick_latest<'a>(&self, candidates: &[&'a EdgeRecord]) -> Option<&'a EdgeRecord> {
        candidates
            .iter()
            .filter(|edge| self.interval_matches(edge))
            .max_by_key(|edge| (self.branch_score(&edge.branch), edge.from))
            .copied()
    }

    // -----------------------------------------------------------------------
    // Rendered WHERE clauses for the graph backend
    // -----------------------------------------------------------------------

    /// Render the predicate over a single edge alias as a parameterised
    /// WHERE fragment, returning the fragment and its bind values.
    pub fn where_clause(&self, alias: &str) -> (String, Vec<(String, Value)>) {
        self.where_clause_many(&[alias])
    }

    /// Render the predicate applied to several edge aliases simultaneously
    /// (attribute + value joins); every alias must independently satisfy it.
    pub fn where_clause_many(&self, aliases: &[&str]) -> (String, Vec<(String, Value)>) {
        let mut params: Vec<(String, Value)> = Vec::new();
        for (idx, slice) in self.slices.iter().enumerate() {
            params.push((format!("branch{}", idx), Value::String(slice.branch.clone())));
            params.push((format!("time{}", idx), Value::String(slice.at.to_rfc3339())));
        }

        let mut per_alias = Vec::new();
        for alias in aliases {
            let mut options = Vec::new();
            for idx in 0..self.slices.len() {
                options.push(format!(
                    "({a}.branch = $branch{i} AND {a}.`from` <= $time{i} AND ({a}.`to` IS NONE OR {a}.`to` >= $time{i}))",
                    a = alias,
                    i = idx,
                ));
            }
            per_alias.push(format!("({})", options.join(" OR ")));
        }

        (per_alias.join(" AND "), params)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::edge::EdgeLabel;

    fn edge_on(branch: &str, from: Timestamp, to: Option<Timestamp>, status: EdgeStatus) -> EdgeRecord {
        let mut edge = EdgeRecord::new(
            EdgeLabel::IsPartOf,
            Uuid::new_v4(),
            Uuid::new_v4(),
            branch,
            1,
            from,
            status,
        );
        edge.to = to;
        edge
    }

    #[test]
    fn test_default_branch_queries_itself_only() {
        let branch = Branch::default_branch();
        let at = Timestamp::now();
        let slices = branch.branches_and_times_to_query(at);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].branch, "main");
        assert_eq!(slices[0].at, at);
    }

    #[test]
    fn test_branch_queries_origin_at_branch_point() {
        let mut branch = Branch::new("change-dc1", "main");
        let t0 = branch.branched_from;
        let at = t0.add_micros(100);

        let slices = branch.branches_and_times_to_query(at);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0], BranchSlice { branch: "main".into(), at: t0 });
        assert_eq!(slices[1], BranchSlice { branch: "change-dc1".into(), at });

        // Querying before the divergence point reads the origin at the query time.
        let before = t0.add_micros(-10);
        let slices = branch.branches_and_times_to_query(before);
        assert_eq!(slices[0].at, before);

        // ephemeral_rebase forces the same behavior at any time.
        branch.ephemeral_rebase = true;
        let slices = branch.branches_and_times_to_query(at);
        assert_eq!(slices[0].at, at);
    }

    #[test]
    fn test_filter_visibility_and_score() {
        let branch = Branch::new("change-dc1", "main");
        let t0 = branch.branched_from;
        let now = t0.add_micros(100);
        let filter = branch.filter_at(now);

        // Open edge on main created before the branch point: visible.
        let on_main = edge_on("main", t0.add_micros(-50), None, EdgeStatus::Active);
        assert!(filter.is_visible(&on_main));

        // Edge on main created after the branch point: not visible from the branch.
        let late_on_main = edge_on("main", t0.add_micros(50), None, EdgeStatus::Active);
        assert!(!filter.is_visible(&late_on_main));

        // Closed edge whose interval still covers the slice time: visible.
        let closed = edge_on("change-dc1", t0.add_micros(10), Some(now.add_micros(5)), EdgeStatus::Active);
        assert!(filter.is_visible(&closed));

        // The branch outranks its origin.
        assert!(filter.branch_score("change-dc1") > filter.branch_score("main"));
    }

    #[test]
    fn test_pick_active_prefers_branch_and_drops_deleted() {
        let branch = Branch::new("change-dc1", "main");
        let t0 = branch.branched_from;
        let now = t0.add_micros(100);
        let filter = branch.filter_at(now);

        let on_main = edge_on("main", t0.add_micros(-50), None, EdgeStatus::Active);
        let deleted_on_branch = edge_on("change-dc1", t0.add_micros(10), None, EdgeStatus::Deleted);

        // The branch's DELETED edge shadows main's ACTIVE edge: the cell is gone.
        let winner = filter.pick_active(&[&on_main, &deleted_on_branch]);
        assert!(winner.is_none());

        // Without the deletion the main edge is the winner.
        let winner = filter.pick_active(&[&on_main]).unwrap();
        assert_eq!(winner.id, on_main.id);
    }

    #[test]
    fn test_where_clause_binds_one_pair_per_slice() {
        let branch = Branch::new("change-dc1", "main");
        let filter = branch.filter_at(Timestamp::now());
        let (clause, params) = filter.where_clause("r");
        assert!(clause.contains("r.branch = $branch0"));
        assert!(clause.contains("r.branch = $branch1"));
        assert_eq!(params.len(), 4);

        let (multi, _) = filter.where_clause_many(&["r1", "r2"]);
        assert!(multi.contains("r1.branch") && multi.contains("r2.branch"));
    }

    #[test]
    fn test_vertex_roundtrip_excludes_ephemeral_fields() {
        let mut branch = Branch::new("change-dc1", "main").with_description("dc1 changes");
        branch.ephemeral_rebase = true;

        let vertex = branch.to_vertex().unwrap();
        assert!(vertex.property("ephemeral_rebase").is_none());

        let restored = Branch::from_vertex(&vertex).unwrap();
        assert_eq!(restored.name, "change-dc1");
        assert_eq!(restored.origin_branch, "main");
        assert_eq!(restored.branched_from, branch.branched_from);
        assert!(!restored.ephemeral_rebase);
        assert_eq!(restored.db_id, Some(vertex.id));
    }
}
