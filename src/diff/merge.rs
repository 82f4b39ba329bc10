use std::collections::HashMap;

use tracing::{debug, info};
use uuid::Uuid;

use crate::diff::{Diff, DiffAction};
use crate::error::{ArborError, ArborResult, ValidationError};
use crate::model::branch::Branch;
use crate::model::edge::{EdgeLabel, EdgeStatus};
use crate::model::timestamp::Timestamp;
use crate::registry::Registry;
use crate::store::graph::TemporalStore;
use crate::store::manager::{NodeInfo, NodeManager};
use crate::store::{add_relationship, close_relationships, delete_node};

/// Outcome of a branch validation: conflict and repository-check messages.
#[derive(Debug, Clone)]
pub struct BranchValidation {
    pub passed: bool,
    pub messages: Vec<String>,
}

impl Branch {
    /// Build a diff of this branch against its origin.
    pub async fn diff<'a>(
        &self,
        store: &'a dyn TemporalStore,
        registry: &'a Registry,
        branch_only: bool,
        diff_from: Option<Timestamp>,
        diff_to: Option<Timestamp>,
    ) -> ArborResult<Diff<'a>> {
        Diff::new(store, registry, self, branch_only, diff_from, diff_to).await
    }

    /// Validate whether the branch is eligible to be merged: the conflict
    /// set must be empty and every repository check must pass.
    pub async fn validate(
        &self,
        store: &dyn TemporalStore,
        registry: &Registry,
    ) -> ArborResult<BranchValidation> {
        let mut messages = Vec::new();

        let mut diff = self.diff(store, registry, false, None, None).await?;
        for conflict in diff.get_conflicts().await? {
            messages.push(format!("Conflict detected at {}", conflict));
        }

        if let Some(connector) = registry.repository_connector() {
            for repository in connector.list_repositories(&self.name).await? {
                messages.extend(connector.run_checks(&repository).await?);
            }
        }

        Ok(BranchValidation {
            passed: messages.is_empty(),
            messages,
        })
    }

    /// Merge this branch into the default branch: re-play the branch's diff
    /// onto the origin inside one transactional unit, close every superseded
    /// interval at the merge time, merge repositories, and rebase the branch
    /// forward. On failure nothing is applied and `branched_from` does not
    /// advance.
    pub async fn merge(
        &mut self,
        store: &dyn TemporalStore,
        registry: &Registry,
        at: Option<Timestamp>,
    ) -> ArborResult<()> {
        if self.is_default {
            return Err(ArborError::Validation(ValidationError::single(
                "branch",
                format!("unable to merge the branch {} into itself", self.name),
            )));
        }
        if self.hierarchy_level > 2 {
            return Err(ArborError::Integrity(format!(
                "branch {} has hierarchy level {}; multi-level hierarchies are not supported",
                self.name, self.hierarchy_level
            )));
        }

        let _guard = registry.locks.merge(&self.name).await;
        let at = Timestamp::or_now(at);

        // Conflicts abort before any write; repository check failures are
        // aggregated into a validation error.
        let mut diff = self.diff(store, registry, false, None, None).await?;
        let conflicts = diff.get_conflicts().await?;
        if !conflicts.is_empty() {
            return Err(ArborError::Conflict(conflicts));
        }
        let validation = self.validate(store, registry).await?;
        if !validation.passed {
            let mut errors = ValidationError::default();
            for (idx, message) in validation.messages.iter().enumerate() {
                errors.insert(format!("check_{}", idx), message.clone());
            }
            return Err(ArborError::Validation(errors));
        }

        let default_branch = registry.default_branch().await?;
        let default_vertex_id = default_branch
            .db_id
            .ok_or_else(|| ArborError::Integrity(format!("branch {} has no vertex", default_branch.name)))?;

        let nodes = diff.get_nodes().await?;
        let rels = diff.get_relationships().await?;
        let branch_nodes = nodes.get(&self.name).cloned().unwrap_or_default();
        let branch_rels = rels.get(&self.name).cloned().unwrap_or_default();

        // Locate the origin anchors the merge will supersede.
        let node_uuids: Vec<Uuid> = branch_nodes.keys().copied().collect();
        let manager = NodeManager::new(store, registry);
        let origin_info = manager
            .node_info(&node_uuids, &default_branch.filter_at(at))
            .await?;

        info!(branch = %self.name, nodes = branch_nodes.len(), "merging branch");

        // The per-branch lock serialises merges of this branch only; the
        // transaction lock keeps merges of other branches from interleaving
        // their own BEGIN/COMMIT/CANCEL on the shared connection.
        {
            let _transaction_guard = registry.locks.transaction().await;
            store.begin().await?;
            let replayed = replay_changes(
                store,
                &default_branch,
                default_vertex_id,
                &branch_nodes,
                &branch_rels,
                &origin_info,
                at,
            )
            .await;
            if let Err(err) = replayed {
                store.cancel().await?;
                return Err(err);
            }
            store.commit().await?;
        }

        // Repository merge is delegated; repositories missing from the
        // default branch and empty diffs are skipped.
        if let Some(connector) = registry.repository_connector() {
            let origin_repos: HashMap<Uuid, _> = connector
                .list_repositories(&default_branch.name)
                .await?
                .into_iter()
                .map(|repo| (repo.uuid, repo))
                .collect();
            for repository in connector.list_repositories(&self.name).await? {
                let Some(origin_repo) = origin_repos.get(&repository.uuid) else {
                    continue;
                };
                let changed = connector.diff_against_commit(&repository, &origin_repo.commit).await?;
                if changed.is_empty() {
                    continue;
                }
                connector.merge(&repository).await?;
            }
        }

        // Rebase forward so subsequent diffs are computed from a fresh
        // divergence point.
        self.rebase(store).await?;
        registry.set_branch(self.clone()).await;

        info!(branch = %self.name, at = %at, "merge complete");
        Ok(())
    }
}

/// Re-play one branch's change set onto the default branch. Ordering
/// matters: nodes before their attributes, attributes before their
/// properties, endpoints before relationship properties. Every superseded
/// edge id is closed in one batch at the merge time.
async fn replay_changes(
    store: &dyn TemporalStore,
    default_branch: &Branch,
    default_vertex_id: Uuid,
    branch_nodes: &HashMap<Uuid, crate::diff::NodeDiffElement>,
    branch_rels: &HashMap<String, HashMap<Uuid, crate::diff::RelationshipDiffElement>>,
    origin_info: &HashMap<Uuid, NodeInfo>,
    at: Timestamp,
) -> ArborResult<()> {
    let level = default_branch.hierarchy_level;
    let name = default_branch.name.as_str();
    let mut edge_ids_to_close: Vec<Uuid> = Vec::new();

    // ---------------------------------------------
    // Nodes
    // ---------------------------------------------
    let mut node_uuids: Vec<&Uuid> = branch_nodes.keys().collect();
    node_uuids.sort();
    for node_uuid in node_uuids {
        let node = &branch_nodes[node_uuid];
        match node.action {
            DiffAction::Added => {
                add_relationship(
                    store,
                    node.db_id,
                    default_vertex_id,
                    EdgeLabel::IsPartOf,
                    name,
                    level,
                    at,
                    EdgeStatus::Active,
                )
                .await?;
                edge_ids_to_close.extend(node.rel_id);
            }
            DiffAction::Removed => {
                delete_node(store, node.db_id, default_vertex_id, name, level, at).await?;
                edge_ids_to_close.extend(node.rel_id);
                if let Some(info) = origin_info.get(node_uuid) {
                    edge_ids_to_close.push(info.is_part_of.id);
                }
            }
            DiffAction::Updated => {}
        }

        for attr in node.attributes.values() {
            match attr.action {
                DiffAction::Added => {
                    add_relationship(
                        store,
                        node.db_id,
                        attr.db_id,
                        EdgeLabel::HasAttribute,
                        name,
                        level,
                        at,
                        EdgeStatus::Active,
                    )
                    .await?;
                    edge_ids_to_close.push(attr.rel_id);
                }
                DiffAction::Removed => {
                    add_relationship(
                        store,
                        node.db_id,
                        attr.db_id,
                        EdgeLabel::HasAttribute,
                        name,
                        level,
                        at,
                        EdgeStatus::Deleted,
                    )
                    .await?;
                    edge_ids_to_close.push(attr.rel_id);
                    edge_ids_to_close.extend(attr.origin_rel_id);
                }
                // An updated attribute needs no edge replication of its own;
                // its property edges carry the change.
                DiffAction::Updated => {}
            }

            for prop in attr.properties.values() {
                let status = match prop.action {
                    DiffAction::Removed => EdgeStatus::Deleted,
                    _ => EdgeStatus::Active,
                };
                add_relationship(store, attr.db_id, prop.db_id, prop.kind, name, level, at, status).await?;
                edge_ids_to_close.push(prop.rel_id);
                if matches!(prop.action, DiffAction::Updated | DiffAction::Removed) {
                    edge_ids_to_close.extend(prop.origin_rel_id);
                }
            }
        }
    }

    // ---------------------------------------------
    // Relationships
    // ---------------------------------------------
    let mut rel_names: Vec<&String> = branch_rels.keys().collect();
    rel_names.sort();
    for rel_name in rel_names {
        for rel in branch_rels[rel_name].values() {
            if matches!(rel.action, DiffAction::Added | DiffAction::Removed) {
                let status = match rel.action {
                    DiffAction::Removed => EdgeStatus::Deleted,
                    _ => EdgeStatus::Active,
                };
                for endpoint in rel.nodes.values() {
                    add_relationship(
                        store,
                        endpoint.db_id,
                        rel.db_id,
                        EdgeLabel::IsRelated,
                        name,
                        level,
                        at,
                        status,
                    )
                    .await?;
                    edge_ids_to_close.push(endpoint.rel_id);
                }
            }

            for prop in rel.properties.values() {
                let status = match prop.action {
                    DiffAction::Removed => EdgeStatus::Deleted,
                    _ => EdgeStatus::Active,
                };
                add_relationship(store, rel.db_id, prop.db_id, prop.kind, name, level, at, status).await?;
                edge_ids_to_close.push(prop.rel_id);
                if matches!(prop.action, DiffAction::Updated | DiffAction::Removed) {
                    edge_ids_to_close.extend(prop.origin_rel_id);
                }
            }
        }
    }

    debug!(closing = edge_ids_to_close.len(), "closing superseded intervals");
    close_relationships(store, &edge_ids_to_close, at).await?;
    Ok(())
}
