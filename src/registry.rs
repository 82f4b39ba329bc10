use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

use tokio::sync::RwLock;

use crate::error::{ArborError, ArborResult};
use crate::lock::LockRegistry;
use crate::model::branch::{Branch, DEFAULT_BRANCH_NAME, GLOBAL_BRANCH_NAME};
use crate::repository::RepositoryConnector;
use crate::schema::{NodeSchema, SchemaRegistry};

// ---------------------------------------------------------------------------
// Registry: process-wide state, owned by the application root
// ---------------------------------------------------------------------------

/// The single value holding process-wide state: the default-branch pointer,
/// the branch map, the schema registry, the named-lock registry, and the
/// optional repository connector. Owned by the application root and passed
/// by reference to every call that needs it; never a global.
pub struct Registry {
    default_branch: StdRwLock<String>,
    branches: RwLock<HashMap<String, Branch>>,
    global_branch: StdRwLock<Option<Branch>>,
    pub schema: SchemaRegistry,
    pub locks: LockRegistry,
    repositories: StdRwLock<Option<Arc<dyn RepositoryConnector>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            default_branch: StdRwLock::new(DEFAULT_BRANCH_NAME.to_string()),
            branches: RwLock::new(HashMap::new()),
            global_branch: StdRwLock::new(None),
            schema: SchemaRegistry::new(),
            locks: LockRegistry::new(),
            repositories: StdRwLock::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Branches
    // -----------------------------------------------------------------------

    pub fn default_branch_name(&self) -> String {
        self.default_branch
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_default_branch_name(&self, name: impl Into<String>) {
        *self.default_branch.write().unwrap_or_else(|e| e.into_inner()) = name.into();
    }

    /// Look up a branch by name; the global branch resolves like any other.
    pub async fn get_branch(&self, name: &str) -> ArborResult<Branch> {
        if name == GLOBAL_BRANCH_NAME {
            return self.global_branch_record();
        }
        self.branches
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ArborError::BranchNotFound(name.to_string()))
    }

    pub async fn set_branch(&self, branch: Branch) {
        if branch.name == GLOBAL_BRANCH_NAME {
            *self.global_branch.write().unwrap_or_else(|e| e.into_inner()) = Some(branch);
            return;
        }
        self.branches.write().await.insert(branch.name.clone(), branch);
    }

    pub async fn remove_branch(&self, name: &str) {
        self.branches.write().await.remove(name);
    }

    pub async fn default_branch(&self) -> ArborResult<Branch> {
        let name = self.default_branch_name();
        self.get_branch(&name).await
    }

    /// The synthetic global branch; available synchronously because the
    /// entity layer consults it on non-suspending paths.
    pub fn global_branch_record(&self) -> ArborResult<Branch> {
        self.global_branch
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| ArborError::BranchNotFound(GLOBAL_BRANCH_NAME.to_string()))
    }

    pub async fn branch_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.branches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    // -----------------------------------------------------------------------
    // Schemas
    // -----------------------------------------------------------------------

    /// Resolve a schema at a branch, falling back to the default branch.
    pub async fn schema_for(&self, kind: &str, branch: &str) -> ArborResult<Arc<NodeSchema>> {
        let default = self.default_branch_name();
        self.schema.get(kind, branch, &default).await
    }

    pub async fn has_schema(&self, kind: &str, branch: &str) -> bool {
        let default = self.default_branch_name();
        self.schema.has(kind, branch, &default).await
    }

    // -----------------------------------------------------------------------
    // Repository connector
    // -----------------------------------------------------------------------

    pub fn set_repository_connector(&self, connector: Arc<dyn RepositoryConnector>) {
        *self.repositories.write().unwrap_or_else(|e| e.into_inner()) = Some(connector);
    }

    pub fn repository_connector(&self) -> Option<Arc<dyn RepositoryConnector>> {
        self.repositories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_branch_lookup() {
        let registry = Registry::new();
        assert!(registry.get_branch("main").await.is_err());

        registry.set_branch(Branch::default_branch()).await;
        let branch = registry.get_branch("main").await.unwrap();
        assert!(branch.is_default);
        assert_eq!(registry.default_branch().await.unwrap().name, "main");
    }

    #[tokio::test]
    async fn test_global_branch_is_sync() {
        let registry = Registry::new();
        assert!(registry.global_branch_record().is_err());

        registry.set_branch(Branch::global_branch()).await;
        let global = registry.global_branch_record().unwrap();
        assert_eq!(global.name, GLOBAL_BRANCH_NAME);
        assert_eq!(registry.get_branch(GLOBAL_BRANCH_NAME).await.unwrap().name, GLOBAL_BRANCH_NAME);
    }
}
