use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ArborResult;

// ---------------------------------------------------------------------------
// Repository collaborator
// ---------------------------------------------------------------------------

/// A repository known to the platform, as seen from one branch.
#[derive(Debug, Clone)]
pub struct RepositorySummary {
    pub uuid: Uuid,
    pub name: String,
    /// Commit currently checked out on the branch this summary came from.
    pub commit: String,
}

/// File changes of one repository between a branch and its origin.
#[derive(Debug, Clone)]
pub struct RepositoryFileDiff {
    pub branch: String,
    pub repository_uuid: Uuid,
    pub repository_name: String,
    pub files: Vec<String>,
}

/// External collaborator managing Git repositories. The core only needs to
/// enumerate repositories per branch, diff a repository against the origin
/// commit, and trigger the repository-side merge.
#[async_trait]
pub trait RepositoryConnector: Send + Sync {
    async fn list_repositories(&self, branch: &str) -> ArborResult<Vec<RepositorySummary>>;

    async fn diff_against_commit(
        &self,
        repository: &RepositorySummary,
        commit: &str,
    ) -> ArborResult<Vec<String>>;

    /// Run the repository's checks; returns the failure messages, empty when
    /// everything passes.
    async fn run_checks(&self, repository: &RepositorySummary) -> ArborResult<Vec<String>>;

    async fn merge(&self, repository: &RepositorySummary) -> ArborResult<()>;
}

/// Connector for deployments without repository integration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRepositoryConnector;

#[async_trait]
impl RepositoryConnector for NullRepositoryConnector {
    async fn list_repositories(&self, _branch: &str) -> ArborResult<Vec<RepositorySummary>> {
        Ok(Vec::new())
    }

    async fn diff_against_commit(
        &self,
        _repository: &RepositorySummary,
        _commit: &str,
    ) -> ArborResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn run_checks(&self, _repository: &RepositorySummary) -> ArborResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn merge(&self, _repository: &RepositorySummary) -> ArborResult<()> {
        Ok(())
    }
}
