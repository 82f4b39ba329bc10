use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::diff::ModifiedPath;

/// Central error type for Arbor operations.
#[derive(Error, Debug)]
pub enum ArborError {
    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(uuid::Uuid),

    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("Validation failed: {0}")]
    Validation(ValidationError),

    #[error("Merge conflict on {} path(s): {}", .0.len(), format_paths(.0))]
    Conflict(Vec<ModifiedPath>),

    #[error("Integrity failure: {0}")]
    Integrity(String),

    #[error("Backend failure: {0}")]
    Backend(String),

    #[error("Read deadline exceeded after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Arbor results.
pub type ArborResult<T> = Result<T, ArborError>;

/// Field-keyed validation messages, reported to the caller verbatim.
#[derive(Debug, Clone, Default)]
pub struct ValidationError {
    pub fields: BTreeMap<String, String>,
}

impl ValidationError {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(field.into(), message.into());
        Self { fields }
    }

    pub fn insert(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields.insert(field.into(), message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, message) in &self.fields {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", field, message)?;
            first = false;
        }
        Ok(())
    }
}

impl From<ValidationError> for ArborError {
    fn from(err: ValidationError) -> Self {
        ArborError::Validation(err)
    }
}

fn format_paths(paths: &[ModifiedPath]) -> String {
    paths
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
