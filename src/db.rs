use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use surrealdb::engine::any::{connect, Any};
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;
use tracing::debug;

/// Whether a query reads or writes; used for tracing and for backends that
/// distinguish access modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Read,
    Write,
}

/// A wrapper around the SurrealDB connection providing type-safe operations
/// for the Arbor temporal graph.
#[derive(Clone)]
pub struct ArborDatabase {
    db: Arc<Surreal<Any>>,
    indexes: Arc<IndexManager>,
}

impl ArborDatabase {
    /// Create a new in-memory database instance (development and tests).
    pub async fn new_memory() -> Result<Self> {
        let db = connect("memory").await?;
        db.use_ns("arbor").use_db("arbor").await?;

        let this = Self {
            db: Arc::new(db),
            indexes: Arc::new(IndexManager::default_indexes()),
        };
        this.init_schema().await?;
        Ok(this)
    }

    /// Connect according to the configured endpoint: `memory` for the
    /// development engine, anything else as a server URL.
    pub async fn from_config(settings: &crate::config::DatabaseSettings) -> Result<Self> {
        match settings.endpoint.as_str() {
            "memory" => Self::new_memory().await,
            url => {
                Self::new_remote(
                    url,
                    settings.username.as_deref().unwrap_or("root"),
                    settings.password.as_deref().unwrap_or("root"),
                )
                .await
            }
        }
    }

    /// Create a new database instance connecting to a SurrealDB server.
    pub async fn new_remote(url: &str, username: &str, password: &str) -> Result<Self> {
        let db = connect(url).await?;
        db.signin(Root {
            username,
            password,
        })
        .await?;
        db.use_ns("arbor").use_db("arbor").await?;

        let this = Self {
            db: Arc::new(db),
            indexes: Arc::new(IndexManager::default_indexes()),
        };
        this.init_schema().await?;
        Ok(this)
    }

    /// Initialize tables and indexes.
    async fn init_schema(&self) -> Result<()> {
        self.db.query("DEFINE TABLE IF NOT EXISTS vertex SCHEMALESS").await?;
        self.db.query("DEFINE TABLE IF NOT EXISTS edge SCHEMALESS").await?;
        self.indexes.ensure(&self.db).await?;
        Ok(())
    }

    /// A handle for issuing queries; the connection is shared.
    pub fn session(&self) -> ArborDatabase {
        self.clone()
    }

    pub fn index_manager(&self) -> &IndexManager {
        &self.indexes
    }

    /// Execute a parameterised query.
    pub async fn run(
        &self,
        kind: QueryKind,
        query: &str,
        params: Vec<(String, Value)>,
    ) -> Result<surrealdb::Response> {
        debug!(?kind, query, "backend query");
        let mut prepared = self.db.query(query);
        for (name, value) in params {
            prepared = prepared.bind((name, value));
        }
        Ok(prepared.await?)
    }

    /// Create a record with a specific id.
    pub async fn create_with_id<T: Serialize + DeserializeOwned + Send + 'static>(
        &self,
        table: &str,
        id: &str,
        data: T,
    ) -> Result<Option<T>> {
        let record: Option<T> = self.db.create((table, id)).content(data).await?;
        Ok(record)
    }

    /// Select a record by id.
    pub async fn select<T: DeserializeOwned + Send + 'static>(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<T>> {
        let record: Option<T> = self.db.select((table, id)).await?;
        Ok(record)
    }

    /// Update a record by id.
    pub async fn update<T: Serialize + DeserializeOwned + Send + 'static>(
        &self,
        table: &str,
        id: &str,
        data: T,
    ) -> Result<Option<T>> {
        let record: Option<T> = self.db.update((table, id)).content(data).await?;
        Ok(record)
    }

    /// Begin a transaction.
    pub async fn begin_transaction(&self) -> Result<()> {
        self.db.query("BEGIN TRANSACTION").await?;
        Ok(())
    }

    /// Commit the current transaction.
    pub async fn commit_transaction(&self) -> Result<()> {
        self.db.query("COMMIT TRANSACTION").await?;
        Ok(())
    }

    /// Cancel the current transaction.
    pub async fn cancel_transaction(&self) -> Result<()> {
        self.db.query("CANCEL TRANSACTION").await?;
        Ok(())
    }

    /// Check if the database is reachable.
    pub async fn health(&self) -> Result<bool> {
        let _ = self.db.version().await?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// IndexManager
// ---------------------------------------------------------------------------

/// A named index on one table field.
#[derive(Debug, Clone)]
pub struct IndexDefinition {
    pub name: String,
    pub table: String,
    pub field: String,
}

/// Collects index definitions and applies them once at initialization.
#[derive(Debug, Default)]
pub struct IndexManager {
    initialized: AtomicBool,
    definitions: std::sync::Mutex<Vec<IndexDefinition>>,
}

impl IndexManager {
    fn default_indexes() -> Self {
        let manager = IndexManager::default();
        manager.add("edge_label", "edge", "label");
        manager.add("edge_branch", "edge", "branch");
        manager.add("edge_source", "edge", "source");
        manager.add("edge_target", "edge", "target");
        manager.add("vertex_labels", "vertex", "labels");
        manager
    }

    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn add(&self, name: &str, table: &str, field: &str) {
        self.definitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(IndexDefinition {
                name: name.to_string(),
                table: table.to_string(),
                field: field.to_string(),
            });
    }

    async fn ensure(&self, db: &Surreal<Any>) -> Result<()> {
        let definitions = self
            .definitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for def in definitions {
            let statement = format!(
                "DEFINE INDEX IF NOT EXISTS {} ON TABLE {} COLUMNS `{}`",
                def.name, def.table, def.field
            );
            db.query(statement).await?;
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }
}
