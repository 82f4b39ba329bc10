use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

// ---------------------------------------------------------------------------
// LockRegistry: process-wide named locks
// ---------------------------------------------------------------------------

/// A registry of named, process-wide locks. Serialises first-time database
/// initialization, schema-registry initialization, and merges of a given
/// branch. Guards release on every exit path; no user data is protected by
/// these locks.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the named lock, creating it on first use. The returned guard
    /// releases the lock when dropped.
    pub async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Lock held while initializing the database for the first time.
    pub async fn initialization(&self) -> OwnedMutexGuard<()> {
        self.acquire("initialization").await
    }

    /// Lock held while mutating the schema registry.
    pub async fn schema(&self) -> OwnedMutexGuard<()> {
        self.acquire("schema").await
    }

    /// Lock held while merging the named branch.
    pub async fn merge(&self, branch: &str) -> OwnedMutexGuard<()> {
        self.acquire(&format!("merge:{}", branch)).await
    }

    /// Connection-scoped lock around a backend transaction. The backend runs
    /// one transaction per connection, so merges of different branches must
    /// not interleave their BEGIN/COMMIT/CANCEL.
    pub async fn transaction(&self) -> OwnedMutexGuard<()> {
        self.acquire("backend-transaction").await
    }
}
