use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{ArborError, ArborResult};

#[derive(Debug, Clone, Deserialize)]
pub struct ArborConfig {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub main: MainSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// "memory" or a SurrealDB server URL.
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            endpoint: "memory".to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MainSettings {
    /// Name of the default branch.
    pub default_branch: String,
    /// Deadline applied to client-facing reads, in seconds.
    pub query_timeout_secs: u64,
    /// Bounded parallelism for client-facing fan-out.
    pub concurrent_queries: usize,
}

impl Default for MainSettings {
    fn default() -> Self {
        Self {
            default_branch: "main".to_string(),
            query_timeout_secs: 30,
            concurrent_queries: 8,
        }
    }
}

impl MainSettings {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl Default for ArborConfig {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            main: MainSettings::default(),
        }
    }
}

/// Load the configuration from an optional file plus `ARBOR__`-prefixed
/// environment variables.
pub fn load_config(path: Option<&Path>) -> ArborResult<ArborConfig> {
    let mut builder = Config::builder()
        .add_source(File::with_name("arbor").required(false))
        .add_source(Environment::with_prefix("ARBOR").separator("__"));

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(false));
    }

    let config = builder
        .build()
        .map_err(|err| ArborError::Config(err.to_string()))?;

    config
        .try_deserialize()
        .map_err(|err| ArborError::Config(err.to_string()))
}
