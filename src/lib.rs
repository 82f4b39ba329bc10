pub mod config;
pub mod db;
pub mod diff;
pub mod error;
pub mod initialization;
pub mod lock;
pub mod model;
pub mod registry;
pub mod repository;
pub mod schema;
pub mod store;

pub use config::{load_config, ArborConfig};
pub use db::ArborDatabase;
pub use diff::merge::BranchValidation;
pub use diff::{Diff, DiffAction, ModifiedPath};
pub use error::{ArborError, ArborResult, ValidationError};
pub use model::*;
pub use registry::Registry;
pub use schema::{AttributeSchema, BranchSupport, NodeSchema, RelationshipSchema, SchemaRegistry};
pub use store::{InMemoryTemporalStore, NodeManager, QueryOptions, SurrealTemporalStore, TemporalStore};
