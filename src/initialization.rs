use tracing::{debug, info};

use crate::config::ArborConfig;
use crate::db::ArborDatabase;
use crate::error::{ArborError, ArborResult};
use crate::model::branch::{Branch, GLOBAL_BRANCH_NAME};
use crate::model::edge::{vertex_labels, VertexRecord};
use crate::registry::Registry;
use crate::store::graph::{SurrealTemporalStore, TemporalStore};

// ---------------------------------------------------------------------------
// Database & registry initialization
// ---------------------------------------------------------------------------

/// Application-root entry point: connect the configured backend, then
/// initialize the store and registry from it. The configured default-branch
/// name is used when bootstrapping an empty database.
pub async fn bootstrap(config: &ArborConfig) -> ArborResult<(SurrealTemporalStore, Registry)> {
    let db = ArborDatabase::from_config(&config.database)
        .await
        .map_err(|e| ArborError::Backend(e.to_string()))?;
    let store = SurrealTemporalStore::new(db);

    let registry = Registry::new();
    registry.set_default_branch_name(&config.main.default_branch);
    initialize(&store, &registry).await?;

    Ok((store, registry))
}

/// Initialize the registry from the store, bootstrapping the database on
/// first use. Held under the process-wide initialization lock.
pub async fn initialize(store: &dyn TemporalStore, registry: &Registry) -> ArborResult<()> {
    let _guard = registry.locks.initialization().await;

    debug!("checking root vertex");
    let roots = store.vertices_with_label(vertex_labels::ROOT).await?;
    match roots.len() {
        0 => first_time_initialization(store, &registry.default_branch_name()).await?,
        1 => {}
        n => {
            return Err(ArborError::Integrity(format!(
                "the database is corrupted, {} root vertices found",
                n
            )))
        }
    }

    load_branches(store, registry).await
}

/// Load all branch records into the registry, enforcing the branch
/// invariants: exactly one default branch, a global branch, and a known
/// origin for every other branch.
async fn load_branches(store: &dyn TemporalStore, registry: &Registry) -> ArborResult<()> {
    let vertices = store.vertices_with_label(vertex_labels::BRANCH).await?;
    let mut branches = Vec::with_capacity(vertices.len());
    for vertex in &vertices {
        branches.push(Branch::from_vertex(vertex)?);
    }

    let defaults: Vec<&Branch> = branches.iter().filter(|b| b.is_default).collect();
    if defaults.len() != 1 {
        return Err(ArborError::Integrity(format!(
            "exactly one default branch is required, found {}",
            defaults.len()
        )));
    }
    let default_name = defaults[0].name.clone();

    if !branches.iter().any(|b| b.name == GLOBAL_BRANCH_NAME) {
        return Err(ArborError::Integrity("the global branch is missing".to_string()));
    }

    for branch in &branches {
        let is_origin_known = branch.is_default
            || branch.name == GLOBAL_BRANCH_NAME
            || branches.iter().any(|b| b.name == branch.origin_branch);
        if !is_origin_known {
            return Err(ArborError::Integrity(format!(
                "branch {} has no origin branch",
                branch.name
            )));
        }
    }

    registry.set_default_branch_name(&default_name);
    for branch in branches {
        registry.set_branch(branch).await;
    }

    debug!(default = %default_name, "registry initialized");
    Ok(())
}

/// Bootstrap an empty database: the root vertex, the default branch under
/// its configured name, and the global branch.
pub async fn first_time_initialization(store: &dyn TemporalStore, default_branch: &str) -> ArborResult<()> {
    info!(default = %default_branch, "initializing the database for the first time");

    let root = VertexRecord::new(vec![vertex_labels::ROOT.to_string()]);
    store.add_vertex(root).await?;

    let mut default = Branch::default_branch_named(default_branch);
    default.save(store).await?;

    let mut global = Branch::global_branch();
    global.save(store).await?;

    Ok(())
}

/// Create a new branch diverging from the default branch now. The default
/// branch's schemas are duplicated onto the new branch.
pub async fn create_branch(
    store: &dyn TemporalStore,
    registry: &Registry,
    name: &str,
    description: Option<&str>,
) -> ArborResult<Branch> {
    if name == GLOBAL_BRANCH_NAME {
        return Err(ArborError::Validation(crate::error::ValidationError::single(
            "name",
            format!("{} is a reserved branch name", name),
        )));
    }
    if registry.get_branch(name).await.is_ok() {
        return Err(ArborError::Validation(crate::error::ValidationError::single(
            "name",
            format!("the branch {} already exists", name),
        )));
    }

    let default = registry.default_branch().await?;
    let mut branch = Branch::new(name, &default.name);
    if let Some(description) = description {
        branch = branch.with_description(description);
    }

    // Duplicate the schemas of the origin branch so the new branch starts
    // from the same catalog.
    if let Ok(hash) = registry.schema.duplicate(&default.name, name).await {
        branch.active_schema_hash = hash;
    }

    branch.save(store).await?;
    registry.set_branch(branch.clone()).await;

    info!(branch = %name, origin = %default.name, "branch created");
    Ok(branch)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
