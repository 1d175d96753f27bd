//! Warden Worker Entry Point
//!
//! Opens the LMDB workflow state store, loads workflow definitions and
//! resources from a JSON manifest, and resumes scheduled steps until Ctrl-C.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use warden_core::constants::DEFAULT_STATE_MAX_SIZE_MB;
use warden_core::{env, ConfigError, WardenResult};
use warden_workflow::{
    scheduled_step_task, InMemoryResourceProvider, InMemoryResourceState,
    InMemorySessionFactory, InMemoryWorkflowRepository, LmdbWorkflowStateStore, ResourceTypeRegistry,
    RunnerConfig, SchedulerConfig, SingletonResource, StepProviderRegistry, WorkflowDefinition,
    WorkflowRunner,
};

/// Contents of `WARDEN_WORKFLOWS_PATH`.
#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    workflows: Vec<WorkflowDefinition>,
    /// Collection resources: type name to resource ids.
    #[serde(default)]
    resources: BTreeMap<String, Vec<String>>,
    /// Singleton resources: type name to its one id.
    #[serde(default)]
    singletons: BTreeMap<String, String>,
}

fn init_tracing() -> Result<(), ConfigError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden=debug,info"));
    let json = env::string_or("WARDEN_LOG_FORMAT", "text").eq_ignore_ascii_case("json");

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| ConfigError::InvalidValue {
        field: "RUST_LOG".to_string(),
        value: String::new(),
        reason: format!("Failed to init subscriber: {}", e),
    })
}

fn load_manifest() -> Result<Manifest, ConfigError> {
    let Ok(path) = std::env::var("WARDEN_WORKFLOWS_PATH") else {
        tracing::warn!("WARDEN_WORKFLOWS_PATH not set, starting without workflows");
        return Ok(Manifest::default());
    };

    let invalid = |reason: String| ConfigError::InvalidValue {
        field: "WARDEN_WORKFLOWS_PATH".to_string(),
        value: path.clone(),
        reason,
    };
    let raw = std::fs::read_to_string(&path).map_err(|e| invalid(e.to_string()))?;
    serde_json::from_str(&raw).map_err(|e| invalid(e.to_string()))
}

#[tokio::main]
async fn main() -> WardenResult<()> {
    init_tracing()?;

    let state_path = env::require("WARDEN_STATE_PATH")?;
    let state_max_size_mb = env::parse_or("WARDEN_STATE_MAX_SIZE_MB", DEFAULT_STATE_MAX_SIZE_MB);
    let state_store = Arc::new(LmdbWorkflowStateStore::open(&state_path, state_max_size_mb)?);

    let manifest = load_manifest()?;
    let workflows = Arc::new(InMemoryWorkflowRepository::new());
    for workflow in manifest.workflows {
        workflows.register(workflow)?;
    }

    let resource_state = Arc::new(InMemoryResourceState::new());
    let mut resources = ResourceTypeRegistry::new();
    for (resource_type, ids) in manifest.resources {
        for id in ids {
            resource_state.insert(resource_type.clone(), id)?;
        }
        resources.register(Arc::new(InMemoryResourceProvider::new(
            resource_type,
            resource_state.clone(),
        )));
    }
    for (resource_type, id) in manifest.singletons {
        resources.register(Arc::new(SingletonResource::new(resource_type, id)));
    }

    let runner = Arc::new(WorkflowRunner::new(
        Arc::new(InMemorySessionFactory::new(workflows.clone(), resource_state)),
        state_store,
        StepProviderRegistry::with_builtins(),
        resources,
        RunnerConfig::from_env(),
    ));

    tracing::info!(
        node_id = %runner.config().node_id,
        workflows = workflows.len(),
        state_path = %state_path,
        "Starting Warden worker"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(scheduled_step_task(
        runner,
        SchedulerConfig::from_env(),
        shutdown_rx,
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    match scheduler.await {
        Ok(metrics) => {
            let snapshot = metrics.snapshot();
            tracing::info!(
                completed = snapshot.completed,
                failed = snapshot.failed,
                "Warden worker stopped"
            );
        }
        Err(e) => tracing::error!(error = %e, "Scheduler task aborted"),
    }
    Ok(())
}
