use std::sync::Arc;

use db::DBService;
use server::{AppState, routes};
use services::services::{
    Approvals, ConductorConfig, GuardianService, SchedulerService, StaticPlanner, WorkflowService,
    WorkflowServiceError, WorktreeSandboxes,
};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, prelude::*};
use utils::assets::{asset_dir, config_path};
use workers::{CommandExecutor, RegistryError, WorkerRegistry};

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Workflow(#[from] WorkflowServiceError),
}

#[tokio::main]
async fn main() -> Result<(), ConductorError> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,server={level},services={level},db={level},workers={level},utils={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string).expect("Failed to create tracing filter");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    // Create asset directory if it doesn't exist
    if !asset_dir().exists() {
        std::fs::create_dir_all(asset_dir())?;
    }

    let config = Arc::new(ConductorConfig::load(&config_path()));
    let db = DBService::new().await?;

    let registry = Arc::new(WorkerRegistry::load(config.workers_path.clone()).await?);
    let approvals = Arc::new(Approvals::new());
    let scheduler = SchedulerService::new(
        db.clone(),
        registry.clone(),
        Arc::new(CommandExecutor::new()),
        approvals.clone(),
        config.clone(),
    );
    let workflows = WorkflowService::new(
        db.clone(),
        config.clone(),
        Arc::new(WorktreeSandboxes::new(config.sandbox_root.clone())),
        approvals,
        scheduler,
        Arc::new(StaticPlanner::new()),
    );

    // Workflows left mid-flight by a previous process are failed, not resumed
    let recovered = workflows.recover_interrupted().await?;
    if recovered > 0 {
        tracing::warn!("Marked {} interrupted workflow(s) as failed", recovered);
    }

    let guardians = GuardianService::new(db.clone(), config.clone(), workflows.clone());
    if config.guardian_enabled {
        guardians.spawn_scheduler();
    } else {
        tracing::info!("Guardian scheduler disabled (guardian_enabled is false)");
    }

    let app_router = routes::router(AppState {
        workflows,
        guardians,
        registry,
    });

    let port = std::env::var("BACKEND_PORT")
        .or_else(|_| std::env::var("PORT"))
        .ok()
        .and_then(|s| s.trim().parse::<u16>().ok())
        .unwrap_or(8787);
    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    let actual_port = listener.local_addr()?.port();

    tracing::info!("Server running on http://{host}:{actual_port}");

    axum::serve(listener, app_router).await?;
    Ok(())
}
