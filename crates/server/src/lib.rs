pub mod error;
pub mod routes;

use std::sync::Arc;

use services::services::{GuardianService, WorkflowService};
use workers::WorkerRegistry;

/// Shared handles that every route reaches through axum state.
#[derive(Clone)]
pub struct AppState {
    pub workflows: WorkflowService,
    pub guardians: GuardianService,
    pub registry: Arc<WorkerRegistry>,
}
