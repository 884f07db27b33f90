use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::workflow::{CreateWorkflow, Workflow, WorkflowOrigin, WorkflowStatus};
use serde::Deserialize;
use services::services::{ProgressSnapshot, WorkflowWithSteps};
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct WorkflowQuery {
    pub status: Option<WorkflowStatus>,
    pub origin: Option<WorkflowOrigin>,
}

#[derive(Debug, Deserialize)]
pub struct DiscardQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn get_workflows(
    State(state): State<AppState>,
    Query(query): Query<WorkflowQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Workflow>>>, ApiError> {
    let workflows = state.workflows.list(query.status, query.origin).await?;
    Ok(ResponseJson(ApiResponse::success(workflows)))
}

pub async fn create_workflow(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkflow>,
) -> Result<ResponseJson<ApiResponse<Workflow>>, ApiError> {
    let workflow = state.workflows.create(payload).await?;
    Ok(ResponseJson(ApiResponse::success(workflow)))
}

pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<WorkflowWithSteps>>, ApiError> {
    let workflow = state.workflows.get(id).await?;
    Ok(ResponseJson(ApiResponse::success(workflow)))
}

pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<DiscardQuery>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state.workflows.discard(id, query.force).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn analyze_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Workflow>>, ApiError> {
    let workflow = state.workflows.analyze(id).await?;
    Ok(ResponseJson(ApiResponse::success(workflow)))
}

pub async fn plan_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Workflow>>, ApiError> {
    let workflow = state.workflows.plan(id).await?;
    Ok(ResponseJson(ApiResponse::success(workflow)))
}

pub async fn run_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Workflow>>, ApiError> {
    let workflow = state.workflows.run(id).await?;
    Ok(ResponseJson(ApiResponse::success(workflow)))
}

pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Workflow>>, ApiError> {
    let workflow = state.workflows.cancel(id).await?;
    Ok(ResponseJson(ApiResponse::success(workflow)))
}

pub async fn complete_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Workflow>>, ApiError> {
    let workflow = state.workflows.complete(id).await?;
    Ok(ResponseJson(ApiResponse::success(workflow)))
}

pub async fn get_workflow_progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<ProgressSnapshot>>, ApiError> {
    let progress = state.workflows.progress(id).await?;
    Ok(ResponseJson(ApiResponse::success(progress)))
}

pub fn router() -> Router<AppState> {
    let workflow_id_router = Router::new()
        .route("/", get(get_workflow).delete(delete_workflow))
        .route("/analyze", post(analyze_workflow))
        .route("/plan", post(plan_workflow))
        .route("/run", post(run_workflow))
        .route("/cancel", post(cancel_workflow))
        .route("/complete", post(complete_workflow))
        .route("/progress", get(get_workflow_progress));

    let workflows_router = Router::new()
        .route("/", get(get_workflows).post(create_workflow))
        .nest("/{id}", workflow_id_router);

    Router::new().nest("/workflows", workflows_router)
}
