use axum::{
    Json, Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::post,
};
use db::models::workflow_step::WorkflowStep;
use serde::Deserialize;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct RejectStepRequest {
    pub feedback: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RetryStepRequest {
    pub input: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SkipStepRequest {
    pub reason: Option<String>,
}

pub async fn execute_step(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<WorkflowStep>>, ApiError> {
    let step = state.workflows.execute_step(id).await?;
    Ok(ResponseJson(ApiResponse::success(step)))
}

pub async fn approve_step(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<WorkflowStep>>, ApiError> {
    let step = state.workflows.approve_step(id).await?;
    Ok(ResponseJson(ApiResponse::success(step)))
}

pub async fn reject_step(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RejectStepRequest>,
) -> Result<ResponseJson<ApiResponse<WorkflowStep>>, ApiError> {
    let step = state.workflows.reject_step(id, payload.feedback).await?;
    Ok(ResponseJson(ApiResponse::success(step)))
}

pub async fn retry_step(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RetryStepRequest>,
) -> Result<ResponseJson<ApiResponse<WorkflowStep>>, ApiError> {
    let step = state.workflows.retry_step(id, payload.input).await?;
    Ok(ResponseJson(ApiResponse::success(step)))
}

pub async fn skip_step(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SkipStepRequest>,
) -> Result<ResponseJson<ApiResponse<WorkflowStep>>, ApiError> {
    let step = state.workflows.skip_step(id, payload.reason).await?;
    Ok(ResponseJson(ApiResponse::success(step)))
}

pub fn router() -> Router<AppState> {
    let step_id_router = Router::new()
        .route("/execute", post(execute_step))
        .route("/approve", post(approve_step))
        .route("/reject", post(reject_step))
        .route("/retry", post(retry_step))
        .route("/skip", post(skip_step));

    Router::new().nest("/steps/{id}", step_id_router)
}
