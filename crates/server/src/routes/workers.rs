use axum::{
    Router,
    extract::State,
    response::Json as ResponseJson,
    routing::{get, post},
};
use utils::response::ApiResponse;
use workers::WorkerProfile;

use crate::{AppState, error::ApiError};

pub async fn get_workers(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Vec<WorkerProfile>>>, ApiError> {
    let set = state.registry.snapshot().await;
    Ok(ResponseJson(ApiResponse::success(set.workers.clone())))
}

pub async fn reload_workers(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Vec<WorkerProfile>>>, ApiError> {
    let set = state.registry.reload().await?;
    Ok(ResponseJson(ApiResponse::success(set.workers.clone())))
}

pub fn router() -> Router<AppState> {
    let workers_router = Router::new()
        .route("/", get(get_workers))
        .route("/reload", post(reload_workers));

    Router::new().nest("/workers", workers_router)
}
