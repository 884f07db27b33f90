use axum::{
    Router,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::guardian_run::GuardianRun;
use serde::Deserialize;
use services::services::GuardianDefinition;
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct GuardianRunQuery {
    pub guardian: Option<String>,
}

pub async fn get_guardians(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Vec<GuardianDefinition>>>, ApiError> {
    let definitions = state.guardians.list_definitions()?;
    Ok(ResponseJson(ApiResponse::success(definitions)))
}

pub async fn get_guardian_runs(
    State(state): State<AppState>,
    Query(query): Query<GuardianRunQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<GuardianRun>>>, ApiError> {
    let runs = state.guardians.recent_runs(query.guardian.as_deref()).await?;
    Ok(ResponseJson(ApiResponse::success(runs)))
}

pub async fn run_guardian(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<ResponseJson<ApiResponse<GuardianRun>>, ApiError> {
    let run = state.guardians.run_guardian(&name).await?;
    Ok(ResponseJson(ApiResponse::success(run)))
}

pub fn router() -> Router<AppState> {
    let guardians_router = Router::new()
        .route("/", get(get_guardians))
        .route("/runs", get(get_guardian_runs))
        .route("/{name}/run", post(run_guardian));

    Router::new().nest("/guardians", guardians_router)
}
