use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::models::{
    guardian_run::GuardianRunError, workflow::WorkflowError, workflow_step::WorkflowStepError,
};
use services::services::{
    GuardianError, PlannerError, SandboxError, SchedulerError, WorkflowServiceError,
};
use thiserror::Error;
use utils::response::ApiResponse;
use workers::RegistryError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Guardian(#[from] GuardianError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Internal Server Error: {0}")]
    InternalError(String),
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::Database(e) => ApiError::Database(e),
            WorkflowError::Serialize(e) => ApiError::InternalError(e.to_string()),
            WorkflowError::NotFound => ApiError::NotFound("Workflow not found".into()),
            WorkflowError::InvalidTransition { from, to } => {
                ApiError::BadRequest(format!("Cannot move workflow from {from} to {to}"))
            }
            WorkflowError::Conflict { expected, actual } => ApiError::Conflict(format!(
                "Workflow changed concurrently (expected {expected}, found {actual})"
            )),
            WorkflowError::SandboxPinned { existing } => {
                ApiError::Conflict(format!("Workflow is already pinned to sandbox {existing}"))
            }
        }
    }
}

impl From<WorkflowStepError> for ApiError {
    fn from(err: WorkflowStepError) -> Self {
        match err {
            WorkflowStepError::Database(e) => ApiError::Database(e),
            WorkflowStepError::NotFound => ApiError::NotFound("Workflow step not found".into()),
        }
    }
}

impl From<GuardianRunError> for ApiError {
    fn from(err: GuardianRunError) -> Self {
        match err {
            GuardianRunError::Database(e) => ApiError::Database(e),
            GuardianRunError::Serialize(e) => ApiError::InternalError(e.to_string()),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Workflow(e) => e.into(),
            SchedulerError::Step(e) => e.into(),
        }
    }
}

impl From<WorkflowServiceError> for ApiError {
    fn from(err: WorkflowServiceError) -> Self {
        match err {
            WorkflowServiceError::Workflow(e) => e.into(),
            WorkflowServiceError::Step(e) => e.into(),
            WorkflowServiceError::Scheduler(e) => e.into(),
            WorkflowServiceError::Sandbox(e) => ApiError::Sandbox(e),
            WorkflowServiceError::Planner(e) => ApiError::Planner(e),
            WorkflowServiceError::Validation(msg) => ApiError::BadRequest(msg),
            WorkflowServiceError::NoPendingDecision => {
                ApiError::Conflict("No decision is pending for this step".into())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = match &self {
            // Promote certain sandbox errors to client-facing statuses
            ApiError::Sandbox(err) => match err {
                SandboxError::DirtyWorktree => (StatusCode::CONFLICT, "SandboxError"),
                SandboxError::NotProvisioned(_) => (StatusCode::NOT_FOUND, "SandboxError"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "SandboxError"),
            },
            ApiError::Guardian(err) => match err {
                GuardianError::NotFound(_) => (StatusCode::NOT_FOUND, "GuardianError"),
                GuardianError::Parse(_) => (StatusCode::BAD_REQUEST, "GuardianError"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "GuardianError"),
            },
            ApiError::Registry(err) => match err {
                RegistryError::NoWorker { .. } => (StatusCode::CONFLICT, "RegistryError"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "RegistryError"),
            },
            ApiError::Planner(_) => (StatusCode::INTERNAL_SERVER_ERROR, "PlannerError"),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "ConflictError"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        };

        let error_message = match &self {
            ApiError::Sandbox(SandboxError::DirtyWorktree) => {
                "The sandbox has uncommitted changes. Commit them first, or discard with force."
                    .to_string()
            }
            ApiError::Conflict(msg) => msg.clone(),
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::NotFound(msg) => msg.clone(),
            ApiError::InternalError(msg) => msg.clone(),
            _ => format!("{}: {}", error_type, self),
        };
        let response = ApiResponse::<()>::error(&error_message);
        (status_code, Json(response)).into_response()
    }
}
