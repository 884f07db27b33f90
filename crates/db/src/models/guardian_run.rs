//! Guardian run history.
//!
//! One row per sweep of a configured guardian. Workflows spawned by the
//! sweep are referenced by id so the API can link a run to its findings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum GuardianRunError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "guardian_run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GuardianRunStatus {
    Clean,
    ViolationsFound,
    Failed,
}

impl std::fmt::Display for GuardianRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardianRunStatus::Clean => write!(f, "clean"),
            GuardianRunStatus::ViolationsFound => write!(f, "violations_found"),
            GuardianRunStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct GuardianRun {
    pub id: Uuid,
    pub guardian: String,
    pub version: i64,
    pub status: GuardianRunStatus,
    pub violation_count: i64,
    /// JSON array of workflow ids spawned by this run.
    pub workflow_ids: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateGuardianRun {
    pub guardian: String,
    pub version: i64,
    pub status: GuardianRunStatus,
    pub violation_count: i64,
    pub workflow_ids: Vec<Uuid>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl GuardianRun {
    pub fn workflow_ids_parsed(&self) -> Result<Vec<Uuid>, GuardianRunError> {
        Ok(serde_json::from_str(&self.workflow_ids)?)
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateGuardianRun,
    ) -> Result<Self, GuardianRunError> {
        let workflow_ids = serde_json::to_string(&data.workflow_ids)?;

        let run = sqlx::query_as::<_, GuardianRun>(
            r#"
            INSERT INTO guardian_runs (
                id, guardian, version, status, violation_count, workflow_ids, error,
                started_at, finished_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now', 'subsec'))
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&data.guardian)
        .bind(data.version)
        .bind(data.status.to_string())
        .bind(data.violation_count)
        .bind(workflow_ids)
        .bind(&data.error)
        .bind(data.started_at)
        .fetch_one(pool)
        .await?;

        Ok(run)
    }

    pub async fn find_latest(
        pool: &SqlitePool,
        guardian: &str,
    ) -> Result<Option<Self>, GuardianRunError> {
        let run = sqlx::query_as::<_, GuardianRun>(
            r#"
            SELECT * FROM guardian_runs
            WHERE guardian = ?1
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(guardian)
        .fetch_optional(pool)
        .await?;

        Ok(run)
    }

    pub async fn find_recent(
        pool: &SqlitePool,
        guardian: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Self>, GuardianRunError> {
        let runs = sqlx::query_as::<_, GuardianRun>(
            r#"
            SELECT * FROM guardian_runs
            WHERE ?1 IS NULL OR guardian = ?1
            ORDER BY started_at DESC
            LIMIT ?2
            "#,
        )
        .bind(guardian)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(runs)
    }
}
