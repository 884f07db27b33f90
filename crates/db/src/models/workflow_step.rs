//! Workflow step model.
//!
//! Steps carry the unit of dispatch: what capability is needed, which wave
//! the step runs in, and everything recorded along the way (worker, attempt
//! count, payloads, approval overlay).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkflowStepError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Workflow step not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "step_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Assisted-mode review overlay, applied after a step completes and before
/// it counts as resolved.
#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "step_approval", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepApproval {
    Approved,
    Rejected,
}

impl std::fmt::Display for StepApproval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepApproval::Approved => write!(f, "approved"),
            StepApproval::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Declaration order within the plan.
    pub seq: i64,
    /// Execution wave. Steps in the same wave may run concurrently.
    pub wave: i64,
    pub name: String,
    pub description: Option<String>,
    pub capability: String,
    pub language: Option<String>,
    pub status: StepStatus,
    pub approval: Option<StepApproval>,
    pub approval_feedback: Option<String>,
    pub skip_reason: Option<String>,
    /// Worker chosen at the most recent dispatch. Assignment never caches
    /// across retries.
    pub worker_id: Option<String>,
    pub attempts: i64,
    pub input: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Set when an approved-then-rejected step had to be redone.
    pub rework: bool,
    pub previous_output: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowStep {
    pub name: String,
    pub description: Option<String>,
    pub capability: String,
    pub language: Option<String>,
    pub wave: i64,
    pub input: Option<String>,
}

impl WorkflowStep {
    /// Resolved means the step no longer blocks its wave.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Replace the whole plan for a workflow in one transaction.
    pub async fn replace_plan(
        pool: &SqlitePool,
        workflow_id: Uuid,
        steps: &[CreateWorkflowStep],
    ) -> Result<Vec<Self>, WorkflowStepError> {
        let mut tx = pool.begin().await?;

        sqlx::query(r#"DELETE FROM workflow_steps WHERE workflow_id = ?1"#)
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;

        let mut created = Vec::with_capacity(steps.len());
        for (seq, step) in steps.iter().enumerate() {
            let row = sqlx::query_as::<_, WorkflowStep>(
                r#"
                INSERT INTO workflow_steps (
                    id, workflow_id, seq, wave, name, description, capability, language, input
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(workflow_id)
            .bind(seq as i64)
            .bind(step.wave)
            .bind(&step.name)
            .bind(&step.description)
            .bind(&step.capability)
            .bind(&step.language)
            .bind(&step.input)
            .fetch_one(&mut *tx)
            .await?;
            created.push(row);
        }

        tx.commit().await?;
        Ok(created)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, WorkflowStepError> {
        let step = sqlx::query_as::<_, WorkflowStep>(r#"SELECT * FROM workflow_steps WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(step)
    }

    pub async fn find_by_workflow(
        pool: &SqlitePool,
        workflow_id: Uuid,
    ) -> Result<Vec<Self>, WorkflowStepError> {
        let steps = sqlx::query_as::<_, WorkflowStep>(
            r#"
            SELECT * FROM workflow_steps
            WHERE workflow_id = ?1
            ORDER BY seq ASC
            "#,
        )
        .bind(workflow_id)
        .fetch_all(pool)
        .await?;

        Ok(steps)
    }

    pub async fn find_pending_in_wave(
        pool: &SqlitePool,
        workflow_id: Uuid,
        wave: i64,
    ) -> Result<Vec<Self>, WorkflowStepError> {
        let steps = sqlx::query_as::<_, WorkflowStep>(
            r#"
            SELECT * FROM workflow_steps
            WHERE workflow_id = ?1 AND wave = ?2 AND status = 'pending'
            ORDER BY seq ASC
            "#,
        )
        .bind(workflow_id)
        .bind(wave)
        .fetch_all(pool)
        .await?;

        Ok(steps)
    }

    /// Record a dispatch: bump the attempt counter and note the worker.
    pub async fn mark_running(
        pool: &SqlitePool,
        id: Uuid,
        worker_id: &str,
    ) -> Result<Self, WorkflowStepError> {
        let step = sqlx::query_as::<_, WorkflowStep>(
            r#"
            UPDATE workflow_steps
            SET status = 'running',
                worker_id = ?2,
                attempts = attempts + 1,
                error = NULL,
                started_at = datetime('now', 'subsec'),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .fetch_optional(pool)
        .await?;

        step.ok_or(WorkflowStepError::NotFound)
    }

    pub async fn mark_completed(
        pool: &SqlitePool,
        id: Uuid,
        output: &str,
    ) -> Result<Self, WorkflowStepError> {
        let step = sqlx::query_as::<_, WorkflowStep>(
            r#"
            UPDATE workflow_steps
            SET status = 'completed',
                output = ?2,
                completed_at = datetime('now', 'subsec'),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(output)
        .fetch_optional(pool)
        .await?;

        step.ok_or(WorkflowStepError::NotFound)
    }

    pub async fn mark_failed(
        pool: &SqlitePool,
        id: Uuid,
        error: &str,
    ) -> Result<Self, WorkflowStepError> {
        let step = sqlx::query_as::<_, WorkflowStep>(
            r#"
            UPDATE workflow_steps
            SET status = 'failed',
                error = ?2,
                completed_at = datetime('now', 'subsec'),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_optional(pool)
        .await?;

        step.ok_or(WorkflowStepError::NotFound)
    }

    /// Skipping resolves a step without failing its wave.
    pub async fn mark_skipped(
        pool: &SqlitePool,
        id: Uuid,
        reason: Option<&str>,
    ) -> Result<Self, WorkflowStepError> {
        let step = sqlx::query_as::<_, WorkflowStep>(
            r#"
            UPDATE workflow_steps
            SET status = 'skipped',
                skip_reason = ?2,
                completed_at = datetime('now', 'subsec'),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(reason)
        .fetch_optional(pool)
        .await?;

        step.ok_or(WorkflowStepError::NotFound)
    }

    pub async fn set_approval(
        pool: &SqlitePool,
        id: Uuid,
        approval: StepApproval,
        feedback: Option<&str>,
    ) -> Result<Self, WorkflowStepError> {
        let step = sqlx::query_as::<_, WorkflowStep>(
            r#"
            UPDATE workflow_steps
            SET approval = ?2,
                approval_feedback = ?3,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(approval.to_string())
        .bind(feedback)
        .fetch_optional(pool)
        .await?;

        step.ok_or(WorkflowStepError::NotFound)
    }

    /// Send a rejected step back for another pass. The old output is kept
    /// on the side so the next worker can see what was rejected.
    pub async fn begin_rework(
        pool: &SqlitePool,
        id: Uuid,
        feedback: Option<&str>,
    ) -> Result<Self, WorkflowStepError> {
        let step = sqlx::query_as::<_, WorkflowStep>(
            r#"
            UPDATE workflow_steps
            SET status = 'pending',
                approval = 'rejected',
                approval_feedback = ?2,
                rework = 1,
                previous_output = output,
                output = NULL,
                completed_at = NULL,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(feedback)
        .fetch_optional(pool)
        .await?;

        step.ok_or(WorkflowStepError::NotFound)
    }

    /// Put a step back in the queue, keeping the attempt count.
    pub async fn reset_to_pending(pool: &SqlitePool, id: Uuid) -> Result<Self, WorkflowStepError> {
        let step = sqlx::query_as::<_, WorkflowStep>(
            r#"
            UPDATE workflow_steps
            SET status = 'pending',
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        step.ok_or(WorkflowStepError::NotFound)
    }

    pub async fn update_input(
        pool: &SqlitePool,
        id: Uuid,
        input: &str,
    ) -> Result<Self, WorkflowStepError> {
        let step = sqlx::query_as::<_, WorkflowStep>(
            r#"
            UPDATE workflow_steps
            SET input = ?2,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input)
        .fetch_optional(pool)
        .await?;

        step.ok_or(WorkflowStepError::NotFound)
    }

    /// Reset every Running step of a workflow back to Pending. Used when a
    /// run is cancelled or was interrupted by a restart.
    pub async fn reset_running(
        pool: &SqlitePool,
        workflow_id: Uuid,
    ) -> Result<u64, WorkflowStepError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = 'pending',
                updated_at = datetime('now', 'subsec')
            WHERE workflow_id = ?1 AND status = 'running'
            "#,
        )
        .bind(workflow_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }
}
