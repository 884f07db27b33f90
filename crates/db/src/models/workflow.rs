//! Workflow model and state machine.
//!
//! A workflow is one multi-step change against one repository. Status moves
//! along a fixed graph and every transition is written with an optimistic
//! compare-and-set, so concurrent movers cannot stomp each other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("failed to serialize workflow field: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Workflow not found")]
    NotFound,
    #[error("invalid workflow transition: {from} -> {to}")]
    InvalidTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    #[error("workflow moved concurrently: expected {expected}, found {actual}")]
    Conflict {
        expected: WorkflowStatus,
        actual: WorkflowStatus,
    },
    #[error("workflow sandbox already pinned to {existing}")]
    SandboxPinned { existing: String },
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "workflow_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Analyzing,
    Analyzed,
    Planning,
    Planned,
    Executing,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Created => write!(f, "created"),
            WorkflowStatus::Analyzing => write!(f, "analyzing"),
            WorkflowStatus::Analyzed => write!(f, "analyzed"),
            WorkflowStatus::Planning => write!(f, "planning"),
            WorkflowStatus::Planned => write!(f, "planned"),
            WorkflowStatus::Executing => write!(f, "executing"),
            WorkflowStatus::Verifying => write!(f, "verifying"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Legal edges of the lifecycle graph.
    ///
    /// Failed and Cancelled are reachable from every non-terminal state.
    /// Analyzed -> Analyzing and Planned -> Planning are permitted as
    /// idempotent refreshes. Verifying never goes back to Planning.
    pub fn can_transition_to(&self, next: &WorkflowStatus) -> bool {
        use WorkflowStatus::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Created, Analyzing)
                | (Analyzing, Analyzed)
                | (Analyzed, Planning)
                | (Analyzed, Analyzing)
                | (Planning, Planned)
                | (Planned, Executing)
                | (Planned, Planning)
                | (Executing, Verifying)
                | (Verifying, Completed)
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "automation_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AutomationMode {
    /// Pause on completions and failures and wait for a human decision.
    #[default]
    Assisted,
    /// Retry failures up to the configured ceiling, never pause.
    Autonomous,
}

impl std::fmt::Display for AutomationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutomationMode::Assisted => write!(f, "assisted"),
            AutomationMode::Autonomous => write!(f, "autonomous"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "workflow_origin", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOrigin {
    #[default]
    Manual,
    Guardian,
}

impl std::fmt::Display for WorkflowOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowOrigin::Manual => write!(f, "manual"),
            WorkflowOrigin::Guardian => write!(f, "guardian"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Link back to the external issue a workflow was opened for. The engine
/// never interprets this, it only carries it for downstream reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssueLink {
    pub url: Option<String>,
    pub provider: Option<String>,
    pub number: Option<i64>,
    pub owner: Option<String>,
    pub repo: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub repo_path: String,
    pub base_branch: Option<String>,
    pub status: WorkflowStatus,
    pub automation: AutomationMode,
    pub origin: WorkflowOrigin,
    pub guardian_ref: Option<String>,
    pub priority: Priority,
    pub issue_link: Option<String>, // JSON
    /// Suggested capability for the plan's main step (guardian templates).
    pub capability_hint: Option<String>,
    pub planning_context: Option<String>,
    pub execution_plan: Option<String>,
    pub sandbox_path: Option<String>,
    pub branch_name: Option<String>,
    pub max_parallel: i64,
    pub current_wave: i64,
    pub needs_attention: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflow {
    pub title: String,
    pub description: Option<String>,
    pub repo_path: String,
    pub base_branch: Option<String>,
    #[serde(default)]
    pub automation: AutomationMode,
    #[serde(default)]
    pub origin: WorkflowOrigin,
    pub guardian_ref: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    pub issue_link: Option<IssueLink>,
    pub capability_hint: Option<String>,
    pub max_parallel: Option<i64>,
}

impl Workflow {
    /// Parse the issue link JSON, if any.
    pub fn issue_link_parsed(&self) -> Option<IssueLink> {
        self.issue_link
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateWorkflow,
        id: Uuid,
        default_max_parallel: i64,
    ) -> Result<Self, WorkflowError> {
        let issue_link = data
            .issue_link
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let max_parallel = data.max_parallel.unwrap_or(default_max_parallel).max(1);

        let workflow = sqlx::query_as::<_, Workflow>(
            r#"
            INSERT INTO workflows (
                id, title, description, repo_path, base_branch, automation,
                origin, guardian_ref, priority, issue_link, capability_hint, max_parallel
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&data.title)
        .bind(&data.description)
        .bind(&data.repo_path)
        .bind(&data.base_branch)
        .bind(data.automation.to_string())
        .bind(data.origin.to_string())
        .bind(&data.guardian_ref)
        .bind(data.priority.to_string())
        .bind(issue_link)
        .bind(&data.capability_hint)
        .bind(max_parallel)
        .fetch_one(pool)
        .await?;

        Ok(workflow)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, WorkflowError> {
        let workflow = sqlx::query_as::<_, Workflow>(r#"SELECT * FROM workflows WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(workflow)
    }

    pub async fn find_filtered(
        pool: &SqlitePool,
        status: Option<WorkflowStatus>,
        origin: Option<WorkflowOrigin>,
    ) -> Result<Vec<Self>, WorkflowError> {
        let workflows = sqlx::query_as::<_, Workflow>(
            r#"
            SELECT * FROM workflows
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR origin = ?2)
            ORDER BY created_at DESC
            "#,
        )
        .bind(status.map(|s| s.to_string()))
        .bind(origin.map(|o| o.to_string()))
        .fetch_all(pool)
        .await?;

        Ok(workflows)
    }

    pub async fn find_by_status(
        pool: &SqlitePool,
        status: WorkflowStatus,
    ) -> Result<Vec<Self>, WorkflowError> {
        let workflows = sqlx::query_as::<_, Workflow>(
            r#"
            SELECT * FROM workflows
            WHERE status = ?1
            ORDER BY created_at DESC
            "#,
        )
        .bind(status.to_string())
        .fetch_all(pool)
        .await?;

        Ok(workflows)
    }

    /// Compare-and-set transition from an expected status.
    ///
    /// The legality check runs first; the guarded UPDATE then protects
    /// against a concurrent mover. A missed update re-reads the row and
    /// reports what actually happened.
    pub async fn try_transition(
        pool: &SqlitePool,
        id: Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
    ) -> Result<Self, WorkflowError> {
        if !from.can_transition_to(&to) {
            return Err(WorkflowError::InvalidTransition { from, to });
        }

        // Entering a terminal state stamps completed_at and clears the
        // attention flag.
        let query = if to.is_terminal() {
            r#"
            UPDATE workflows
            SET status = ?3,
                needs_attention = 0,
                completed_at = datetime('now', 'subsec'),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = ?2
            RETURNING *
            "#
        } else {
            r#"
            UPDATE workflows
            SET status = ?3,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = ?2
            RETURNING *
            "#
        };

        let updated = sqlx::query_as::<_, Workflow>(query)
            .bind(id)
            .bind(from.to_string())
            .bind(to.to_string())
            .fetch_optional(pool)
            .await?;

        match updated {
            Some(workflow) => Ok(workflow),
            None => {
                let current = Self::find_by_id(pool, id)
                    .await?
                    .ok_or(WorkflowError::NotFound)?;
                Err(WorkflowError::Conflict {
                    expected: from,
                    actual: current.status,
                })
            }
        }
    }

    /// Transition from whatever the row currently holds.
    pub async fn transition(
        pool: &SqlitePool,
        id: Uuid,
        to: WorkflowStatus,
    ) -> Result<Self, WorkflowError> {
        let current = Self::find_by_id(pool, id)
            .await?
            .ok_or(WorkflowError::NotFound)?;
        Self::try_transition(pool, id, current.status, to).await
    }

    /// Mark the workflow failed with a reason, from any non-terminal state.
    pub async fn fail(pool: &SqlitePool, id: Uuid, reason: &str) -> Result<Self, WorkflowError> {
        let updated = sqlx::query_as::<_, Workflow>(
            r#"
            UPDATE workflows
            SET status = 'failed',
                error = ?2,
                needs_attention = 0,
                completed_at = datetime('now', 'subsec'),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(reason)
        .fetch_optional(pool)
        .await?;

        match updated {
            Some(workflow) => Ok(workflow),
            None => {
                let current = Self::find_by_id(pool, id)
                    .await?
                    .ok_or(WorkflowError::NotFound)?;
                Err(WorkflowError::InvalidTransition {
                    from: current.status,
                    to: WorkflowStatus::Failed,
                })
            }
        }
    }

    pub async fn update_planning_context(
        pool: &SqlitePool,
        id: Uuid,
        context: &str,
    ) -> Result<Self, WorkflowError> {
        let workflow = sqlx::query_as::<_, Workflow>(
            r#"
            UPDATE workflows
            SET planning_context = ?2, updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(context)
        .fetch_optional(pool)
        .await?;

        workflow.ok_or(WorkflowError::NotFound)
    }

    pub async fn update_execution_plan(
        pool: &SqlitePool,
        id: Uuid,
        plan: &str,
    ) -> Result<Self, WorkflowError> {
        let workflow = sqlx::query_as::<_, Workflow>(
            r#"
            UPDATE workflows
            SET execution_plan = ?2, updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(plan)
        .fetch_optional(pool)
        .await?;

        workflow.ok_or(WorkflowError::NotFound)
    }

    /// Pin the sandbox location. Immutable once set: re-pinning the same
    /// path is an idempotent no-op, a different path is an error.
    pub async fn set_sandbox(
        pool: &SqlitePool,
        id: Uuid,
        sandbox_path: &str,
        branch_name: &str,
    ) -> Result<Self, WorkflowError> {
        let updated = sqlx::query_as::<_, Workflow>(
            r#"
            UPDATE workflows
            SET sandbox_path = ?2, branch_name = ?3, updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND (sandbox_path IS NULL OR sandbox_path = ?2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(sandbox_path)
        .bind(branch_name)
        .fetch_optional(pool)
        .await?;

        match updated {
            Some(workflow) => Ok(workflow),
            None => {
                let current = Self::find_by_id(pool, id)
                    .await?
                    .ok_or(WorkflowError::NotFound)?;
                Err(WorkflowError::SandboxPinned {
                    existing: current.sandbox_path.unwrap_or_default(),
                })
            }
        }
    }

    pub async fn set_needs_attention(
        pool: &SqlitePool,
        id: Uuid,
        needs_attention: bool,
    ) -> Result<Self, WorkflowError> {
        let workflow = sqlx::query_as::<_, Workflow>(
            r#"
            UPDATE workflows
            SET needs_attention = ?2, updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(needs_attention)
        .fetch_optional(pool)
        .await?;

        workflow.ok_or(WorkflowError::NotFound)
    }

    pub async fn set_current_wave(
        pool: &SqlitePool,
        id: Uuid,
        wave: i64,
    ) -> Result<Self, WorkflowError> {
        let workflow = sqlx::query_as::<_, Workflow>(
            r#"
            UPDATE workflows
            SET current_wave = ?2, updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(wave)
        .fetch_optional(pool)
        .await?;

        workflow.ok_or(WorkflowError::NotFound)
    }

    /// Delete the workflow row. Steps go with it via the FK cascade.
    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<(), WorkflowError> {
        let result = sqlx::query(r#"DELETE FROM workflows WHERE id = ?1"#)
            .bind(id)
            .execute(pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(WorkflowError::NotFound);
        }
        Ok(())
    }
}
