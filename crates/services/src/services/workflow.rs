//! Workflow lifecycle facade.
//!
//! Everything the HTTP layer does to a workflow goes through here: create,
//! analyze, plan, run, cancel, complete, discard, progress, and the manual
//! step verbs. The facade owns the cancellation tokens of running workflows
//! and is the only place that spawns the scheduler.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use db::DBService;
use db::models::workflow::{
    CreateWorkflow, Workflow, WorkflowError, WorkflowOrigin, WorkflowStatus,
};
use db::models::workflow_step::{
    CreateWorkflowStep, StepApproval, StepStatus, WorkflowStep, WorkflowStepError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::services::approvals::{Approvals, StepDecision};
use crate::services::config::ConductorConfig;
use crate::services::planner::{Planner, PlannerError};
use crate::services::sandbox::{SandboxError, SandboxProvider};
use crate::services::scheduler::{SchedulerError, SchedulerService};

#[derive(Debug, Error)]
pub enum WorkflowServiceError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Step(#[from] WorkflowStepError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("{0}")]
    Validation(String),
    #[error("no decision is pending for this step")]
    NoPendingDecision,
}

/// A workflow with its plan inlined, as the API returns it.
#[derive(Debug, Serialize)]
pub struct WorkflowWithSteps {
    #[serde(flatten)]
    pub workflow: Workflow,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    pub current_wave: i64,
    pub needs_attention: bool,
    pub waves: Vec<WaveProgress>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveProgress {
    pub wave: i64,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct WorkflowService {
    db: DBService,
    config: Arc<ConductorConfig>,
    sandboxes: Arc<dyn SandboxProvider>,
    approvals: Arc<Approvals>,
    scheduler: SchedulerService,
    planner: Arc<dyn Planner>,
    running: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl WorkflowService {
    pub fn new(
        db: DBService,
        config: Arc<ConductorConfig>,
        sandboxes: Arc<dyn SandboxProvider>,
        approvals: Arc<Approvals>,
        scheduler: SchedulerService,
        planner: Arc<dyn Planner>,
    ) -> Self {
        Self {
            db,
            config,
            sandboxes,
            approvals,
            scheduler,
            planner,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn create(&self, data: CreateWorkflow) -> Result<Workflow, WorkflowServiceError> {
        if data.title.trim().is_empty() {
            return Err(WorkflowServiceError::Validation(
                "workflow title must not be empty".to_string(),
            ));
        }
        if !Path::new(&data.repo_path).is_dir() {
            return Err(WorkflowServiceError::Validation(format!(
                "repository path '{}' is not a directory",
                data.repo_path
            )));
        }
        Ok(Workflow::create(
            &self.db.pool,
            &data,
            Uuid::new_v4(),
            self.config.default_max_parallel,
        )
        .await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<WorkflowWithSteps, WorkflowServiceError> {
        let workflow = Workflow::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(WorkflowError::NotFound)?;
        let steps = WorkflowStep::find_by_workflow(&self.db.pool, id).await?;
        Ok(WorkflowWithSteps { workflow, steps })
    }

    pub async fn list(
        &self,
        status: Option<WorkflowStatus>,
        origin: Option<WorkflowOrigin>,
    ) -> Result<Vec<Workflow>, WorkflowServiceError> {
        Ok(Workflow::find_filtered(&self.db.pool, status, origin).await?)
    }

    /// Run the analysis pass and store its context on the workflow.
    pub async fn analyze(&self, id: Uuid) -> Result<Workflow, WorkflowServiceError> {
        let workflow = Workflow::transition(&self.db.pool, id, WorkflowStatus::Analyzing).await?;

        let context = match self.planner.analyze(&workflow).await {
            Ok(context) => context,
            Err(e) => {
                self.fail_quietly(id, &format!("analysis failed: {e}")).await;
                return Err(e.into());
            }
        };
        Workflow::update_planning_context(&self.db.pool, id, &context).await?;
        Ok(Workflow::transition(&self.db.pool, id, WorkflowStatus::Analyzed).await?)
    }

    /// Provision the sandbox, draft the plan, and persist it.
    ///
    /// Re-planning an already planned workflow is allowed and replaces the
    /// previous plan wholesale; the sandbox is reused.
    pub async fn plan(&self, id: Uuid) -> Result<Workflow, WorkflowServiceError> {
        let workflow = Workflow::transition(&self.db.pool, id, WorkflowStatus::Planning).await?;

        let sandbox = match self
            .sandboxes
            .create(
                Path::new(&workflow.repo_path),
                workflow.id,
                workflow.base_branch.as_deref(),
            )
            .await
        {
            Ok(info) => info,
            Err(e) => {
                self.fail_quietly(id, &format!("sandbox provisioning failed: {e}"))
                    .await;
                return Err(e.into());
            }
        };
        let workflow = Workflow::set_sandbox(
            &self.db.pool,
            id,
            &sandbox.sandbox_path.to_string_lossy(),
            &sandbox.branch_name,
        )
        .await?;

        let draft = match self.planner.plan(&workflow).await {
            Ok(draft) => draft,
            Err(e) => {
                self.fail_quietly(id, &format!("planning failed: {e}")).await;
                return Err(e.into());
            }
        };
        if let Err(reason) = validate_plan(&draft.steps) {
            self.fail_quietly(id, &reason).await;
            return Err(WorkflowServiceError::Validation(reason));
        }

        WorkflowStep::replace_plan(&self.db.pool, id, &draft.steps).await?;
        Workflow::update_execution_plan(&self.db.pool, id, &draft.summary).await?;
        Ok(Workflow::transition(&self.db.pool, id, WorkflowStatus::Planned).await?)
    }

    /// Move the workflow into Executing and spawn the scheduler for it.
    pub async fn run(&self, id: Uuid) -> Result<Workflow, WorkflowServiceError> {
        let workflow = Workflow::transition(&self.db.pool, id, WorkflowStatus::Executing).await?;

        let token = CancellationToken::new();
        self.running.lock().await.insert(id, token.clone());

        let scheduler = self.scheduler.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.drive(id, token).await {
                tracing::error!("Workflow {} driver errored: {}", id, e);
            }
            running.lock().await.remove(&id);
        });

        Ok(workflow)
    }

    /// Cancel a workflow, unblocking its scheduler and releasing its steps.
    pub async fn cancel(&self, id: Uuid) -> Result<Workflow, WorkflowServiceError> {
        Workflow::transition(&self.db.pool, id, WorkflowStatus::Cancelled).await?;

        if let Some(token) = self.running.lock().await.remove(&id) {
            token.cancel();
        }
        let released = WorkflowStep::reset_running(&self.db.pool, id).await?;
        if released > 0 {
            tracing::info!(
                "Released {} running steps of cancelled workflow {}",
                released,
                id
            );
        }
        // A step that raced into a decision pause after the transition may
        // have re-set the attention flag.
        Ok(Workflow::set_needs_attention(&self.db.pool, id, false).await?)
    }

    /// Final confirmation of a verified workflow. Idempotent once completed.
    pub async fn complete(&self, id: Uuid) -> Result<Workflow, WorkflowServiceError> {
        let workflow = Workflow::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(WorkflowError::NotFound)?;
        if workflow.status == WorkflowStatus::Completed {
            return Ok(workflow);
        }
        Ok(Workflow::transition(&self.db.pool, id, WorkflowStatus::Completed).await?)
    }

    /// Delete a workflow and its sandbox. Cancels it first when still live.
    pub async fn discard(&self, id: Uuid, force: bool) -> Result<(), WorkflowServiceError> {
        let Some(workflow) = Workflow::find_by_id(&self.db.pool, id).await? else {
            return Ok(());
        };

        if !workflow.status.is_terminal() {
            match self.cancel(id).await {
                Ok(_) => {}
                Err(WorkflowServiceError::Workflow(
                    WorkflowError::InvalidTransition { .. } | WorkflowError::Conflict { .. },
                )) => {}
                Err(e) => return Err(e),
            }
        }

        self.sandboxes.remove(id, force).await?;
        match Workflow::delete(&self.db.pool, id).await {
            Ok(()) | Err(WorkflowError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn progress(&self, id: Uuid) -> Result<ProgressSnapshot, WorkflowServiceError> {
        let workflow = Workflow::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(WorkflowError::NotFound)?;
        let steps = WorkflowStep::find_by_workflow(&self.db.pool, id).await?;

        let mut waves: BTreeMap<i64, WaveProgress> = BTreeMap::new();
        for step in &steps {
            let entry = waves.entry(step.wave).or_insert_with(|| WaveProgress {
                wave: step.wave,
                ..Default::default()
            });
            match step.status {
                StepStatus::Pending => entry.pending += 1,
                StepStatus::Running => entry.running += 1,
                StepStatus::Completed => entry.completed += 1,
                StepStatus::Failed => entry.failed += 1,
                StepStatus::Skipped => entry.skipped += 1,
            }
        }

        Ok(ProgressSnapshot {
            workflow_id: workflow.id,
            status: workflow.status,
            current_wave: workflow.current_wave,
            needs_attention: workflow.needs_attention,
            waves: waves.into_values().collect(),
        })
    }

    /// Dispatch one pending step outside the scheduler, synchronously.
    pub async fn execute_step(&self, step_id: Uuid) -> Result<WorkflowStep, WorkflowServiceError> {
        let step = self.step(step_id).await?;
        if step.status != StepStatus::Pending {
            return Err(WorkflowServiceError::Validation(format!(
                "step is {}, only pending steps can be dispatched",
                step.status
            )));
        }
        let workflow = Workflow::find_by_id(&self.db.pool, step.workflow_id)
            .await?
            .ok_or(WorkflowError::NotFound)?;
        Ok(self.scheduler.dispatch_step(&workflow, step_id).await?)
    }

    /// Approve a completed step. Resolves the parked scheduler when there is
    /// one, records the approval directly otherwise.
    pub async fn approve_step(&self, step_id: Uuid) -> Result<WorkflowStep, WorkflowServiceError> {
        if self.approvals.resolve(step_id, StepDecision::Approve).await {
            return self.step(step_id).await;
        }
        let step = self.step(step_id).await?;
        if step.status == StepStatus::Completed && step.approval.is_none() {
            return Ok(WorkflowStep::set_approval(
                &self.db.pool,
                step_id,
                StepApproval::Approved,
                None,
            )
            .await?);
        }
        Err(WorkflowServiceError::NoPendingDecision)
    }

    /// Reject a completed step, sending it back for rework with feedback.
    pub async fn reject_step(
        &self,
        step_id: Uuid,
        feedback: Option<String>,
    ) -> Result<WorkflowStep, WorkflowServiceError> {
        if self
            .approvals
            .resolve(
                step_id,
                StepDecision::Reject {
                    feedback: feedback.clone(),
                },
            )
            .await
        {
            return self.step(step_id).await;
        }
        let step = self.step(step_id).await?;
        if step.status == StepStatus::Completed {
            return Ok(
                WorkflowStep::begin_rework(&self.db.pool, step_id, feedback.as_deref()).await?,
            );
        }
        Err(WorkflowServiceError::NoPendingDecision)
    }

    /// Retry a failed step, optionally with replacement input.
    pub async fn retry_step(
        &self,
        step_id: Uuid,
        input: Option<String>,
    ) -> Result<WorkflowStep, WorkflowServiceError> {
        if self
            .approvals
            .resolve(
                step_id,
                StepDecision::Retry {
                    input: input.clone(),
                },
            )
            .await
        {
            return self.step(step_id).await;
        }
        let step = self.step(step_id).await?;
        if step.status != StepStatus::Failed {
            return Err(WorkflowServiceError::NoPendingDecision);
        }
        if let Some(input) = &input {
            WorkflowStep::update_input(&self.db.pool, step_id, input).await?;
        }
        WorkflowStep::reset_to_pending(&self.db.pool, step_id).await?;
        let workflow = Workflow::find_by_id(&self.db.pool, step.workflow_id)
            .await?
            .ok_or(WorkflowError::NotFound)?;
        Ok(self.scheduler.dispatch_step(&workflow, step_id).await?)
    }

    /// Skip a step. Unstarted and failed steps can always be skipped.
    pub async fn skip_step(
        &self,
        step_id: Uuid,
        reason: Option<String>,
    ) -> Result<WorkflowStep, WorkflowServiceError> {
        if self
            .approvals
            .resolve(
                step_id,
                StepDecision::Skip {
                    reason: reason.clone(),
                },
            )
            .await
        {
            return self.step(step_id).await;
        }
        let step = self.step(step_id).await?;
        match step.status {
            StepStatus::Pending | StepStatus::Failed => {
                Ok(WorkflowStep::mark_skipped(&self.db.pool, step_id, reason.as_deref()).await?)
            }
            StepStatus::Skipped => Ok(step),
            StepStatus::Running | StepStatus::Completed => {
                Err(WorkflowServiceError::Validation(format!(
                    "a {} step cannot be skipped",
                    step.status
                )))
            }
        }
    }

    /// Fail workflows that were in flight when the server last stopped.
    ///
    /// Runs once at startup, before any new work is accepted. Their running
    /// steps go back to pending so a later re-plan starts from clean rows.
    pub async fn recover_interrupted(&self) -> Result<u64, WorkflowServiceError> {
        let mut recovered = 0;
        for status in [
            WorkflowStatus::Analyzing,
            WorkflowStatus::Planning,
            WorkflowStatus::Executing,
        ] {
            for workflow in Workflow::find_by_status(&self.db.pool, status).await? {
                let released = WorkflowStep::reset_running(&self.db.pool, workflow.id).await?;
                if released > 0 {
                    tracing::info!(
                        "Released {} steps of interrupted workflow {}",
                        released,
                        workflow.id
                    );
                }
                self.fail_quietly(workflow.id, "interrupted by server restart")
                    .await;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn step(&self, step_id: Uuid) -> Result<WorkflowStep, WorkflowServiceError> {
        Ok(WorkflowStep::find_by_id(&self.db.pool, step_id)
            .await?
            .ok_or(WorkflowStepError::NotFound)?)
    }

    async fn fail_quietly(&self, id: Uuid, reason: &str) {
        if let Err(e) = Workflow::fail(&self.db.pool, id, reason).await {
            tracing::error!("Could not mark workflow {} failed: {}", id, e);
        }
    }
}

fn validate_plan(steps: &[CreateWorkflowStep]) -> Result<(), String> {
    if steps.is_empty() {
        return Err("planner produced an empty plan".to_string());
    }
    let mut last_wave = 0;
    for step in steps {
        if step.name.trim().is_empty() {
            return Err("plan contains a step without a name".to_string());
        }
        if step.wave < 0 {
            return Err(format!("step '{}' has a negative wave", step.name));
        }
        if step.wave < last_wave {
            return Err(format!(
                "step '{}' goes back to wave {} after wave {}",
                step.name, step.wave, last_wave
            ));
        }
        last_wave = step.wave;
    }
    Ok(())
}
