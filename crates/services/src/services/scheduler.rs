//! Wave-based step scheduler.
//!
//! Steps run wave by wave: everything in one wave is dispatched concurrently
//! (bounded by the workflow's `max_parallel`), and the next wave starts only
//! once every step of the current wave is resolved. A step resolves as
//! Completed (approved where assisted), Skipped, or terminally Failed; a
//! terminal failure fails the whole workflow.
//!
//! Assisted workflows park on [`Approvals`] whenever a step completes or
//! fails and resume when a decision arrives; autonomous workflows retry
//! failures up to the configured attempt ceiling instead. Cancellation
//! unblocks every suspension point through the workflow's token.

use std::sync::Arc;

use db::DBService;
use db::models::workflow::{AutomationMode, Workflow, WorkflowError, WorkflowStatus};
use db::models::workflow_step::{StepApproval, StepStatus, WorkflowStep, WorkflowStepError};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use workers::{WorkerExecutor, WorkerProfile, WorkerRegistry, WorkerRequest};

use crate::services::approvals::{Approvals, StepDecision};
use crate::services::config::ConductorConfig;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Step(#[from] WorkflowStepError),
}

enum StepOutcome {
    Resolved,
    FailedTerminal { name: String, error: String },
    Cancelled,
}

enum WaveOutcome {
    Resolved,
    Failed { summary: String },
    Cancelled,
}

/// What a paused-then-decided failed step does next.
enum Resume {
    Redispatch(WorkflowStep),
    Resolved,
    Cancelled,
}

#[derive(Clone)]
pub struct SchedulerService {
    db: DBService,
    registry: Arc<WorkerRegistry>,
    executor: Arc<dyn WorkerExecutor>,
    approvals: Arc<Approvals>,
    config: Arc<ConductorConfig>,
}

impl SchedulerService {
    pub fn new(
        db: DBService,
        registry: Arc<WorkerRegistry>,
        executor: Arc<dyn WorkerExecutor>,
        approvals: Arc<Approvals>,
        config: Arc<ConductorConfig>,
    ) -> Self {
        Self {
            db,
            registry,
            executor,
            approvals,
            config,
        }
    }

    /// Run an Executing workflow's plan to its terminal outcome.
    ///
    /// Waves are processed in ascending order; each wave is a hard barrier.
    /// When every wave resolves the workflow moves Executing -> Verifying ->
    /// Completed; a terminally failed step fails the workflow instead.
    /// Cancellation returns early and leaves the status change to the
    /// cancelling caller.
    pub async fn drive(
        &self,
        workflow_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<(), SchedulerError> {
        let Some(workflow) = Workflow::find_by_id(&self.db.pool, workflow_id).await? else {
            tracing::warn!("[Scheduler] Workflow {} vanished before driving", workflow_id);
            return Ok(());
        };
        if workflow.status != WorkflowStatus::Executing {
            tracing::debug!(
                "[Scheduler] Workflow {} is {}, nothing to drive",
                workflow_id,
                workflow.status
            );
            return Ok(());
        }

        let steps = WorkflowStep::find_by_workflow(&self.db.pool, workflow_id).await?;
        let mut waves: Vec<i64> = steps
            .iter()
            .filter(|step| step.status == StepStatus::Pending)
            .map(|step| step.wave)
            .collect();
        waves.sort_unstable();
        waves.dedup();

        for wave in waves {
            if cancel.is_cancelled() {
                return Ok(());
            }
            Workflow::set_current_wave(&self.db.pool, workflow_id, wave).await?;
            tracing::info!("[Scheduler] Workflow {} entering wave {}", workflow_id, wave);

            match self.run_wave(&workflow, wave, &cancel).await? {
                WaveOutcome::Resolved => {}
                WaveOutcome::Cancelled => {
                    tracing::info!("[Scheduler] Workflow {} cancelled mid-wave", workflow_id);
                    return Ok(());
                }
                WaveOutcome::Failed { summary } => {
                    tracing::warn!("[Scheduler] Workflow {} failed: {}", workflow_id, summary);
                    tolerate_move(Workflow::fail(&self.db.pool, workflow_id, &summary).await)?;
                    return Ok(());
                }
            }
        }

        tolerate_move(
            Workflow::transition(&self.db.pool, workflow_id, WorkflowStatus::Verifying).await,
        )?;
        tolerate_move(
            Workflow::transition(&self.db.pool, workflow_id, WorkflowStatus::Completed).await,
        )?;
        tracing::info!("[Scheduler] Workflow {} completed", workflow_id);
        Ok(())
    }

    async fn run_wave(
        &self,
        workflow: &Workflow,
        wave: i64,
        cancel: &CancellationToken,
    ) -> Result<WaveOutcome, SchedulerError> {
        let steps =
            WorkflowStep::find_pending_in_wave(&self.db.pool, workflow.id, wave).await?;
        let semaphore = Arc::new(Semaphore::new(workflow.max_parallel.max(1) as usize));

        let mut handles = Vec::with_capacity(steps.len());
        for step in steps {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let scheduler = self.clone();
            let workflow = workflow.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                scheduler
                    .run_step_to_resolution(&workflow, step.id, &cancel)
                    .await
            }));
        }

        let mut first_error: Option<SchedulerError> = None;
        let mut failed: Option<(String, String)> = None;
        let mut cancelled = cancel.is_cancelled();
        for handle in handles {
            match handle.await {
                Ok(Ok(StepOutcome::Resolved)) => {}
                Ok(Ok(StepOutcome::FailedTerminal { name, error })) => {
                    if failed.is_none() {
                        failed = Some((name, error));
                    }
                }
                Ok(Ok(StepOutcome::Cancelled)) => cancelled = true,
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    tracing::error!("[Scheduler] Step task panicked: {}", join_err);
                    if failed.is_none() {
                        failed = Some(("step task".to_string(), "task panicked".to_string()));
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if cancelled {
            return Ok(WaveOutcome::Cancelled);
        }
        if let Some((name, error)) = failed {
            return Ok(WaveOutcome::Failed {
                summary: format!("step '{name}' failed: {error}"),
            });
        }
        Ok(WaveOutcome::Resolved)
    }

    /// Drive one step until it is resolved, cancelled, or terminally failed.
    async fn run_step_to_resolution(
        &self,
        workflow: &Workflow,
        step_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, SchedulerError> {
        let Some(mut step) = WorkflowStep::find_by_id(&self.db.pool, step_id).await? else {
            return Ok(StepOutcome::Cancelled);
        };

        loop {
            if cancel.is_cancelled() {
                return Ok(StepOutcome::Cancelled);
            }

            // Selection runs fresh on every dispatch so a reloaded registry
            // is honored by retries.
            let worker = match self
                .registry
                .select(&step.capability, step.language.as_deref())
                .await
            {
                Ok(worker) => worker,
                Err(e) => {
                    let message = e.to_string();
                    step = WorkflowStep::mark_failed(&self.db.pool, step.id, &message).await?;
                    match workflow.automation {
                        AutomationMode::Autonomous => {
                            return Ok(StepOutcome::FailedTerminal {
                                name: step.name,
                                error: message,
                            });
                        }
                        AutomationMode::Assisted => {
                            match self.decide_failed_step(workflow, &step, cancel).await? {
                                Resume::Redispatch(fresh) => {
                                    step = fresh;
                                    continue;
                                }
                                Resume::Resolved => return Ok(StepOutcome::Resolved),
                                Resume::Cancelled => return Ok(StepOutcome::Cancelled),
                            }
                        }
                    }
                }
            };

            step = WorkflowStep::mark_running(&self.db.pool, step.id, &worker.id).await?;
            let request = self.build_request(workflow, &step, &worker).await?;

            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(StepOutcome::Cancelled),
                result = self.executor.execute(request) => result,
            };

            match result {
                Ok(output) => {
                    step = WorkflowStep::mark_completed(&self.db.pool, step.id, &output).await?;
                    tracing::info!(
                        "[Scheduler] Step '{}' completed (attempt {})",
                        step.name,
                        step.attempts
                    );

                    match workflow.automation {
                        AutomationMode::Autonomous => return Ok(StepOutcome::Resolved),
                        AutomationMode::Assisted => {
                            match self.await_decision(workflow.id, step.id, cancel).await? {
                                None => return Ok(StepOutcome::Cancelled),
                                Some(StepDecision::Approve) => {
                                    WorkflowStep::set_approval(
                                        &self.db.pool,
                                        step.id,
                                        StepApproval::Approved,
                                        None,
                                    )
                                    .await?;
                                    return Ok(StepOutcome::Resolved);
                                }
                                Some(StepDecision::Reject { feedback }) => {
                                    step = WorkflowStep::begin_rework(
                                        &self.db.pool,
                                        step.id,
                                        feedback.as_deref(),
                                    )
                                    .await?;
                                }
                                Some(StepDecision::Retry { input }) => {
                                    if let Some(input) = &input {
                                        WorkflowStep::update_input(&self.db.pool, step.id, input)
                                            .await?;
                                    }
                                    step =
                                        WorkflowStep::reset_to_pending(&self.db.pool, step.id)
                                            .await?;
                                }
                                Some(StepDecision::Skip { reason }) => {
                                    WorkflowStep::mark_skipped(
                                        &self.db.pool,
                                        step.id,
                                        reason.as_deref(),
                                    )
                                    .await?;
                                    return Ok(StepOutcome::Resolved);
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    step = WorkflowStep::mark_failed(&self.db.pool, step.id, &message).await?;

                    match workflow.automation {
                        AutomationMode::Autonomous => {
                            if step.attempts < self.config.max_step_attempts.max(1) {
                                tracing::warn!(
                                    "[Scheduler] Step '{}' attempt {} failed, retrying: {}",
                                    step.name,
                                    step.attempts,
                                    message
                                );
                                step = WorkflowStep::reset_to_pending(&self.db.pool, step.id)
                                    .await?;
                                continue;
                            }
                            return Ok(StepOutcome::FailedTerminal {
                                name: step.name,
                                error: message,
                            });
                        }
                        AutomationMode::Assisted => {
                            match self.decide_failed_step(workflow, &step, cancel).await? {
                                Resume::Redispatch(fresh) => step = fresh,
                                Resume::Resolved => return Ok(StepOutcome::Resolved),
                                Resume::Cancelled => return Ok(StepOutcome::Cancelled),
                            }
                        }
                    }
                }
            }
        }
    }

    /// Park a failed step for a human decision and apply it.
    ///
    /// Valid verbs here are retry, edit-and-retry, and skip; reject is folded
    /// into retry-with-feedback. Approve makes no sense for a failed step and
    /// re-parks the wait.
    async fn decide_failed_step(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        cancel: &CancellationToken,
    ) -> Result<Resume, SchedulerError> {
        loop {
            match self.await_decision(workflow.id, step.id, cancel).await? {
                None => return Ok(Resume::Cancelled),
                Some(StepDecision::Retry { input }) => {
                    if let Some(input) = &input {
                        WorkflowStep::update_input(&self.db.pool, step.id, input).await?;
                    }
                    let fresh = WorkflowStep::reset_to_pending(&self.db.pool, step.id).await?;
                    return Ok(Resume::Redispatch(fresh));
                }
                Some(StepDecision::Reject { feedback }) => {
                    let fresh =
                        WorkflowStep::begin_rework(&self.db.pool, step.id, feedback.as_deref())
                            .await?;
                    return Ok(Resume::Redispatch(fresh));
                }
                Some(StepDecision::Skip { reason }) => {
                    WorkflowStep::mark_skipped(&self.db.pool, step.id, reason.as_deref()).await?;
                    return Ok(Resume::Resolved);
                }
                Some(StepDecision::Approve) => {
                    tracing::warn!(
                        "[Scheduler] Approve is not a valid decision for failed step {}",
                        step.id
                    );
                }
            }
        }
    }

    /// Block until a decision or cancellation. Sets the workflow's attention
    /// flag while parked and clears it once nothing else is waiting.
    async fn await_decision(
        &self,
        workflow_id: Uuid,
        step_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<StepDecision>, SchedulerError> {
        Workflow::set_needs_attention(&self.db.pool, workflow_id, true).await?;
        let receiver = self.approvals.register(workflow_id, step_id).await;
        tracing::info!(
            "[Scheduler] Step {} of workflow {} awaiting decision",
            step_id,
            workflow_id
        );

        let decision = tokio::select! {
            _ = cancel.cancelled() => {
                self.approvals.discard(step_id).await;
                None
            }
            decision = receiver => decision.ok(),
        };

        if decision.is_some() && !self.approvals.waiting_for_workflow(workflow_id).await {
            Workflow::set_needs_attention(&self.db.pool, workflow_id, false).await?;
        }
        Ok(decision)
    }

    /// One manual dispatch with no retry or pause semantics. The outcome
    /// lands on the step row either way.
    pub async fn dispatch_step(
        &self,
        workflow: &Workflow,
        step_id: Uuid,
    ) -> Result<WorkflowStep, SchedulerError> {
        let step = WorkflowStep::find_by_id(&self.db.pool, step_id)
            .await?
            .ok_or(WorkflowStepError::NotFound)?;

        let worker = match self
            .registry
            .select(&step.capability, step.language.as_deref())
            .await
        {
            Ok(worker) => worker,
            Err(e) => {
                return Ok(
                    WorkflowStep::mark_failed(&self.db.pool, step.id, &e.to_string()).await?
                );
            }
        };

        let step = WorkflowStep::mark_running(&self.db.pool, step.id, &worker.id).await?;
        let request = self.build_request(workflow, &step, &worker).await?;
        match self.executor.execute(request).await {
            Ok(output) => {
                Ok(WorkflowStep::mark_completed(&self.db.pool, step.id, &output).await?)
            }
            Err(e) => {
                Ok(WorkflowStep::mark_failed(&self.db.pool, step.id, &e.to_string()).await?)
            }
        }
    }

    async fn build_request(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        worker: &WorkerProfile,
    ) -> Result<WorkerRequest, SchedulerError> {
        let prior_outputs = self.prior_outputs(workflow.id, step.wave).await?;
        Ok(WorkerRequest {
            workflow_id: workflow.id,
            step_id: step.id,
            worker_id: worker.id.clone(),
            capability: step.capability.clone(),
            language: step.language.clone(),
            step_name: step.name.clone(),
            description: step.description.clone(),
            input: step.input.clone(),
            feedback: step.approval_feedback.clone(),
            prior_outputs,
            sandbox_path: workflow.sandbox_path.clone(),
            attempt: step.attempts,
            command: worker.command.clone(),
        })
    }

    /// Completed outputs of all earlier waves, in declaration order.
    async fn prior_outputs(
        &self,
        workflow_id: Uuid,
        wave: i64,
    ) -> Result<Vec<String>, SchedulerError> {
        let steps = WorkflowStep::find_by_workflow(&self.db.pool, workflow_id).await?;
        Ok(steps
            .into_iter()
            .filter(|step| step.wave < wave && step.status == StepStatus::Completed)
            .filter_map(|step| step.output)
            .collect())
    }
}

/// A workflow that raced into a terminal state (cancel vs. finish) makes the
/// losing transition moot, not an error.
fn tolerate_move(result: Result<Workflow, WorkflowError>) -> Result<(), WorkflowError> {
    match result {
        Ok(_) => Ok(()),
        Err(WorkflowError::InvalidTransition { .. } | WorkflowError::Conflict { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use db::models::test_utils::setup_test_pool;
    use db::models::workflow::CreateWorkflow;
    use db::models::workflow_step::CreateWorkflowStep;
    use sqlx::SqlitePool;
    use workers::{ExecutorError, WorkerSet};

    use super::*;

    #[derive(Default)]
    struct StubState {
        events: Mutex<Vec<String>>,
        requests: Mutex<Vec<WorkerRequest>>,
        fail_counts: Mutex<HashMap<String, u32>>,
        delays_ms: Mutex<HashMap<String, u64>>,
        inflight: AtomicI64,
        max_inflight: AtomicI64,
    }

    #[derive(Clone, Default)]
    struct StubExecutor {
        state: Arc<StubState>,
    }

    impl StubExecutor {
        fn fail_times(&self, step_name: &str, times: u32) {
            self.state
                .fail_counts
                .lock()
                .unwrap()
                .insert(step_name.to_string(), times);
        }

        fn delay(&self, step_name: &str, ms: u64) {
            self.state
                .delays_ms
                .lock()
                .unwrap()
                .insert(step_name.to_string(), ms);
        }

        fn events(&self) -> Vec<String> {
            self.state.events.lock().unwrap().clone()
        }

        fn requests(&self) -> Vec<WorkerRequest> {
            self.state.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkerExecutor for StubExecutor {
        async fn execute(&self, request: WorkerRequest) -> Result<String, ExecutorError> {
            let state = &self.state;
            let inflight = state.inflight.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_inflight.fetch_max(inflight, Ordering::SeqCst);
            state
                .events
                .lock()
                .unwrap()
                .push(format!("start:{}", request.step_name));
            state.requests.lock().unwrap().push(request.clone());

            let delay = state
                .delays_ms
                .lock()
                .unwrap()
                .get(&request.step_name)
                .copied()
                .unwrap_or(0);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let should_fail = {
                let mut counts = state.fail_counts.lock().unwrap();
                match counts.get_mut(&request.step_name) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        true
                    }
                    _ => false,
                }
            };
            state.inflight.fetch_sub(1, Ordering::SeqCst);

            if should_fail {
                state
                    .events
                    .lock()
                    .unwrap()
                    .push(format!("fail:{}", request.step_name));
                Err(ExecutorError::Failed {
                    status: 1,
                    stderr: format!("scripted failure for {}", request.step_name),
                })
            } else {
                state
                    .events
                    .lock()
                    .unwrap()
                    .push(format!("end:{}", request.step_name));
                Ok(format!("{} output #{}", request.step_name, request.attempt))
            }
        }
    }

    fn generalist() -> WorkerSet {
        WorkerSet {
            workers: vec![WorkerProfile {
                id: "generalist".to_string(),
                name: "Generalist".to_string(),
                capabilities: vec![
                    "coding".to_string(),
                    "testing".to_string(),
                    "review".to_string(),
                ],
                languages: vec![],
                priority: 10,
                enabled: true,
                command: None,
            }],
        }
    }

    fn step(name: &str, wave: i64) -> CreateWorkflowStep {
        CreateWorkflowStep {
            name: name.to_string(),
            description: None,
            capability: "coding".to_string(),
            language: None,
            wave,
            input: Some(format!("do {name}")),
        }
    }

    struct World {
        pool: SqlitePool,
        scheduler: SchedulerService,
        approvals: Arc<Approvals>,
        executor: StubExecutor,
        registry: Arc<WorkerRegistry>,
    }

    async fn world_with(set: WorkerSet, config: ConductorConfig) -> World {
        let pool = setup_test_pool().await;
        let executor = StubExecutor::default();
        let approvals = Arc::new(Approvals::new());
        let registry = Arc::new(WorkerRegistry::from_set(set));
        let scheduler = SchedulerService::new(
            DBService::from_pool(pool.clone()),
            registry.clone(),
            Arc::new(executor.clone()),
            approvals.clone(),
            Arc::new(config),
        );
        World {
            pool,
            scheduler,
            approvals,
            executor,
            registry,
        }
    }

    async fn world() -> World {
        world_with(generalist(), ConductorConfig::default()).await
    }

    async fn stage_executing(
        pool: &SqlitePool,
        automation: AutomationMode,
        max_parallel: i64,
        steps: &[CreateWorkflowStep],
    ) -> (Workflow, Vec<WorkflowStep>) {
        let data = CreateWorkflow {
            title: "scheduled work".to_string(),
            description: None,
            repo_path: "/tmp/repo".to_string(),
            base_branch: None,
            automation,
            origin: Default::default(),
            guardian_ref: None,
            priority: Default::default(),
            issue_link: None,
            capability_hint: None,
            max_parallel: Some(max_parallel),
        };
        let workflow = Workflow::create(pool, &data, Uuid::new_v4(), 4).await.unwrap();
        let rows = WorkflowStep::replace_plan(pool, workflow.id, steps).await.unwrap();

        for to in [
            WorkflowStatus::Analyzing,
            WorkflowStatus::Analyzed,
            WorkflowStatus::Planning,
            WorkflowStatus::Planned,
            WorkflowStatus::Executing,
        ] {
            Workflow::transition(pool, workflow.id, to).await.unwrap();
        }
        let workflow = Workflow::find_by_id(pool, workflow.id).await.unwrap().unwrap();
        (workflow, rows)
    }

    async fn wait_for_pause(approvals: &Approvals, step_id: Uuid) {
        for _ in 0..300 {
            if approvals.is_waiting(step_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("step {step_id} never paused for a decision");
    }

    #[tokio::test]
    async fn waves_form_a_hard_barrier() {
        let w = world().await;
        w.executor.delay("a", 80);
        w.executor.delay("b", 5);
        let (workflow, _) = stage_executing(
            &w.pool,
            AutomationMode::Autonomous,
            4,
            &[step("a", 0), step("b", 0), step("c", 1)],
        )
        .await;

        w.scheduler
            .drive(workflow.id, CancellationToken::new())
            .await
            .unwrap();

        let events = w.executor.events();
        let pos = |needle: &str| events.iter().position(|e| e == needle).unwrap();
        assert!(pos("start:c") > pos("end:a"), "c started before a resolved: {events:?}");
        assert!(pos("start:c") > pos("end:b"), "c started before b resolved: {events:?}");

        let done = Workflow::find_by_id(&w.pool, workflow.id).await.unwrap().unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.current_wave, 1);
    }

    #[tokio::test]
    async fn parallelism_is_capped_per_workflow() {
        let w = world().await;
        for name in ["a", "b", "c", "d"] {
            w.executor.delay(name, 30);
        }
        let (workflow, _) = stage_executing(
            &w.pool,
            AutomationMode::Autonomous,
            2,
            &[step("a", 0), step("b", 0), step("c", 0), step("d", 0)],
        )
        .await;

        w.scheduler
            .drive(workflow.id, CancellationToken::new())
            .await
            .unwrap();

        assert!(w.executor.state.max_inflight.load(Ordering::SeqCst) <= 2);
        let done = Workflow::find_by_id(&w.pool, workflow.id).await.unwrap().unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn autonomous_retries_stop_at_the_configured_ceiling() {
        let mut config = ConductorConfig::default();
        config.max_step_attempts = 2;
        let w = world_with(generalist(), config).await;
        w.executor.fail_times("implement", 99);
        let (workflow, steps) = stage_executing(
            &w.pool,
            AutomationMode::Autonomous,
            4,
            &[step("implement", 0), step("follow-up", 1)],
        )
        .await;

        w.scheduler
            .drive(workflow.id, CancellationToken::new())
            .await
            .unwrap();

        let done = Workflow::find_by_id(&w.pool, workflow.id).await.unwrap().unwrap();
        assert_eq!(done.status, WorkflowStatus::Failed);
        assert!(done.error.as_deref().unwrap().contains("implement"));

        let failed = WorkflowStep::find_by_id(&w.pool, steps[0].id).await.unwrap().unwrap();
        assert_eq!(failed.status, StepStatus::Failed);
        assert_eq!(failed.attempts, 2);

        // The barrier held: the next wave never dispatched.
        assert!(!w.executor.events().iter().any(|e| e == "start:follow-up"));
    }

    #[tokio::test]
    async fn autonomous_retry_recovers_when_a_retry_succeeds() {
        let w = world().await;
        w.executor.fail_times("implement", 1);
        let (workflow, steps) = stage_executing(
            &w.pool,
            AutomationMode::Autonomous,
            4,
            &[step("implement", 0)],
        )
        .await;

        w.scheduler
            .drive(workflow.id, CancellationToken::new())
            .await
            .unwrap();

        let done = Workflow::find_by_id(&w.pool, workflow.id).await.unwrap().unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);

        let recovered = WorkflowStep::find_by_id(&w.pool, steps[0].id).await.unwrap().unwrap();
        assert_eq!(recovered.status, StepStatus::Completed);
        assert_eq!(recovered.attempts, 2);
        assert!(recovered.error.is_none());
    }

    #[tokio::test]
    async fn later_waves_receive_prior_outputs() {
        let w = world().await;
        let (workflow, _) = stage_executing(
            &w.pool,
            AutomationMode::Autonomous,
            4,
            &[step("implement", 0), step("verify", 1)],
        )
        .await;

        w.scheduler
            .drive(workflow.id, CancellationToken::new())
            .await
            .unwrap();

        let requests = w.executor.requests();
        let verify = requests.iter().find(|r| r.step_name == "verify").unwrap();
        assert_eq!(verify.prior_outputs, vec!["implement output #1".to_string()]);
    }

    #[tokio::test]
    async fn no_worker_is_a_terminal_step_failure_when_autonomous() {
        let w = world().await;
        let mut plan = step("deploy", 0);
        plan.capability = "deploying".to_string();
        let (workflow, steps) =
            stage_executing(&w.pool, AutomationMode::Autonomous, 4, &[plan]).await;

        w.scheduler
            .drive(workflow.id, CancellationToken::new())
            .await
            .unwrap();

        let done = Workflow::find_by_id(&w.pool, workflow.id).await.unwrap().unwrap();
        assert_eq!(done.status, WorkflowStatus::Failed);

        let failed = WorkflowStep::find_by_id(&w.pool, steps[0].id).await.unwrap().unwrap();
        assert_eq!(failed.status, StepStatus::Failed);
        assert!(failed.error.as_deref().unwrap().contains("no worker"));
        assert_eq!(failed.attempts, 0);
    }

    #[tokio::test]
    async fn assisted_completion_waits_for_approval() {
        let w = world().await;
        let (workflow, steps) =
            stage_executing(&w.pool, AutomationMode::Assisted, 4, &[step("implement", 0)]).await;

        let driver = {
            let scheduler = w.scheduler.clone();
            let id = workflow.id;
            tokio::spawn(async move { scheduler.drive(id, CancellationToken::new()).await })
        };

        wait_for_pause(&w.approvals, steps[0].id).await;
        let paused = Workflow::find_by_id(&w.pool, workflow.id).await.unwrap().unwrap();
        assert_eq!(paused.status, WorkflowStatus::Executing);
        assert!(paused.needs_attention);

        assert!(w.approvals.resolve(steps[0].id, StepDecision::Approve).await);
        driver.await.unwrap().unwrap();

        let done = Workflow::find_by_id(&w.pool, workflow.id).await.unwrap().unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert!(!done.needs_attention);

        let approved = WorkflowStep::find_by_id(&w.pool, steps[0].id).await.unwrap().unwrap();
        assert_eq!(approved.approval, Some(StepApproval::Approved));
    }

    #[tokio::test]
    async fn assisted_rejection_forces_rework_with_feedback() {
        let w = world().await;
        let (workflow, steps) =
            stage_executing(&w.pool, AutomationMode::Assisted, 4, &[step("implement", 0)]).await;

        let driver = {
            let scheduler = w.scheduler.clone();
            let id = workflow.id;
            tokio::spawn(async move { scheduler.drive(id, CancellationToken::new()).await })
        };

        wait_for_pause(&w.approvals, steps[0].id).await;
        assert!(
            w.approvals
                .resolve(
                    steps[0].id,
                    StepDecision::Reject {
                        feedback: Some("tighten the tests".to_string()),
                    },
                )
                .await
        );

        // The step re-runs and pauses again on its second completion.
        wait_for_pause(&w.approvals, steps[0].id).await;
        let reworked = WorkflowStep::find_by_id(&w.pool, steps[0].id).await.unwrap().unwrap();
        assert!(reworked.rework);
        assert_eq!(reworked.previous_output.as_deref(), Some("implement output #1"));
        assert_eq!(reworked.output.as_deref(), Some("implement output #2"));

        let requests = w.executor.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].feedback.as_deref(), Some("tighten the tests"));

        assert!(w.approvals.resolve(steps[0].id, StepDecision::Approve).await);
        driver.await.unwrap().unwrap();

        let done = Workflow::find_by_id(&w.pool, workflow.id).await.unwrap().unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn assisted_failure_pauses_until_skip_resolves_the_wave() {
        let w = world().await;
        w.executor.fail_times("implement", 99);
        let (workflow, steps) =
            stage_executing(&w.pool, AutomationMode::Assisted, 4, &[step("implement", 0)]).await;

        let driver = {
            let scheduler = w.scheduler.clone();
            let id = workflow.id;
            tokio::spawn(async move { scheduler.drive(id, CancellationToken::new()).await })
        };

        wait_for_pause(&w.approvals, steps[0].id).await;
        let paused = Workflow::find_by_id(&w.pool, workflow.id).await.unwrap().unwrap();
        assert_eq!(paused.status, WorkflowStatus::Executing);
        assert!(paused.needs_attention);

        let failed = WorkflowStep::find_by_id(&w.pool, steps[0].id).await.unwrap().unwrap();
        assert_eq!(failed.status, StepStatus::Failed);
        assert_eq!(failed.attempts, 1);

        assert!(
            w.approvals
                .resolve(
                    steps[0].id,
                    StepDecision::Skip {
                        reason: Some("known flake".to_string()),
                    },
                )
                .await
        );
        driver.await.unwrap().unwrap();

        let skipped = WorkflowStep::find_by_id(&w.pool, steps[0].id).await.unwrap().unwrap();
        assert_eq!(skipped.status, StepStatus::Skipped);
        assert_eq!(skipped.skip_reason.as_deref(), Some("known flake"));

        // Skipping resolved the wave without failing the workflow.
        let done = Workflow::find_by_id(&w.pool, workflow.id).await.unwrap().unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn retry_decision_redispatches_with_fresh_selection() {
        let w = world().await;
        w.executor.fail_times("implement", 1);
        let (workflow, steps) =
            stage_executing(&w.pool, AutomationMode::Assisted, 4, &[step("implement", 0)]).await;

        let driver = {
            let scheduler = w.scheduler.clone();
            let id = workflow.id;
            tokio::spawn(async move { scheduler.drive(id, CancellationToken::new()).await })
        };

        wait_for_pause(&w.approvals, steps[0].id).await;

        // Swap the registry while the step is parked; the retry must pick
        // up the replacement worker.
        let mut swapped = generalist();
        swapped.workers[0].id = "replacement".to_string();
        w.registry.replace(swapped).await;

        assert!(
            w.approvals
                .resolve(steps[0].id, StepDecision::Retry { input: None })
                .await
        );

        wait_for_pause(&w.approvals, steps[0].id).await;
        assert!(w.approvals.resolve(steps[0].id, StepDecision::Approve).await);
        driver.await.unwrap().unwrap();

        let done = WorkflowStep::find_by_id(&w.pool, steps[0].id).await.unwrap().unwrap();
        assert_eq!(done.worker_id.as_deref(), Some("replacement"));

        let requests = w.executor.requests();
        assert_eq!(requests[0].worker_id, "generalist");
        assert_eq!(requests[1].worker_id, "replacement");
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_parked_step() {
        let w = world().await;
        let (workflow, steps) =
            stage_executing(&w.pool, AutomationMode::Assisted, 4, &[step("implement", 0)]).await;

        let token = CancellationToken::new();
        let driver = {
            let scheduler = w.scheduler.clone();
            let id = workflow.id;
            let token = token.clone();
            tokio::spawn(async move { scheduler.drive(id, token).await })
        };

        wait_for_pause(&w.approvals, steps[0].id).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), driver)
            .await
            .expect("drive did not return after cancellation")
            .unwrap()
            .unwrap();

        assert!(!w.approvals.is_waiting(steps[0].id).await);
        // The status change belongs to the cancelling caller, not the
        // scheduler.
        let after = Workflow::find_by_id(&w.pool, workflow.id).await.unwrap().unwrap();
        assert_eq!(after.status, WorkflowStatus::Executing);
    }

    #[tokio::test]
    async fn manual_dispatch_runs_exactly_one_attempt() {
        let w = world().await;
        w.executor.fail_times("implement", 99);
        let (workflow, steps) =
            stage_executing(&w.pool, AutomationMode::Autonomous, 4, &[step("implement", 0)]).await;

        let dispatched = w.scheduler.dispatch_step(&workflow, steps[0].id).await.unwrap();
        assert_eq!(dispatched.status, StepStatus::Failed);
        assert_eq!(dispatched.attempts, 1);
        assert_eq!(w.executor.requests().len(), 1);
    }
}
