//! Planning boundary.
//!
//! The engine consumes a [`Planner`]; it never generates plans itself.
//! [`StaticPlanner`] is the built-in deterministic implementation used when
//! no external planner is wired in: one implementation wave, then a test
//! wave, then a review wave.

use async_trait::async_trait;
use chrono::Utc;
use db::models::workflow::Workflow;
use db::models::workflow_step::CreateWorkflowStep;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("planner failed: {0}")]
    Failed(String),
}

/// What a planner hands back: an opaque summary blob for the workflow row
/// plus the ordered, wave-tagged steps.
#[derive(Debug, Clone)]
pub struct PlanDraft {
    pub summary: String,
    pub steps: Vec<CreateWorkflowStep>,
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// Produce the analysis context stored on the workflow.
    async fn analyze(&self, workflow: &Workflow) -> Result<String, PlannerError>;

    /// Produce the step plan. The engine validates structure (non-decreasing
    /// waves), not semantics.
    async fn plan(&self, workflow: &Workflow) -> Result<PlanDraft, PlannerError>;
}

#[derive(Debug, Default, Clone)]
pub struct StaticPlanner;

impl StaticPlanner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn analyze(&self, workflow: &Workflow) -> Result<String, PlannerError> {
        Ok(json!({
            "repository": workflow.repo_path,
            "goal": workflow.title,
            "details": workflow.description,
            "analyzedAt": Utc::now(),
        })
        .to_string())
    }

    async fn plan(&self, workflow: &Workflow) -> Result<PlanDraft, PlannerError> {
        let capability = workflow
            .capability_hint
            .clone()
            .unwrap_or_else(|| "coding".to_string());
        let goal = workflow
            .description
            .clone()
            .unwrap_or_else(|| workflow.title.clone());

        let steps = vec![
            CreateWorkflowStep {
                name: "implement".to_string(),
                description: Some(format!("Apply the change: {}", workflow.title)),
                capability,
                language: None,
                wave: 0,
                input: Some(goal),
            },
            CreateWorkflowStep {
                name: "verify-tests".to_string(),
                description: Some("Run the test suite against the change".to_string()),
                capability: "testing".to_string(),
                language: None,
                wave: 1,
                input: None,
            },
            CreateWorkflowStep {
                name: "review".to_string(),
                description: Some("Review the applied change".to_string()),
                capability: "review".to_string(),
                language: None,
                wave: 2,
                input: None,
            },
        ];

        let summary = json!({
            "planner": "static",
            "steps": steps.iter().map(|s| &s.name).collect::<Vec<_>>(),
            "plannedAt": Utc::now(),
        })
        .to_string();

        Ok(PlanDraft { summary, steps })
    }
}
