pub mod approvals;
pub mod config;
pub mod guardian;
pub mod planner;
pub mod sandbox;
pub mod scheduler;
pub mod workflow;

pub use approvals::{Approvals, StepDecision};
pub use config::ConductorConfig;
pub use guardian::{GuardianDefinition, GuardianError, GuardianService, Violation};
pub use planner::{PlanDraft, Planner, PlannerError, StaticPlanner};
pub use sandbox::{SandboxError, SandboxInfo, SandboxProvider, WorktreeSandboxes};
pub use scheduler::{SchedulerError, SchedulerService};
pub use workflow::{ProgressSnapshot, WorkflowService, WorkflowServiceError, WorkflowWithSteps};
