pub mod guardian_run;
pub mod test_utils;
pub mod workflow;
pub mod workflow_step;
