//! Worker invocation boundary.
//!
//! The engine hands a [`WorkerRequest`] to a [`WorkerExecutor`] and gets back
//! an opaque output payload or an error. What a worker actually does with the
//! request is its own business; the engine never interprets payloads.

use std::{collections::HashMap, process::Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::profile::WorkerCommand;

/// Everything a worker needs for one step dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub workflow_id: Uuid,
    pub step_id: Uuid,
    pub worker_id: String,
    pub capability: String,
    pub language: Option<String>,
    pub step_name: String,
    pub description: Option<String>,
    /// Opaque input payload from the plan (or an edited retry).
    pub input: Option<String>,
    /// Reviewer feedback when re-running a rejected step.
    pub feedback: Option<String>,
    /// Outputs of already-resolved steps from earlier waves.
    pub prior_outputs: Vec<String>,
    /// Working copy the worker must operate in while the workflow executes.
    pub sandbox_path: Option<String>,
    pub attempt: i64,
    /// Invocation settings copied from the selected profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<WorkerCommand>,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("worker '{0}' has no command configured")]
    NotConfigured(String),
    #[error("worker i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize worker request: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("worker exited with status {status}: {stderr}")]
    Failed { status: i32, stderr: String },
}

#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn execute(&self, request: WorkerRequest) -> Result<String, ExecutorError>;
}

/// Executor that runs the profile's configured command as a local process,
/// feeding the request as JSON on stdin and reading the output from stdout.
#[derive(Debug, Default, Clone)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WorkerExecutor for CommandExecutor {
    async fn execute(&self, request: WorkerRequest) -> Result<String, ExecutorError> {
        let command = request
            .command
            .clone()
            .ok_or_else(|| ExecutorError::NotConfigured(request.worker_id.clone()))?;
        let payload = serde_json::to_string(&request)?;

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.clone(), v.clone())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.sandbox_path {
            cmd.current_dir(dir);
        }

        tracing::debug!(
            "Invoking worker '{}' ({}) for step {}",
            request.worker_id,
            command.program,
            request.step_id
        );

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(ExecutorError::Failed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: Option<WorkerCommand>) -> WorkerRequest {
        WorkerRequest {
            workflow_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            worker_id: "test-worker".to_string(),
            capability: "coding".to_string(),
            language: None,
            step_name: "apply-change".to_string(),
            description: None,
            input: Some("do the thing".to_string()),
            feedback: None,
            prior_outputs: vec![],
            sandbox_path: None,
            attempt: 1,
            command,
        }
    }

    #[tokio::test]
    async fn command_executor_pipes_request_through_stdin() {
        let executor = CommandExecutor::new();
        let command = WorkerCommand {
            program: "cat".to_string(),
            args: vec![],
            env: HashMap::new(),
        };
        let req = request(Some(command));
        let step_id = req.step_id;

        let output = executor.execute(req).await.unwrap();
        let echoed: WorkerRequest = serde_json::from_str(&output).unwrap();
        assert_eq!(echoed.step_id, step_id);
        assert_eq!(echoed.input.as_deref(), Some("do the thing"));
    }

    #[tokio::test]
    async fn command_executor_surfaces_nonzero_exit() {
        let executor = CommandExecutor::new();
        let command = WorkerCommand {
            program: "false".to_string(),
            args: vec![],
            env: HashMap::new(),
        };

        let err = executor.execute(request(Some(command))).await.unwrap_err();
        match err {
            ExecutorError::Failed { status, .. } => assert_eq!(status, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_command_is_reported() {
        let executor = CommandExecutor::new();
        let err = executor.execute(request(None)).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotConfigured(_)));
    }
}
