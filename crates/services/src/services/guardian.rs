//! Guardians: standing policy detectors that open workflows.
//!
//! A guardian is a JSON definition on disk combining three detector kinds:
//! regex rules swept over the repository tree, shell commands whose non-zero
//! exit reports violations, and HTTP sources returning violation lists. Each
//! violation becomes a workflow through the definition's template; every
//! sweep is recorded as a run row, including failed ones.
//!
//! Definitions are re-read from disk on every use, so editing a guardian
//! file takes effect on the next run without a restart.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use db::DBService;
use db::models::guardian_run::{
    CreateGuardianRun, GuardianRun, GuardianRunError, GuardianRunStatus,
};
use db::models::workflow::{AutomationMode, CreateWorkflow, Priority, WorkflowOrigin};
use ignore::WalkBuilder;
use ignore::overrides::OverrideBuilder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use utils::text::excerpt;

use crate::services::config::ConductorConfig;
use crate::services::workflow::WorkflowService;

#[derive(Debug, Error)]
pub enum GuardianError {
    #[error("failed to read guardian definition: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse guardian definition: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("guardian rule '{id}' has an invalid pattern: {source}")]
    Pattern { id: String, source: regex::Error },
    #[error("guardian rule '{id}' has an invalid glob: {source}")]
    Glob { id: String, source: ignore::Error },
    #[error("guardian command '{id}' could not run: {source}")]
    Command { id: String, source: std::io::Error },
    #[error("guardian source '{id}' failed: {source}")]
    Source { id: String, source: reqwest::Error },
    #[error(transparent)]
    Run(#[from] GuardianRunError),
    #[error("guardian '{0}' not found")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardianSeverity {
    Critical,
    Error,
    Warning,
    Info,
}

impl GuardianSeverity {
    pub fn default_priority(&self) -> Priority {
        match self {
            GuardianSeverity::Critical => Priority::Critical,
            GuardianSeverity::Error => Priority::High,
            GuardianSeverity::Warning => Priority::Medium,
            GuardianSeverity::Info => Priority::Low,
        }
    }
}

impl std::fmt::Display for GuardianSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardianSeverity::Critical => write!(f, "critical"),
            GuardianSeverity::Error => write!(f, "error"),
            GuardianSeverity::Warning => write!(f, "warning"),
            GuardianSeverity::Info => write!(f, "info"),
        }
    }
}

/// One guardian definition file, `{guardians_dir}/{name}.json`. The file
/// stem is the guardian's identity; a `name` field inside the file is
/// overwritten on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: i64,
    pub repo_path: String,
    #[serde(default)]
    pub rules: Vec<GuardianRule>,
    #[serde(default)]
    pub commands: Vec<GuardianCommand>,
    #[serde(default)]
    pub sources: Vec<GuardianSource>,
    pub workflow: WorkflowTemplate,
}

fn default_version() -> i64 {
    1
}

fn default_enabled() -> bool {
    true
}

fn default_interval_minutes() -> i64 {
    60
}

fn default_severity() -> GuardianSeverity {
    GuardianSeverity::Warning
}

/// Regex swept line by line over the repository tree, honoring ignore files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianRule {
    pub id: String,
    pub pattern: String,
    /// Optional glob restricting the files the rule sees.
    pub glob: Option<String>,
    #[serde(default = "default_severity")]
    pub severity: GuardianSeverity,
    pub summary: String,
}

/// Command run in the repository; a non-zero exit reports each non-empty
/// stdout line as a violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianCommand {
    pub id: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_severity")]
    pub severity: GuardianSeverity,
}

/// HTTP endpoint returning a JSON array of violations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianSource {
    pub id: String,
    pub url: String,
    pub severity: Option<GuardianSeverity>,
}

/// Template for the workflows a guardian opens. Title and description accept
/// `{{guardian}}`, `{{rule}}`, `{{summary}}`, `{{file}}`, `{{line}}`, and
/// `{{severity}}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
    pub title: String,
    pub description: Option<String>,
    pub capability: Option<String>,
    #[serde(default)]
    pub automation: AutomationMode,
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub rule: String,
    pub summary: String,
    pub file: Option<String>,
    pub line: Option<u64>,
    pub severity: GuardianSeverity,
}

/// Violation shape accepted from HTTP sources.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceViolation {
    rule: Option<String>,
    summary: String,
    file: Option<String>,
    line: Option<u64>,
    severity: Option<GuardianSeverity>,
}

#[derive(Clone)]
pub struct GuardianService {
    db: DBService,
    config: Arc<ConductorConfig>,
    workflows: WorkflowService,
}

impl GuardianService {
    pub fn new(db: DBService, config: Arc<ConductorConfig>, workflows: WorkflowService) -> Self {
        Self {
            db,
            config,
            workflows,
        }
    }

    /// All parseable definitions on disk, sorted by name. Invalid files are
    /// skipped with a warning, a missing directory is just empty.
    pub fn list_definitions(&self) -> Result<Vec<GuardianDefinition>, GuardianError> {
        let mut definitions = Vec::new();
        let entries = match std::fs::read_dir(&self.config.guardians_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(definitions),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match std::fs::read_to_string(&path)
                .map_err(GuardianError::from)
                .and_then(|raw| Ok(serde_json::from_str::<GuardianDefinition>(&raw)?))
            {
                Ok(mut definition) => {
                    definition.name = stem.to_string();
                    definitions.push(definition);
                }
                Err(e) => {
                    tracing::warn!(
                        "Skipping invalid guardian definition {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }

        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(definitions)
    }

    pub fn load_definition(&self, name: &str) -> Result<GuardianDefinition, GuardianError> {
        let path = self.config.guardians_dir.join(format!("{name}.json"));
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GuardianError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut definition: GuardianDefinition = serde_json::from_str(&raw)?;
        definition.name = name.to_string();
        Ok(definition)
    }

    /// Sweep one guardian now and persist the run.
    ///
    /// A sweep error is itself recorded as a failed run; only a missing or
    /// unparseable definition surfaces as an error to the caller. Workflow
    /// creation failures are logged and do not abort the remaining
    /// violations.
    pub async fn run_guardian(&self, name: &str) -> Result<GuardianRun, GuardianError> {
        let definition = self.load_definition(name)?;
        let started_at = Utc::now();
        tracing::info!("[Guardian] Running '{}' v{}", name, definition.version);

        let violations = match self.sweep(&definition).await {
            Ok(violations) => violations,
            Err(e) => {
                tracing::error!("[Guardian] Sweep of '{}' failed: {}", name, e);
                let run = GuardianRun::create(
                    &self.db.pool,
                    &CreateGuardianRun {
                        guardian: name.to_string(),
                        version: definition.version,
                        status: GuardianRunStatus::Failed,
                        violation_count: 0,
                        workflow_ids: vec![],
                        error: Some(e.to_string()),
                        started_at,
                    },
                )
                .await?;
                return Ok(run);
            }
        };

        if violations.is_empty() {
            let run = GuardianRun::create(
                &self.db.pool,
                &CreateGuardianRun {
                    guardian: name.to_string(),
                    version: definition.version,
                    status: GuardianRunStatus::Clean,
                    violation_count: 0,
                    workflow_ids: vec![],
                    error: None,
                    started_at,
                },
            )
            .await?;
            tracing::info!("[Guardian] '{}' is clean", name);
            return Ok(run);
        }

        let mut workflow_ids = Vec::new();
        for violation in &violations {
            let data = render_workflow(&definition, name, violation);
            match self.workflows.create(data).await {
                Ok(workflow) => workflow_ids.push(workflow.id),
                Err(e) => {
                    tracing::warn!(
                        "[Guardian] Could not open workflow for violation '{}': {}",
                        violation.rule,
                        e
                    );
                }
            }
        }

        let run = GuardianRun::create(
            &self.db.pool,
            &CreateGuardianRun {
                guardian: name.to_string(),
                version: definition.version,
                status: GuardianRunStatus::ViolationsFound,
                violation_count: violations.len() as i64,
                workflow_ids,
                error: None,
                started_at,
            },
        )
        .await?;
        tracing::info!(
            "[Guardian] '{}' found {} violations, opened {} workflows",
            name,
            violations.len(),
            run.workflow_ids_parsed().map(|ids| ids.len()).unwrap_or(0)
        );
        Ok(run)
    }

    pub async fn recent_runs(
        &self,
        guardian: Option<&str>,
    ) -> Result<Vec<GuardianRun>, GuardianError> {
        Ok(GuardianRun::find_recent(&self.db.pool, guardian, 50).await?)
    }

    /// Due when the guardian has never run or its interval has elapsed since
    /// the last run started.
    pub async fn is_due(&self, definition: &GuardianDefinition) -> Result<bool, GuardianError> {
        let Some(last) = GuardianRun::find_latest(&self.db.pool, &definition.name).await? else {
            return Ok(true);
        };
        let elapsed = Utc::now() - last.started_at;
        Ok(elapsed >= chrono::Duration::minutes(definition.interval_minutes))
    }

    /// Background poller running due guardians on their intervals.
    pub fn spawn_scheduler(&self) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        let poll = Duration::from_secs(service.config.guardian_poll_interval_secs.max(1));
        tokio::spawn(async move {
            tracing::info!(
                "[GuardianScheduler] Started - polling every {}s",
                poll.as_secs()
            );
            loop {
                if let Err(e) = service.sweep_due().await {
                    tracing::error!("[GuardianScheduler] Sweep pass failed: {}", e);
                }
                tokio::time::sleep(poll).await;
            }
        })
    }

    async fn sweep_due(&self) -> Result<(), GuardianError> {
        for definition in self.list_definitions()? {
            if !definition.enabled {
                continue;
            }
            match self.is_due(&definition).await {
                Ok(true) => {
                    tracing::info!("[GuardianScheduler] '{}' is due", definition.name);
                    if let Err(e) = self.run_guardian(&definition.name).await {
                        tracing::error!(
                            "[GuardianScheduler] Run of '{}' failed: {}",
                            definition.name,
                            e
                        );
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        "[GuardianScheduler] Could not check '{}': {}",
                        definition.name,
                        e
                    );
                }
            }
        }
        Ok(())
    }

    async fn sweep(
        &self,
        definition: &GuardianDefinition,
    ) -> Result<Vec<Violation>, GuardianError> {
        let mut violations = self.sweep_rules(definition)?;
        violations.extend(self.sweep_commands(definition).await?);
        violations.extend(self.sweep_sources(definition).await?);
        Ok(violations)
    }

    fn sweep_rules(
        &self,
        definition: &GuardianDefinition,
    ) -> Result<Vec<Violation>, GuardianError> {
        let mut violations = Vec::new();
        let repo_root = Path::new(&definition.repo_path);

        for rule in &definition.rules {
            let pattern = Regex::new(&rule.pattern).map_err(|source| GuardianError::Pattern {
                id: rule.id.clone(),
                source,
            })?;

            let mut walker = WalkBuilder::new(repo_root);
            if let Some(glob) = &rule.glob {
                let mut overrides = OverrideBuilder::new(repo_root);
                overrides.add(glob).map_err(|source| GuardianError::Glob {
                    id: rule.id.clone(),
                    source,
                })?;
                let overrides = overrides.build().map_err(|source| GuardianError::Glob {
                    id: rule.id.clone(),
                    source,
                })?;
                walker.overrides(overrides);
            }

            for entry in walker.build() {
                let Ok(entry) = entry else { continue };
                if !entry.file_type().is_some_and(|t| t.is_file()) {
                    continue;
                }
                // Binary or unreadable files are not the rule's business.
                let Ok(content) = std::fs::read_to_string(entry.path()) else {
                    continue;
                };
                for (index, line) in content.lines().enumerate() {
                    if pattern.is_match(line) {
                        let file = entry.path().strip_prefix(repo_root).unwrap_or(entry.path());
                        violations.push(Violation {
                            rule: rule.id.clone(),
                            summary: format!("{} ({})", rule.summary, excerpt(line.trim(), 80)),
                            file: Some(file.display().to_string()),
                            line: Some(index as u64 + 1),
                            severity: rule.severity,
                        });
                    }
                }
            }
        }

        Ok(violations)
    }

    async fn sweep_commands(
        &self,
        definition: &GuardianDefinition,
    ) -> Result<Vec<Violation>, GuardianError> {
        let mut violations = Vec::new();

        for command in &definition.commands {
            let output = Command::new(&command.program)
                .args(&command.args)
                .current_dir(&definition.repo_path)
                .output()
                .await
                .map_err(|source| GuardianError::Command {
                    id: command.id.clone(),
                    source,
                })?;

            if output.status.success() {
                continue;
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let lines: Vec<&str> = stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .collect();

            if lines.is_empty() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                violations.push(Violation {
                    rule: command.id.clone(),
                    summary: format!(
                        "{} exited with {}: {}",
                        command.program,
                        output.status,
                        excerpt(stderr.trim(), 120)
                    ),
                    file: None,
                    line: None,
                    severity: command.severity,
                });
            } else {
                for line in lines {
                    violations.push(Violation {
                        rule: command.id.clone(),
                        summary: line.to_string(),
                        file: None,
                        line: None,
                        severity: command.severity,
                    });
                }
            }
        }

        Ok(violations)
    }

    async fn sweep_sources(
        &self,
        definition: &GuardianDefinition,
    ) -> Result<Vec<Violation>, GuardianError> {
        let mut violations = Vec::new();

        for source in &definition.sources {
            let reported = reqwest::get(&source.url)
                .await
                .and_then(|response| response.error_for_status())
                .map_err(|e| GuardianError::Source {
                    id: source.id.clone(),
                    source: e,
                })?
                .json::<Vec<SourceViolation>>()
                .await
                .map_err(|e| GuardianError::Source {
                    id: source.id.clone(),
                    source: e,
                })?;

            violations.extend(
                reported
                    .into_iter()
                    .map(|violation| adopt_source_violation(source, violation)),
            );
        }

        Ok(violations)
    }
}

/// Severity falls back from the reported violation to the source default,
/// then to warning; an unnamed violation adopts the source's id as its rule.
fn adopt_source_violation(source: &GuardianSource, violation: SourceViolation) -> Violation {
    Violation {
        rule: violation.rule.unwrap_or_else(|| source.id.clone()),
        summary: violation.summary,
        file: violation.file,
        line: violation.line,
        severity: violation
            .severity
            .or(source.severity)
            .unwrap_or(GuardianSeverity::Warning),
    }
}

fn render_workflow(
    definition: &GuardianDefinition,
    name: &str,
    violation: &Violation,
) -> CreateWorkflow {
    let template = &definition.workflow;
    CreateWorkflow {
        title: render(&template.title, name, violation),
        description: template
            .description
            .as_deref()
            .map(|description| render(description, name, violation)),
        repo_path: definition.repo_path.clone(),
        base_branch: None,
        automation: template.automation,
        origin: WorkflowOrigin::Guardian,
        guardian_ref: Some(name.to_string()),
        priority: template
            .priority
            .unwrap_or_else(|| violation.severity.default_priority()),
        issue_link: None,
        capability_hint: template.capability.clone(),
        max_parallel: None,
    }
}

fn render(template: &str, guardian: &str, violation: &Violation) -> String {
    template
        .replace("{{guardian}}", guardian)
        .replace("{{rule}}", &violation.rule)
        .replace("{{summary}}", &violation.summary)
        .replace("{{file}}", violation.file.as_deref().unwrap_or(""))
        .replace(
            "{{line}}",
            &violation.line.map(|l| l.to_string()).unwrap_or_default(),
        )
        .replace("{{severity}}", &violation.severity.to_string())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;
    use db::models::test_utils::setup_test_pool;
    use db::models::workflow::{Workflow, WorkflowStatus};
    use sqlx::SqlitePool;
    use tempfile::TempDir;
    use uuid::Uuid;
    use workers::{
        ExecutorError, WorkerExecutor, WorkerProfile, WorkerRegistry, WorkerRequest, WorkerSet,
    };

    use super::*;
    use crate::services::approvals::Approvals;
    use crate::services::planner::StaticPlanner;
    use crate::services::sandbox::{SandboxError, SandboxInfo, SandboxProvider};
    use crate::services::scheduler::SchedulerService;

    struct InertSandboxes;

    #[async_trait]
    impl SandboxProvider for InertSandboxes {
        async fn create(
            &self,
            _repo_path: &Path,
            workflow_id: Uuid,
            _base_branch: Option<&str>,
        ) -> Result<SandboxInfo, SandboxError> {
            Ok(SandboxInfo {
                sandbox_path: PathBuf::from(format!("/sandboxes/wf-{workflow_id}")),
                branch_name: format!("conductor/wf-{workflow_id}"),
            })
        }

        async fn remove(&self, _workflow_id: Uuid, _force: bool) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn commit(&self, _workflow_id: Uuid, _message: &str) -> Result<String, SandboxError> {
            Ok("0000000000000000000000000000000000000000".to_string())
        }

        async fn push(&self, _workflow_id: Uuid) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    struct EchoExecutor;

    #[async_trait]
    impl WorkerExecutor for EchoExecutor {
        async fn execute(&self, request: WorkerRequest) -> Result<String, ExecutorError> {
            Ok(format!("{} done", request.step_name))
        }
    }

    struct World {
        pool: SqlitePool,
        service: GuardianService,
        repo: TempDir,
        _guardians: TempDir,
    }

    async fn world() -> World {
        let pool = setup_test_pool().await;
        let db = DBService::from_pool(pool.clone());
        let guardians = TempDir::new().unwrap();
        let config = Arc::new(ConductorConfig {
            guardians_dir: guardians.path().to_path_buf(),
            ..Default::default()
        });
        let approvals = Arc::new(Approvals::new());
        let registry = Arc::new(WorkerRegistry::from_set(WorkerSet {
            workers: vec![WorkerProfile {
                id: "generalist".to_string(),
                name: "Generalist".to_string(),
                capabilities: vec!["coding".to_string()],
                languages: vec![],
                priority: 10,
                enabled: true,
                command: None,
            }],
        }));
        let scheduler = SchedulerService::new(
            db.clone(),
            registry,
            Arc::new(EchoExecutor),
            approvals.clone(),
            config.clone(),
        );
        let workflows = WorkflowService::new(
            db.clone(),
            config.clone(),
            Arc::new(InertSandboxes),
            approvals,
            scheduler,
            Arc::new(StaticPlanner::new()),
        );
        World {
            pool,
            service: GuardianService::new(db, config, workflows),
            repo: TempDir::new().unwrap(),
            _guardians: guardians,
        }
    }

    fn write_definition(world: &World, name: &str, definition: &serde_json::Value) {
        let path = world
            .service
            .config
            .guardians_dir
            .join(format!("{name}.json"));
        std::fs::write(path, serde_json::to_vec_pretty(definition).unwrap()).unwrap();
    }

    fn repo_path(world: &World) -> String {
        world.repo.path().to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn rule_sweep_opens_a_workflow_per_violation() {
        let w = world().await;
        std::fs::create_dir_all(w.repo.path().join("src")).unwrap();
        std::fs::write(w.repo.path().join("src/a.rs"), "fn main() {}\n// TODO: fix\n").unwrap();
        std::fs::write(w.repo.path().join("notes.md"), "TODO: write docs\n").unwrap();

        write_definition(
            &w,
            "no-todo",
            &serde_json::json!({
                "repoPath": repo_path(&w),
                "rules": [{
                    "id": "todo-comment",
                    "pattern": "TODO",
                    "glob": "*.rs",
                    "severity": "warning",
                    "summary": "stray TODO"
                }],
                "workflow": {
                    "title": "Fix {{rule}} in {{file}}",
                    "description": "{{summary}} ({{severity}})",
                    "capability": "docs"
                }
            }),
        );

        let run = w.service.run_guardian("no-todo").await.unwrap();
        assert_eq!(run.status, GuardianRunStatus::ViolationsFound);
        assert_eq!(run.violation_count, 1);

        let ids = run.workflow_ids_parsed().unwrap();
        assert_eq!(ids.len(), 1);
        let workflow = Workflow::find_by_id(&w.pool, ids[0]).await.unwrap().unwrap();
        assert_eq!(workflow.title, "Fix todo-comment in src/a.rs");
        assert_eq!(workflow.origin, WorkflowOrigin::Guardian);
        assert_eq!(workflow.guardian_ref.as_deref(), Some("no-todo"));
        assert_eq!(workflow.capability_hint.as_deref(), Some("docs"));
        assert_eq!(workflow.priority, Priority::Medium);
        assert_eq!(workflow.status, WorkflowStatus::Created);
        assert!(workflow.description.as_deref().unwrap().contains("stray TODO"));
    }

    #[tokio::test]
    async fn clean_sweep_records_a_clean_run() {
        let w = world().await;
        std::fs::write(w.repo.path().join("lib.rs"), "fn tidy() {}\n").unwrap();

        write_definition(
            &w,
            "no-todo",
            &serde_json::json!({
                "repoPath": repo_path(&w),
                "rules": [{
                    "id": "todo-comment",
                    "pattern": "TODO",
                    "summary": "stray TODO"
                }],
                "workflow": { "title": "Fix {{rule}}" }
            }),
        );

        let run = w.service.run_guardian("no-todo").await.unwrap();
        assert_eq!(run.status, GuardianRunStatus::Clean);
        assert_eq!(run.violation_count, 0);
        assert_eq!(run.workflow_ids_parsed().unwrap(), Vec::<Uuid>::new());

        let latest = GuardianRun::find_latest(&w.pool, "no-todo").await.unwrap();
        assert_eq!(latest.unwrap().id, run.id);
    }

    #[tokio::test]
    async fn command_detector_reports_stdout_lines_on_failure() {
        let w = world().await;
        write_definition(
            &w,
            "lint-gate",
            &serde_json::json!({
                "repoPath": repo_path(&w),
                "commands": [
                    {
                        "id": "passing-check",
                        "program": "sh",
                        "args": ["-c", "exit 0"]
                    },
                    {
                        "id": "failing-check",
                        "program": "sh",
                        "args": ["-c", "echo offense one; echo offense two; exit 1"],
                        "severity": "error"
                    }
                ],
                "workflow": { "title": "{{summary}}" }
            }),
        );

        let run = w.service.run_guardian("lint-gate").await.unwrap();
        assert_eq!(run.status, GuardianRunStatus::ViolationsFound);
        assert_eq!(run.violation_count, 2);

        let ids = run.workflow_ids_parsed().unwrap();
        assert_eq!(ids.len(), 2);
        let first = Workflow::find_by_id(&w.pool, ids[0]).await.unwrap().unwrap();
        assert_eq!(first.title, "offense one");
        // Severity "error" maps to high priority when the template sets none.
        assert_eq!(first.priority, Priority::High);
    }

    #[tokio::test]
    async fn broken_pattern_records_a_failed_run() {
        let w = world().await;
        write_definition(
            &w,
            "broken",
            &serde_json::json!({
                "repoPath": repo_path(&w),
                "rules": [{
                    "id": "bad-regex",
                    "pattern": "([",
                    "summary": "never matches"
                }],
                "workflow": { "title": "unused" }
            }),
        );

        let run = w.service.run_guardian("broken").await.unwrap();
        assert_eq!(run.status, GuardianRunStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains("invalid pattern"));
        assert_eq!(run.violation_count, 0);
    }

    #[tokio::test]
    async fn workflow_creation_failures_do_not_abort_the_run() {
        let w = world().await;
        std::fs::write(w.repo.path().join("a.rs"), "// TODO: one\n").unwrap();

        // The command violation has no {{file}}, so its rendered title is
        // empty and rejected; the rule violation still goes through.
        write_definition(
            &w,
            "mixed",
            &serde_json::json!({
                "repoPath": repo_path(&w),
                "rules": [{
                    "id": "todo-comment",
                    "pattern": "TODO",
                    "summary": "stray TODO"
                }],
                "commands": [{
                    "id": "failing-check",
                    "program": "sh",
                    "args": ["-c", "echo nope; exit 1"]
                }],
                "workflow": { "title": "{{file}}" }
            }),
        );

        let run = w.service.run_guardian("mixed").await.unwrap();
        assert_eq!(run.status, GuardianRunStatus::ViolationsFound);
        assert_eq!(run.violation_count, 2);
        assert_eq!(run.workflow_ids_parsed().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_guardian_is_not_found() {
        let w = world().await;
        let err = w.service.run_guardian("ghost").await.unwrap_err();
        assert!(matches!(err, GuardianError::NotFound(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn list_definitions_skips_invalid_files_and_uses_the_stem() {
        let w = world().await;
        write_definition(
            &w,
            "alpha",
            &serde_json::json!({
                "name": "something-else",
                "repoPath": repo_path(&w),
                "workflow": { "title": "t" }
            }),
        );
        std::fs::write(
            w.service.config.guardians_dir.join("broken.json"),
            "{ not json",
        )
        .unwrap();
        std::fs::write(w.service.config.guardians_dir.join("readme.txt"), "hi").unwrap();

        let definitions = w.service.list_definitions().unwrap();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].name, "alpha");
        assert!(definitions[0].enabled);
        assert_eq!(definitions[0].interval_minutes, 60);
    }

    #[tokio::test]
    async fn is_due_honors_the_interval() {
        let w = world().await;
        write_definition(
            &w,
            "hourly",
            &serde_json::json!({
                "repoPath": repo_path(&w),
                "intervalMinutes": 60,
                "workflow": { "title": "t" }
            }),
        );
        let definition = w.service.load_definition("hourly").unwrap();

        // Never ran.
        assert!(w.service.is_due(&definition).await.unwrap());

        GuardianRun::create(
            &w.pool,
            &CreateGuardianRun {
                guardian: "hourly".to_string(),
                version: 1,
                status: GuardianRunStatus::Clean,
                violation_count: 0,
                workflow_ids: vec![],
                error: None,
                started_at: Utc::now(),
            },
        )
        .await
        .unwrap();
        assert!(!w.service.is_due(&definition).await.unwrap());

        // An old enough run makes it due again.
        GuardianRun::create(
            &w.pool,
            &CreateGuardianRun {
                guardian: "stale".to_string(),
                version: 1,
                status: GuardianRunStatus::Clean,
                violation_count: 0,
                workflow_ids: vec![],
                error: None,
                started_at: Utc::now() - chrono::Duration::minutes(90),
            },
        )
        .await
        .unwrap();
        let mut stale = definition.clone();
        stale.name = "stale".to_string();
        assert!(w.service.is_due(&stale).await.unwrap());
    }

    #[test]
    fn source_violations_fall_back_through_severity_defaults() {
        let source = GuardianSource {
            id: "advisories".to_string(),
            url: "http://localhost/unused".to_string(),
            severity: Some(GuardianSeverity::Error),
        };

        let explicit = adopt_source_violation(
            &source,
            SourceViolation {
                rule: Some("cve-2024-1".to_string()),
                summary: "bad dependency".to_string(),
                file: None,
                line: None,
                severity: Some(GuardianSeverity::Critical),
            },
        );
        assert_eq!(explicit.severity, GuardianSeverity::Critical);
        assert_eq!(explicit.rule, "cve-2024-1");

        let inherited = adopt_source_violation(
            &source,
            SourceViolation {
                rule: None,
                summary: "bad dependency".to_string(),
                file: None,
                line: None,
                severity: None,
            },
        );
        assert_eq!(inherited.severity, GuardianSeverity::Error);
        assert_eq!(inherited.rule, "advisories");

        let bare = GuardianSource {
            id: "advisories".to_string(),
            url: "http://localhost/unused".to_string(),
            severity: None,
        };
        let defaulted = adopt_source_violation(
            &bare,
            SourceViolation {
                rule: None,
                summary: "bad dependency".to_string(),
                file: None,
                line: None,
                severity: None,
            },
        );
        assert_eq!(defaulted.severity, GuardianSeverity::Warning);
    }
}
