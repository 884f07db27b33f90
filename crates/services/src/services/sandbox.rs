//! Per-workflow sandbox management.
//!
//! Each workflow gets exactly one isolated working copy and one branch,
//! derived deterministically from the workflow id, so requesting the same
//! sandbox twice hands back the existing one. The canonical repository tree
//! is never written to; steps only ever touch the sandbox.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::{BranchType, Repository};
use thiserror::Error;
use utils::text::short_uuid;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Git(#[from] git2::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("sandbox for workflow {0} has not been provisioned")]
    NotProvisioned(Uuid),
    #[error("sandbox has uncommitted changes; discard with force to drop them")]
    DirtyWorktree,
}

#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub sandbox_path: PathBuf,
    pub branch_name: String,
}

/// Substitute one tree root for another. Paths outside `from_root` are
/// returned unchanged.
pub fn translate_path(path: &Path, from_root: &Path, to_root: &Path) -> PathBuf {
    match path.strip_prefix(from_root) {
        Ok(rel) => to_root.join(rel),
        Err(_) => path.to_path_buf(),
    }
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Create (or return) the sandbox for a workflow. Idempotent per id.
    async fn create(
        &self,
        repo_path: &Path,
        workflow_id: Uuid,
        base_branch: Option<&str>,
    ) -> Result<SandboxInfo, SandboxError>;

    /// Remove the working copy and branch. Removing an absent sandbox is a
    /// no-op; a dirty working copy is refused unless `force` is set.
    async fn remove(&self, workflow_id: Uuid, force: bool) -> Result<(), SandboxError>;

    /// Stage everything and commit on the sandbox branch.
    async fn commit(&self, workflow_id: Uuid, message: &str) -> Result<String, SandboxError>;

    /// Push the sandbox branch to `origin`.
    async fn push(&self, workflow_id: Uuid) -> Result<(), SandboxError>;
}

/// Git-worktree backed sandboxes under a single root directory.
pub struct WorktreeSandboxes {
    root: PathBuf,
}

impl WorktreeSandboxes {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn slug(workflow_id: Uuid) -> String {
        format!("wf-{}", short_uuid(&workflow_id))
    }

    pub fn sandbox_path_for(&self, workflow_id: Uuid) -> PathBuf {
        self.root.join(Self::slug(workflow_id))
    }

    pub fn branch_name_for(workflow_id: Uuid) -> String {
        format!("conductor/{}", Self::slug(workflow_id))
    }

    fn create_inner(
        &self,
        repo_path: &Path,
        workflow_id: Uuid,
        base_branch: Option<&str>,
    ) -> Result<SandboxInfo, SandboxError> {
        let slug = Self::slug(workflow_id);
        let sandbox_path = self.root.join(&slug);
        let branch_name = Self::branch_name_for(workflow_id);

        if sandbox_path.exists() {
            return Ok(SandboxInfo {
                sandbox_path,
                branch_name,
            });
        }
        std::fs::create_dir_all(&self.root)?;

        let repo = Repository::open(repo_path)?;

        // A manually deleted sandbox can leave stale worktree metadata in
        // the canonical repository.
        if let Ok(stale) = repo.find_worktree(&slug) {
            let mut prune = git2::WorktreePruneOptions::new();
            prune.valid(true).locked(true).working_tree(true);
            stale.prune(Some(&mut prune))?;
        }

        let base_commit = match base_branch {
            Some(name) => repo
                .find_branch(name, BranchType::Local)?
                .get()
                .peel_to_commit()?,
            None => repo.head()?.peel_to_commit()?,
        };

        let branch = match repo.find_branch(&branch_name, BranchType::Local) {
            Ok(branch) => branch,
            Err(_) => repo.branch(&branch_name, &base_commit, false)?,
        };
        let reference = branch.into_reference();

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(&slug, &sandbox_path, Some(&opts))?;

        tracing::info!(
            "Provisioned sandbox {} on branch {} for workflow {}",
            sandbox_path.display(),
            branch_name,
            workflow_id
        );

        Ok(SandboxInfo {
            sandbox_path,
            branch_name,
        })
    }

    fn remove_inner(&self, workflow_id: Uuid, force: bool) -> Result<(), SandboxError> {
        let sandbox_path = self.sandbox_path_for(workflow_id);
        if !sandbox_path.exists() {
            return Ok(());
        }

        let repo = Repository::open(&sandbox_path)?;
        if !force && !Self::is_clean(&repo)? {
            return Err(SandboxError::DirtyWorktree);
        }

        // repo.path() for a linked worktree is <main>/.git/worktrees/<slug>.
        let main_git_dir = repo
            .path()
            .parent()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf);

        let worktree = git2::Worktree::open_from_repository(&repo)?;
        drop(repo);
        let mut prune = git2::WorktreePruneOptions::new();
        prune.valid(true).locked(true).working_tree(true);
        worktree.prune(Some(&mut prune))?;

        if sandbox_path.exists() {
            std::fs::remove_dir_all(&sandbox_path)?;
        }

        if let Some(git_dir) = main_git_dir {
            let main = Repository::open(git_dir)?;
            let branch_name = Self::branch_name_for(workflow_id);
            if let Ok(mut branch) = main.find_branch(&branch_name, BranchType::Local) {
                branch.delete()?;
            }
        }

        tracing::info!("Removed sandbox for workflow {}", workflow_id);
        Ok(())
    }

    fn is_clean(repo: &Repository) -> Result<bool, git2::Error> {
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(statuses.is_empty())
    }

    fn commit_inner(&self, workflow_id: Uuid, message: &str) -> Result<String, SandboxError> {
        let sandbox_path = self.sandbox_path_for(workflow_id);
        if !sandbox_path.exists() {
            return Err(SandboxError::NotProvisioned(workflow_id));
        }

        let repo = Repository::open(&sandbox_path)?;
        let mut index = repo.index()?;
        index.add_all(["*"], git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        let signature = repo
            .signature()
            .or_else(|_| git2::Signature::now("conductor", "conductor@localhost"))?;
        let parent = repo.head()?.peel_to_commit()?;
        let commit_id = repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &[&parent],
        )?;

        Ok(commit_id.to_string())
    }

    fn push_inner(&self, workflow_id: Uuid) -> Result<(), SandboxError> {
        let sandbox_path = self.sandbox_path_for(workflow_id);
        if !sandbox_path.exists() {
            return Err(SandboxError::NotProvisioned(workflow_id));
        }

        let repo = Repository::open(&sandbox_path)?;
        let mut remote = repo.find_remote("origin")?;
        let branch_name = Self::branch_name_for(workflow_id);
        let refspec = format!("refs/heads/{branch_name}:refs/heads/{branch_name}");
        remote.push(&[refspec.as_str()], None)?;
        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for WorktreeSandboxes {
    async fn create(
        &self,
        repo_path: &Path,
        workflow_id: Uuid,
        base_branch: Option<&str>,
    ) -> Result<SandboxInfo, SandboxError> {
        self.create_inner(repo_path, workflow_id, base_branch)
    }

    async fn remove(&self, workflow_id: Uuid, force: bool) -> Result<(), SandboxError> {
        self.remove_inner(workflow_id, force)
    }

    async fn commit(&self, workflow_id: Uuid, message: &str) -> Result<String, SandboxError> {
        self.commit_inner(workflow_id, message)
    }

    async fn push(&self, workflow_id: Uuid) -> Result<(), SandboxError> {
        self.push_inner(workflow_id)
    }
}
