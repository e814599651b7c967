//! Git worktree lifecycle for subtask isolation.
//!
//! Worktrees live at `<repo-parent>/axiom-<id>` on branches named
//! `axiom/<id>/<epoch-ms>`. Operations on the main repository are serialised
//! through one lock so `checkout`/`merge` never interleave and fight over
//! `index.lock`; worktree-local git calls need no such care.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git command failed: {0}")]
    GitCommand(String),
    #[error("worktree already exists: {0}")]
    AlreadyExists(String),
    #[error("worktree not found for task: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Abstraction over git CLI operations so they can be mocked in tests.
/// Git always runs as a child process, never in-process.
pub trait GitRunner: Send + Sync {
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

/// Real git runner that shells out to the `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// WorktreeInfo / results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub committed: bool,
    pub merged: bool,
    pub created_at: chrono::DateTime<Utc>,
}

/// Outcome of one merge attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeOutcome {
    Merged,
    /// Conflicting files; the merge was aborted, nothing was auto-resolved.
    /// A conflict here means the orthogonality assumption was violated.
    Conflict(Vec<String>),
    NothingToMerge,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub total: usize,
    pub merged: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

pub struct WorktreeManager {
    repo_root: PathBuf,
    base_branch: String,
    git: Box<dyn GitRunner>,
    /// Serialises every git operation that touches the main repository.
    main_repo_lock: Mutex<()>,
    registered: Mutex<HashMap<String, WorktreeInfo>>,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>, base_branch: impl Into<String>) -> Self {
        Self::with_git_runner(repo_root, base_branch, Box::new(RealGitRunner))
    }

    pub fn with_git_runner(
        repo_root: impl Into<PathBuf>,
        base_branch: impl Into<String>,
        git: Box<dyn GitRunner>,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            base_branch: base_branch.into(),
            git,
            main_repo_lock: Mutex::new(()),
            registered: Mutex::new(HashMap::new()),
        }
    }

    fn worktree_path(&self, task_id: &str) -> PathBuf {
        let parent = self
            .repo_root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.repo_root.clone());
        parent.join(format!("axiom-{task_id}"))
    }

    /// Create an isolated worktree for a subtask on its own branch.
    pub fn create(&self, task_id: &str) -> Result<WorktreeInfo> {
        let path = self.worktree_path(task_id);
        if path.exists() {
            return Err(WorktreeError::AlreadyExists(path.display().to_string()));
        }
        let branch = format!("axiom/{task_id}/{}", Utc::now().timestamp_millis());

        info!(task_id, path = %path.display(), branch = %branch, "creating worktree");

        let _guard = self.main_repo_lock.lock().unwrap_or_else(|e| e.into_inner());
        let path_str = path.display().to_string();
        let result = self.git.run_git(
            &self.repo_root,
            &["worktree", "add", "-b", &branch, &path_str, &self.base_branch],
        );

        match result {
            Ok(output) if output.success => {
                let info = WorktreeInfo {
                    task_id: task_id.to_string(),
                    path,
                    branch,
                    base_branch: self.base_branch.clone(),
                    committed: false,
                    merged: false,
                    created_at: Utc::now(),
                };
                self.registered
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(task_id.to_string(), info.clone());
                Ok(info)
            }
            Ok(output) => Err(WorktreeError::GitCommand(output.stderr)),
            Err(e) => Err(WorktreeError::GitCommand(e)),
        }
    }

    /// Stage and commit everything the subtask produced. Returns `true` when
    /// a commit was created, `false` when the tree was clean.
    pub fn commit(&self, task_id: &str, files: &[String]) -> Result<bool> {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        let info = registered
            .get_mut(task_id)
            .ok_or_else(|| WorktreeError::NotFound(task_id.to_string()))?;

        // Worktree-local operations; no main-repo lock needed.
        run_ok(&*self.git, &info.path, &["add", "."])?;
        let status = run_ok(&*self.git, &info.path, &["status", "--porcelain"])?;
        if status.stdout.trim().is_empty() {
            return Ok(false);
        }

        let message = format!("Task {}: Created {}", task_id, files.join(", "));
        run_ok(&*self.git, &info.path, &["commit", "-m", &message])?;
        info.committed = true;
        info!(task_id, "worktree committed");
        Ok(true)
    }

    /// Merge a committed worktree branch into the base branch.
    ///
    /// Conflicts abort the merge and are surfaced; they are never resolved
    /// silently.
    pub fn merge(&self, task_id: &str) -> Result<MergeOutcome> {
        let info = {
            let registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
            registered
                .get(task_id)
                .cloned()
                .ok_or_else(|| WorktreeError::NotFound(task_id.to_string()))?
        };
        if !info.committed {
            return Ok(MergeOutcome::NothingToMerge);
        }

        let _guard = self.main_repo_lock.lock().unwrap_or_else(|e| e.into_inner());

        run_ok(&*self.git, &self.repo_root, &["checkout", &info.base_branch])?;
        let merge = self
            .git
            .run_git(&self.repo_root, &["merge", &info.branch])
            .map_err(WorktreeError::GitCommand)?;

        if merge.success {
            let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = registered.get_mut(task_id) {
                entry.merged = true;
            }
            info!(task_id, branch = %info.branch, "merge successful");
            return Ok(MergeOutcome::Merged);
        }

        // Collect the conflicting paths, then abort.
        let conflicts = self
            .git
            .run_git(
                &self.repo_root,
                &["diff", "--name-only", "--diff-filter=U"],
            )
            .map(|o| {
                o.stdout
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if let Err(e) = self.git.run_git(&self.repo_root, &["merge", "--abort"]) {
            warn!(task_id, error = %e, "merge --abort failed");
        }

        warn!(task_id, conflicts = ?conflicts, "merge conflict: orthogonality violated");
        Ok(MergeOutcome::Conflict(conflicts))
    }

    /// Remove a worktree, forcing if uncommitted changes remain. Merged
    /// branches are deleted; unmerged ones are kept for inspection.
    pub fn remove(&self, task_id: &str) -> Result<()> {
        let info = {
            let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
            registered
                .remove(task_id)
                .ok_or_else(|| WorktreeError::NotFound(task_id.to_string()))?
        };

        let _guard = self.main_repo_lock.lock().unwrap_or_else(|e| e.into_inner());
        let path_str = info.path.display().to_string();
        let removed = self
            .git
            .run_git(&self.repo_root, &["worktree", "remove", &path_str])
            .map(|o| o.success)
            .unwrap_or(false);
        if !removed {
            run_ok(
                &*self.git,
                &self.repo_root,
                &["worktree", "remove", "--force", &path_str],
            )?;
        }

        if info.merged {
            if let Err(e) = self
                .git
                .run_git(&self.repo_root, &["branch", "-d", &info.branch])
            {
                warn!(task_id = %info.task_id, error = %e, "branch delete failed");
            }
        }
        info!(task_id = %info.task_id, "worktree removed");
        Ok(())
    }

    /// Merge every committed-but-unmerged worktree. A second call in a row
    /// finds nothing left and reports `merged: 0`.
    pub fn merge_all(&self) -> MergeSummary {
        let pending: Vec<String> = {
            let registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
            registered
                .values()
                .filter(|i| i.committed && !i.merged)
                .map(|i| i.task_id.clone())
                .collect()
        };

        let mut summary = MergeSummary {
            total: pending.len(),
            ..MergeSummary::default()
        };
        for task_id in pending {
            match self.merge(&task_id) {
                Ok(MergeOutcome::Merged) => summary.merged += 1,
                Ok(MergeOutcome::NothingToMerge) => {}
                Ok(MergeOutcome::Conflict(_)) | Err(_) => summary.failed += 1,
            }
        }
        summary
    }

    pub fn registered(&self) -> Vec<WorktreeInfo> {
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, task_id: &str) -> Option<WorktreeInfo> {
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned()
    }
}

fn run_ok(git: &dyn GitRunner, dir: &Path, args: &[&str]) -> Result<GitOutput> {
    let output = git.run_git(dir, args).map_err(WorktreeError::GitCommand)?;
    if !output.success {
        return Err(WorktreeError::GitCommand(output.stderr));
    }
    Ok(output)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
