//! Per-task git worktree lifecycle.
//!
//! Coding subtasks are isolated in a worktree on their own branch. A
//! worktree created by drover lives under `<repo>/.orchestrator/worktrees/`
//! and is **managed**: it is reclaimed when the task fails with no retry
//! left. A caller-supplied worktree path is adopted (or force-created) but
//! stays **unmanaged** -- cleanup never touches it.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::warn;

use drover_db::now_ts;
use drover_db::queries::tasks;

/// Branch namespace for task worktrees.
const BRANCH_PREFIX: &str = "orchestrator";

/// Repo-relative directory that holds managed worktrees.
const MANAGED_SUBDIR: &str = ".orchestrator/worktrees";

/// Errors from git worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// A git command failed to spawn.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// A task's worktree binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    /// True when drover created the worktree and may reclaim it.
    pub managed: bool,
}

/// Ensure a worktree exists for a task, persisting the binding on its row.
///
/// Returns `None` (and writes nothing) when the task has no usable
/// repository: an empty `repo_path`, or a path that is not a git working
/// tree. With a caller-configured `worktree_path` the tree is adopted if it
/// already exists, force-created otherwise, and recorded as unmanaged
/// either way. Without a configured path, a managed worktree is created
/// under the repo's `.orchestrator/worktrees/` area.
///
/// Idempotent: an existing worktree at the expected path is reused.
pub async fn ensure_task_worktree(
    pool: &SqlitePool,
    task_id: &str,
    repo_path: Option<&str>,
    worktree_path: Option<&str>,
) -> Result<Option<WorktreeInfo>> {
    let repo = repo_path.unwrap_or("").trim();
    if repo.is_empty() {
        return Ok(None);
    }

    let repo_dir = Path::new(repo);
    if !is_git_repo(repo_dir) {
        return Ok(None);
    }

    let branch = branch_name(task_id);

    let configured = worktree_path.unwrap_or("").trim();
    let (wt, managed) = if configured.is_empty() {
        (repo_dir.join(MANAGED_SUBDIR).join(sanitize_path(task_id)), true)
    } else {
        (PathBuf::from(configured), false)
    };

    if !is_git_repo(&wt) {
        if let Some(parent) = wt.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create worktree parent {}", parent.display())
            })?;
        }
        let wt_str = wt.to_string_lossy();
        git(repo_dir, &["worktree", "add", wt_str.as_ref(), "-B", branch.as_str()])
            .with_context(|| format!("failed to add worktree for task {task_id}"))?;
    }

    let branch = current_branch(&wt);
    tasks::set_worktree(
        pool,
        task_id,
        &wt.to_string_lossy(),
        managed,
        branch.as_deref(),
        now_ts(),
    )
    .await?;

    Ok(Some(WorktreeInfo {
        path: wt,
        branch,
        managed,
    }))
}

/// Reclaim a task's worktree after a terminal failure.
///
/// Acts only when the row marks the worktree managed and both paths are
/// set, and only when the worktree resolves under the repo's
/// `.orchestrator/worktrees/` area -- a symlinked or relocated path is left
/// alone. Tries a git-level removal first; if git refuses (stale metadata),
/// falls back to deleting the directory. The row's worktree fields are
/// cleared afterward.
pub async fn cleanup_task_worktree(pool: &SqlitePool, task_id: &str) -> Result<()> {
    let Some(task) = tasks::get_task(pool, task_id).await? else {
        return Ok(());
    };

    let wt = task.worktree_path.as_deref().unwrap_or("").trim();
    let repo = task.repo_path.as_deref().unwrap_or("").trim();
    if !task.worktree_managed || wt.is_empty() || repo.is_empty() {
        return Ok(());
    }

    let wt_path = Path::new(wt);
    if !wt_path.exists() {
        tasks::clear_worktree(pool, task_id, now_ts()).await?;
        return Ok(());
    }

    let safe_root = Path::new(repo).join(MANAGED_SUBDIR);
    if !is_within(wt_path, &safe_root) {
        warn!(
            task_id,
            worktree = %wt_path.display(),
            "worktree path escapes the managed area, refusing to remove"
        );
        return Ok(());
    }

    if let Err(e) = git(
        Path::new(repo),
        &["worktree", "remove", "--force", wt],
    ) {
        // Stale worktree metadata; remove the directory directly.
        warn!(task_id, error = %e, "git worktree remove failed, deleting directory");
        let _ = std::fs::remove_dir_all(wt_path);
    }

    tasks::clear_worktree(pool, task_id, now_ts()).await?;
    Ok(())
}

/// Branch name for a task: `orchestrator/<sanitized id>`.
pub fn branch_name(task_id: &str) -> String {
    format!("{BRANCH_PREFIX}/{}", sanitize_branch(task_id))
}

static BRANCH_UNSAFE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._/-]+").expect("branch pattern must compile"));

static PATH_UNSAFE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("path pattern must compile"));

/// Replace branch-unsafe characters with `-`, trimming stray separators.
pub fn sanitize_branch(task_id: &str) -> String {
    let cleaned = BRANCH_UNSAFE.replace_all(task_id, "-");
    let trimmed = cleaned.trim_matches(|c| c == '-' || c == '/');
    if trimmed.is_empty() {
        "task".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Replace path-unsafe characters with `-`, trimming stray separators.
pub fn sanitize_path(task_id: &str) -> String {
    let cleaned = PATH_UNSAFE.replace_all(task_id, "-");
    let trimmed = cleaned.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        "task".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Current branch of a working tree, `None` when unreadable or detached
/// with no name.
pub fn current_branch(path: &Path) -> Option<String> {
    let out = git(path, &["rev-parse", "--abbrev-ref", "HEAD"]).ok()?;
    let branch = out.trim();
    if branch.is_empty() {
        None
    } else {
        Some(branch.to_owned())
    }
}

/// Whether a path is inside a git working tree.
pub fn is_git_repo(path: &Path) -> bool {
    path.is_dir() && git(path, &["rev-parse", "--is-inside-work-tree"]).is_ok()
}

/// Whether `path` resolves under `root` (both canonicalized).
fn is_within(path: &Path, root: &Path) -> bool {
    let (Ok(path), Ok(root)) = (path.canonicalize(), root.canonicalize()) else {
        return false;
    };
    path.starts_with(&root)
}

/// Run a git command, returning stdout on success.
pub(crate) fn git(cwd: &Path, args: &[&str]) -> Result<String, WorktreeError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|e| WorktreeError::GitCommand {
            message: format!("failed to run git {}", args.join(" ")),
            source: e,
        })?;

    if !output.status.success() {
        return Err(WorktreeError::GitExit {
            command: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
