//! Routing dispatch: execute the agent a task's routing tag selects.
//!
//! This is the concrete runner behind the worker's opaque command template
//! (`drover run --db {db_path} --task-id {task_id}`). Routing families:
//! coding routes go to `codex` inside the task's worktree; reviewer,
//! designer, and triage routes go to `openclaw` agents. The exit code is
//! the contract with the worker: 0 success, 64 unsupported routing, 65
//! missing workdir, 66 unknown task, 75 sandbox-blocked-but-exit-zero,
//! 127 missing binary.

use std::path::PathBuf;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use drover_core::worktree::{self, sanitize_path};
use drover_db::queries::tasks;

pub const EXIT_UNSUPPORTED_ROUTING: i32 = 64;
pub const EXIT_MISSING_WORKDIR: i32 = 65;
pub const EXIT_TASK_NOT_FOUND: i32 = 66;
pub const EXIT_SANDBOX_BLOCKED: i32 = 75;
pub const EXIT_BINARY_MISSING: i32 = 127;

/// Codex sometimes exits 0 after refusing to edit anything; these output
/// signals flag that case so the worker records a failure.
const SANDBOX_BLOCKED_SIGNALS: [&str; 4] = [
    "blocked by the execution sandbox",
    "sandbox(landlockrestrict)",
    "couldn't write files directly",
    "panicked at linux-sandbox",
];

/// Resolve a task row and dispatch it to its routed agent.
pub async fn run_task(pool: &SqlitePool, task_id: &str) -> Result<i32> {
    let Some(task) = tasks::get_task(pool, task_id).await? else {
        eprintln!("task not found: {task_id}");
        return Ok(EXIT_TASK_NOT_FOUND);
    };

    let routing = task
        .routing
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    let prompt = task.prompt.clone().unwrap_or_default();

    if is_coding_route(&routing) {
        // Make sure the coding agent has an isolated worktree; setup
        // failures fall back to the repo path rather than aborting. Only a
        // caller-supplied binding is passed through as the configured path;
        // a managed binding is re-derived from the task id so it keeps its
        // managed bit (a configured path is always recorded unmanaged).
        let configured_worktree = if task.worktree_managed {
            None
        } else {
            task.worktree_path.as_deref()
        };
        let mut worktree_path = task.worktree_path.clone();
        match worktree::ensure_task_worktree(
            pool,
            task_id,
            task.repo_path.as_deref(),
            configured_worktree,
        )
        .await
        {
            Ok(Some(info)) => worktree_path = Some(info.path.to_string_lossy().into_owned()),
            Ok(None) => {}
            Err(e) => eprintln!("worktree setup failed: {e:#}"),
        }
        return run_codex(
            task_id,
            &prompt,
            worktree_path.as_deref(),
            task.repo_path.as_deref(),
        )
        .await;
    }

    if is_reviewer_route(&routing) {
        return run_openclaw("reviewer", &prompt).await;
    }
    if is_designer_route(&routing) {
        return run_openclaw("designer", &prompt).await;
    }
    if is_triage_route(&routing) {
        return run_openclaw("triage", &prompt).await;
    }

    eprintln!("unsupported routing: {routing:?}");
    Ok(EXIT_UNSUPPORTED_ROUTING)
}

fn is_coding_route(r: &str) -> bool {
    r.starts_with("codex") || matches!(r, "backend" | "frontend" | "coding" | "implement")
}

fn is_reviewer_route(r: &str) -> bool {
    matches!(r, "reviewer" | "review" | "claude-review") || r.contains("review")
}

fn is_designer_route(r: &str) -> bool {
    matches!(r, "designer" | "design" | "gemini-design") || r.contains("design")
}

fn is_triage_route(r: &str) -> bool {
    matches!(r, "triage" | "classify" | "qwen-triage") || r.contains("triage")
}

/// Run `codex exec` in the task's workdir.
///
/// Workdir fallback order: worktree path, repo path, `DROVER_WORKDIR`.
async fn run_codex(
    task_id: &str,
    prompt: &str,
    worktree_path: Option<&str>,
    repo_path: Option<&str>,
) -> Result<i32> {
    let workdir = [worktree_path, repo_path]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_owned)
        .or_else(|| {
            std::env::var("DROVER_WORKDIR")
                .ok()
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
        });

    let Some(workdir) = workdir else {
        eprintln!("coding route requires a worktree path, repo path, or DROVER_WORKDIR");
        return Ok(EXIT_MISSING_WORKDIR);
    };

    let workdir = PathBuf::from(workdir);
    std::fs::create_dir_all(&workdir)
        .with_context(|| format!("failed to create workdir {}", workdir.display()))?;

    // Drop the prompt next to the work so the agent (and an operator) can
    // read it back.
    let aux = workdir.join(".orchestrator");
    std::fs::create_dir_all(&aux)
        .with_context(|| format!("failed to create {}", aux.display()))?;
    let prompt_file = aux.join(format!("prompt.{}.txt", sanitize_path(task_id)));
    std::fs::write(&prompt_file, prompt)
        .with_context(|| format!("failed to write {}", prompt_file.display()))?;

    if !has_bin("codex") {
        eprintln!("codex binary not found in PATH");
        return Ok(EXIT_BINARY_MISSING);
    }

    let output = tokio::process::Command::new("codex")
        .args(["exec", "--dangerously-bypass-approvals-and-sandbox", prompt])
        .current_dir(&workdir)
        .output()
        .await
        .context("failed to spawn codex")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stdout.is_empty() {
        print!("{stdout}");
    }
    if !stderr.is_empty() {
        eprint!("{stderr}");
    }

    let merged = format!("{stdout}\n{stderr}").to_lowercase();
    if output.status.code() == Some(0)
        && SANDBOX_BLOCKED_SIGNALS.iter().any(|s| merged.contains(s))
    {
        return Ok(EXIT_SANDBOX_BLOCKED);
    }

    Ok(output.status.code().unwrap_or(1))
}

/// Run an `openclaw` agent with the task prompt.
async fn run_openclaw(agent: &str, prompt: &str) -> Result<i32> {
    if !has_bin("openclaw") {
        eprintln!("openclaw binary not found in PATH");
        return Ok(EXIT_BINARY_MISSING);
    }

    let output = tokio::process::Command::new("openclaw")
        .args([
            "agent",
            "--agent",
            agent,
            "--thinking",
            "high",
            "--message",
            prompt,
            "--json",
        ])
        .output()
        .await
        .context("failed to spawn openclaw")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stdout.is_empty() {
        print!("{stdout}");
    }
    if !stderr.is_empty() {
        eprint!("{stderr}");
    }

    Ok(output.status.code().unwrap_or(1))
}

/// Whether a binary is reachable on PATH.
fn has_bin(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_coding_routes() {
        assert!(is_coding_route("codex-backend"));
        assert!(is_coding_route("codex"));
        assert!(is_coding_route("frontend"));
        assert!(is_coding_route("implement"));
        assert!(!is_coding_route("reviewer"));
    }

    #[test]
    fn detects_reviewer_routes() {
        assert!(is_reviewer_route("reviewer"));
        assert!(is_reviewer_route("claude-review"));
        assert!(is_reviewer_route("pr-review"));
        assert!(!is_reviewer_route("designer"));
    }

    #[test]
    fn detects_designer_routes() {
        assert!(is_designer_route("gemini-design"));
        assert!(is_designer_route("design"));
        assert!(!is_designer_route("triage"));
    }

    #[test]
    fn detects_triage_routes() {
        assert!(is_triage_route("qwen-triage"));
        assert!(is_triage_route("classify"));
        assert!(!is_triage_route("codex-backend"));
    }
}
