//! Out-of-band PR and CI monitor.
//!
//! For every subtask bound to a worktree, the monitor reads the current
//! branch, derives the upstream repository slug from the worktree's origin
//! remote, and asks an injectable [`Discovery`] capability for pull
//! requests and check runs. Everything it learns is persisted on the task
//! row; it owns only the `worktree_branch`, `pr_*`, and `ci_*` columns and
//! is idempotent. Rows that cannot be resolved are skipped, never fatal.

use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use drover_db::models::{CiState, Task};
use drover_db::now_ts;
use drover_db::queries::tasks::{self, PrCiUpdate};

use crate::worktree;

/// A pull request record from discovery.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub number: i64,
    pub url: String,
    pub head_ref_name: String,
}

/// A CI check record from discovery.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckRun {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// The monitor's only external I/O surface.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Pull requests whose head is `branch` on `repo_slug`.
    async fn list_pull_requests(
        &self,
        repo_slug: &str,
        branch: &str,
    ) -> Result<Vec<PullRequest>>;

    /// Check runs for a pull request.
    async fn list_checks(&self, repo_slug: &str, pr_number: i64) -> Result<Vec<CheckRun>>;
}

// Compile-time assertion: Discovery must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Discovery) {}
};

/// Discovery backed by the `gh` CLI.
#[derive(Debug, Clone, Default)]
pub struct GhDiscovery;

#[async_trait]
impl Discovery for GhDiscovery {
    async fn list_pull_requests(
        &self,
        repo_slug: &str,
        branch: &str,
    ) -> Result<Vec<PullRequest>> {
        gh_json(&[
            "pr",
            "list",
            "--repo",
            repo_slug,
            "--state",
            "all",
            "--head",
            branch,
            "--limit",
            "20",
            "--json",
            "number,url,headRefName",
        ])
        .await
    }

    async fn list_checks(&self, repo_slug: &str, pr_number: i64) -> Result<Vec<CheckRun>> {
        gh_json(&[
            "pr",
            "checks",
            &pr_number.to_string(),
            "--repo",
            repo_slug,
            "--json",
            "state,link,name",
        ])
        .await
    }
}

/// Run `gh` and deserialize its JSON output; empty output is an empty list.
async fn gh_json<T: serde::de::DeserializeOwned>(args: &[&str]) -> Result<Vec<T>> {
    let output = tokio::process::Command::new("gh")
        .args(args)
        .output()
        .await
        .context("failed to run gh (is the GitHub CLI on PATH?)")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("gh {} failed: {}", args.join(" "), stderr.trim());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let text = stdout.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(text).context("failed to parse gh JSON output")
}

/// Aggregate CI state derived from a set of check runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiSummary {
    pub state: CiState,
    /// Sorted-unique, comma-joined raw states; `"no checks"` when empty.
    pub detail: String,
    /// First non-empty check link.
    pub url: Option<String>,
}

const FAILED_STATES: [&str; 5] = ["FAILURE", "ERROR", "TIMED_OUT", "CANCELLED", "ACTION_REQUIRED"];
const SUCCESS_STATES: [&str; 3] = ["SUCCESS", "SKIPPED", "NEUTRAL"];
const PENDING_STATES: [&str; 4] = ["PENDING", "IN_PROGRESS", "QUEUED", "WAITING"];

/// Fold check runs into one aggregate state.
///
/// Failed beats everything; passed requires every non-empty state to be a
/// success state; pending when anything is still moving; unknown otherwise
/// or when the list is empty.
pub fn aggregate_checks(checks: &[CheckRun]) -> CiSummary {
    if checks.is_empty() {
        return CiSummary {
            state: CiState::Unknown,
            detail: "no checks".to_owned(),
            url: None,
        };
    }

    let states: Vec<String> = checks.iter().map(|c| c.state.to_uppercase()).collect();

    let state = if states.iter().any(|s| FAILED_STATES.contains(&s.as_str())) {
        CiState::Failed
    } else if states
        .iter()
        .filter(|s| !s.is_empty())
        .all(|s| SUCCESS_STATES.contains(&s.as_str()))
    {
        CiState::Passed
    } else if states.iter().any(|s| PENDING_STATES.contains(&s.as_str())) {
        CiState::Pending
    } else {
        CiState::Unknown
    };

    let mut unique = states;
    unique.sort();
    unique.dedup();
    let detail = unique.join(",");
    let detail = if detail.is_empty() {
        "unknown".to_owned()
    } else {
        detail
    };

    let url = checks
        .iter()
        .filter_map(|c| c.link.as_deref())
        .find(|l| !l.is_empty())
        .map(str::to_owned);

    CiSummary { state, detail, url }
}

/// Derive `owner/repo` from a GitHub remote URL.
///
/// Accepts the scp-like, ssh://, and https:// GitHub forms; any other host
/// returns `None`.
pub fn parse_repo_slug(remote_url: &str) -> Option<String> {
    let url = remote_url.trim();
    if url.is_empty() {
        return None;
    }

    let rest = url
        .strip_prefix("git@github.com:")
        .or_else(|| url.strip_prefix("ssh://git@github.com/"))
        .or_else(|| url.strip_prefix("https://github.com/"))?;

    let rest = rest.strip_suffix(".git").unwrap_or(rest);
    let mut parts = rest.split('/').filter(|p| !p.is_empty());
    let owner = parts.next()?;
    let repo = parts.next()?;
    Some(format!("{owner}/{repo}"))
}

/// Slug of the worktree's `origin` remote, when it is a GitHub remote.
fn repo_slug_from_worktree(worktree_path: &Path) -> Option<String> {
    let remote = worktree::git(worktree_path, &["remote", "get-url", "origin"]).ok()?;
    parse_repo_slug(remote.trim())
}

/// One monitor pass over the store (or a single task when `task_id` is
/// set). Returns the number of rows that received a PR/CI update.
pub async fn monitor_once(
    pool: &SqlitePool,
    discovery: &dyn Discovery,
    task_id: Option<&str>,
) -> Result<usize> {
    let rows: Vec<Task> = match task_id {
        Some(id) => tasks::get_task(pool, id).await?.into_iter().collect(),
        None => tasks::subtasks_with_worktrees(pool).await?,
    };

    let mut updated = 0;
    for task in &rows {
        let wt = task.worktree_path.as_deref().unwrap_or("").trim();
        if wt.is_empty() {
            continue;
        }

        let Some(branch) = worktree::current_branch(Path::new(wt)) else {
            debug!(task_id = %task.id, "worktree branch unreadable, skipping");
            continue;
        };

        tasks::set_worktree_branch(pool, &task.id, &branch, now_ts()).await?;

        let Some(slug) = repo_slug_from_worktree(Path::new(wt)) else {
            debug!(task_id = %task.id, "no GitHub remote, skipping");
            continue;
        };

        let prs = match discovery.list_pull_requests(&slug, &branch).await {
            Ok(prs) => prs,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "PR discovery failed, skipping");
                continue;
            }
        };

        // Prefer the exact head ref; fall back to the first record.
        let Some(pr) = prs
            .iter()
            .find(|pr| pr.head_ref_name == branch)
            .or_else(|| prs.first())
        else {
            continue;
        };

        let checks = match discovery.list_checks(&slug, pr.number).await {
            Ok(checks) => checks,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "CI discovery failed, skipping");
                continue;
            }
        };
        let summary = aggregate_checks(&checks);

        tasks::set_pr_ci(
            pool,
            &task.id,
            &PrCiUpdate {
                pr_number: pr.number,
                pr_url: &pr.url,
                ci_state: summary.state.as_str(),
                ci_detail: &summary.detail,
                ci_url: summary.url.as_deref(),
            },
            now_ts(),
        )
        .await?;
        updated += 1;
    }

    Ok(updated)
}
