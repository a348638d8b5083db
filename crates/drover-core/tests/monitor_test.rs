//! Monitor roll-up scenarios against a stub discovery capability.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;

use drover_core::monitor::{self, CheckRun, Discovery, PullRequest};
use drover_core::worktree::ensure_task_worktree;
use drover_db::models::CiState;
use drover_db::queries::tasks::{self, NewSubtask};

use drover_test_utils::{create_temp_repo, open_test_store, run_git};

struct StubDiscovery {
    prs: Vec<PullRequest>,
    checks: Vec<CheckRun>,
}

#[async_trait]
impl Discovery for StubDiscovery {
    async fn list_pull_requests(&self, _repo: &str, _branch: &str) -> Result<Vec<PullRequest>> {
        Ok(self.prs.clone())
    }

    async fn list_checks(&self, _repo: &str, _pr: i64) -> Result<Vec<CheckRun>> {
        Ok(self.checks.clone())
    }
}

fn pr(number: i64, head: &str) -> PullRequest {
    PullRequest {
        number,
        url: format!("https://github.com/org/repo/pull/{number}"),
        head_ref_name: head.to_owned(),
    }
}

fn check(state: &str, link: &str, name: &str) -> CheckRun {
    CheckRun {
        state: state.to_owned(),
        link: Some(link.to_owned()),
        name: Some(name.to_owned()),
    }
}

/// Seed a subtask bound to a worktree in a scratch repo with a GitHub
/// remote. Returns the repo path (held alive by the caller's TempDir).
async fn seed_worktree_task(pool: &SqlitePool, repo: &std::path::Path, id: &str) {
    let repo_str = repo.to_string_lossy().into_owned();
    tasks::insert_subtask(
        pool,
        &NewSubtask {
            id,
            plan_id: "p1",
            title: None,
            routing: Some("codex-backend"),
            prompt: "edit",
            repo: None,
            repo_path: Some(&repo_str),
            max_attempts: 3,
            now: 100,
        },
    )
    .await
    .expect("subtask");

    ensure_task_worktree(pool, id, Some(&repo_str), None)
        .await
        .expect("ensure")
        .expect("worktree");
}

#[tokio::test]
async fn persists_pr_and_aggregated_ci_state() {
    let (pool, _db) = open_test_store().await;
    let (_repo_dir, repo) = create_temp_repo();
    run_git(&repo, &["remote", "add", "origin", "git@github.com:org/repo.git"]);
    seed_worktree_task(&pool, &repo, "t1").await;

    let discovery = StubDiscovery {
        prs: vec![pr(42, "orchestrator/t1")],
        checks: vec![
            check("SUCCESS", "https://ci.example/1", "lint"),
            check("FAILURE", "https://ci.example/2", "tests"),
        ],
    };

    let updated = monitor::monitor_once(&pool, &discovery, None)
        .await
        .expect("monitor");
    assert_eq!(updated, 1);

    let row = tasks::get_task(&pool, "t1").await.expect("query").expect("row");
    assert_eq!(row.worktree_branch.as_deref(), Some("orchestrator/t1"));
    assert_eq!(row.pr_number, Some(42));
    assert_eq!(row.pr_url.as_deref(), Some("https://github.com/org/repo/pull/42"));
    assert_eq!(row.ci_state, Some(CiState::Failed));
    assert_eq!(row.ci_detail.as_deref(), Some("FAILURE,SUCCESS"));
    assert_eq!(row.ci_url.as_deref(), Some("https://ci.example/1"));
}

#[tokio::test]
async fn monitor_is_idempotent() {
    let (pool, _db) = open_test_store().await;
    let (_repo_dir, repo) = create_temp_repo();
    run_git(&repo, &["remote", "add", "origin", "git@github.com:org/repo.git"]);
    seed_worktree_task(&pool, &repo, "t1").await;

    let discovery = StubDiscovery {
        prs: vec![pr(42, "orchestrator/t1")],
        checks: vec![check("SUCCESS", "https://ci.example/1", "lint")],
    };

    monitor::monitor_once(&pool, &discovery, None).await.expect("first pass");
    let first = tasks::get_task(&pool, "t1").await.expect("query").expect("row");
    monitor::monitor_once(&pool, &discovery, None).await.expect("second pass");
    let second = tasks::get_task(&pool, "t1").await.expect("query").expect("row");

    assert_eq!(first.pr_number, second.pr_number);
    assert_eq!(first.ci_state, second.ci_state);
    assert_eq!(first.ci_detail, second.ci_detail);
}

#[tokio::test]
async fn falls_back_to_first_pr_when_head_ref_does_not_match() {
    let (pool, _db) = open_test_store().await;
    let (_repo_dir, repo) = create_temp_repo();
    run_git(&repo, &["remote", "add", "origin", "https://github.com/org/repo"]);
    seed_worktree_task(&pool, &repo, "t1").await;

    let discovery = StubDiscovery {
        prs: vec![pr(7, "someone-elses-branch"), pr(8, "another-branch")],
        checks: vec![check("PENDING", "https://ci.example/7", "build")],
    };

    monitor::monitor_once(&pool, &discovery, None).await.expect("monitor");

    let row = tasks::get_task(&pool, "t1").await.expect("query").expect("row");
    assert_eq!(row.pr_number, Some(7));
    assert_eq!(row.ci_state, Some(CiState::Pending));
}

#[tokio::test]
async fn exact_head_ref_beats_the_first_record() {
    let (pool, _db) = open_test_store().await;
    let (_repo_dir, repo) = create_temp_repo();
    run_git(&repo, &["remote", "add", "origin", "git@github.com:org/repo.git"]);
    seed_worktree_task(&pool, &repo, "t1").await;

    let discovery = StubDiscovery {
        prs: vec![pr(7, "other"), pr(42, "orchestrator/t1")],
        checks: vec![check("SUCCESS", "https://ci.example/42", "tests")],
    };

    monitor::monitor_once(&pool, &discovery, None).await.expect("monitor");

    let row = tasks::get_task(&pool, "t1").await.expect("query").expect("row");
    assert_eq!(row.pr_number, Some(42));
    assert_eq!(row.ci_state, Some(CiState::Passed));
}

#[tokio::test]
async fn no_pull_request_still_records_the_branch() {
    let (pool, _db) = open_test_store().await;
    let (_repo_dir, repo) = create_temp_repo();
    run_git(&repo, &["remote", "add", "origin", "git@github.com:org/repo.git"]);
    seed_worktree_task(&pool, &repo, "t1").await;

    let discovery = StubDiscovery {
        prs: vec![],
        checks: vec![],
    };

    let updated = monitor::monitor_once(&pool, &discovery, None)
        .await
        .expect("monitor");
    assert_eq!(updated, 0);

    let row = tasks::get_task(&pool, "t1").await.expect("query").expect("row");
    assert_eq!(row.worktree_branch.as_deref(), Some("orchestrator/t1"));
    assert_eq!(row.pr_number, None);
    assert_eq!(row.ci_state, None);
}

#[tokio::test]
async fn unknown_hosts_are_skipped() {
    let (pool, _db) = open_test_store().await;
    let (_repo_dir, repo) = create_temp_repo();
    run_git(&repo, &["remote", "add", "origin", "https://gitlab.com/org/repo.git"]);
    seed_worktree_task(&pool, &repo, "t1").await;

    let discovery = StubDiscovery {
        prs: vec![pr(42, "orchestrator/t1")],
        checks: vec![check("SUCCESS", "https://ci.example/1", "lint")],
    };

    let updated = monitor::monitor_once(&pool, &discovery, None)
        .await
        .expect("monitor");
    assert_eq!(updated, 0);

    let row = tasks::get_task(&pool, "t1").await.expect("query").expect("row");
    assert_eq!(row.pr_number, None, "non-GitHub remotes must be ignored");
}

#[tokio::test]
async fn single_task_filter_limits_the_pass() {
    let (pool, _db) = open_test_store().await;
    let (_repo_dir, repo) = create_temp_repo();
    run_git(&repo, &["remote", "add", "origin", "git@github.com:org/repo.git"]);
    seed_worktree_task(&pool, &repo, "t1").await;
    seed_worktree_task(&pool, &repo, "t2").await;

    let discovery = StubDiscovery {
        prs: vec![pr(42, "orchestrator/t1")],
        checks: vec![check("SUCCESS", "https://ci.example/1", "lint")],
    };

    let updated = monitor::monitor_once(&pool, &discovery, Some("t1"))
        .await
        .expect("monitor");
    assert_eq!(updated, 1);

    let other = tasks::get_task(&pool, "t2").await.expect("query").expect("row");
    assert_eq!(other.pr_number, None, "t2 was outside the filtered pass");
}
