//! Integration tests for the task, dep, and event query functions.

use drover_db::models::{EventLevel, FailureKind, TaskKind, TaskStatus};
use drover_db::queries::deps;
use drover_db::queries::events::{self, NewEvent};
use drover_db::queries::tasks::{self, NewPlan, NewSubtask};

use drover_test_utils::open_test_store;
use sqlx::SqlitePool;

async fn seed_plan(pool: &SqlitePool) {
    tasks::insert_plan(
        pool,
        &NewPlan {
            id: "p1",
            title: Some("demo"),
            max_attempts: 3,
            idempotency_key: None,
            now: 100,
        },
    )
    .await
    .expect("plan should insert");
}

async fn seed_subtask(pool: &SqlitePool, id: &str, now: i64) {
    tasks::insert_subtask(
        pool,
        &NewSubtask {
            id,
            plan_id: "p1",
            title: None,
            routing: Some("codex-backend"),
            prompt: "do the thing",
            repo: Some("demo/repo"),
            repo_path: Some("/tmp/demo-repo"),
            max_attempts: 3,
            now,
        },
    )
    .await
    .expect("subtask should insert");
}

#[tokio::test]
async fn insert_and_fetch_roundtrip() {
    let (pool, _dir) = open_test_store().await;
    seed_plan(&pool).await;
    seed_subtask(&pool, "a", 100).await;

    let plan = tasks::get_task(&pool, "p1").await.expect("query").expect("plan row");
    assert_eq!(plan.kind, TaskKind::Plan);
    assert_eq!(plan.plan_id.as_deref(), Some("p1"));
    assert_eq!(plan.status, TaskStatus::Queued);
    assert_eq!(plan.attempt, 0);

    let task = tasks::get_task(&pool, "a").await.expect("query").expect("task row");
    assert_eq!(task.kind, TaskKind::Subtask);
    assert_eq!(task.plan_id.as_deref(), Some("p1"));
    assert_eq!(task.routing.as_deref(), Some("codex-backend"));
    assert_eq!(task.repo.as_deref(), Some("demo/repo"));
    assert_eq!(task.repo_path.as_deref(), Some("/tmp/demo-repo"));
    assert!(!task.worktree_managed);
    assert_eq!(task.created_at, 100);

    assert!(tasks::get_task(&pool, "ghost").await.expect("query").is_none());
}

#[tokio::test]
async fn claim_guard_rejects_non_queued_rows() {
    let (pool, _dir) = open_test_store().await;
    seed_plan(&pool).await;
    seed_subtask(&pool, "a", 100).await;

    let claimed = tasks::claim_for_run(&pool, "a", 200).await.expect("claim");
    assert_eq!(claimed, 1);

    let task = tasks::get_task(&pool, "a").await.expect("query").expect("row");
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.attempt, 1);
    assert_eq!(task.updated_at, 200);

    // The row is no longer queued; a second claim must lose.
    let lost = tasks::claim_for_run(&pool, "a", 201).await.expect("claim");
    assert_eq!(lost, 0);
    let task = tasks::get_task(&pool, "a").await.expect("query").expect("row");
    assert_eq!(task.attempt, 1, "lost claim must not bump attempt");
}

#[tokio::test]
async fn failure_fields_set_and_cleared() {
    let (pool, _dir) = open_test_store().await;
    seed_plan(&pool).await;
    seed_subtask(&pool, "a", 100).await;

    tasks::mark_failed(&pool, "a", &FailureKind::Test, "matched:pytest; log=/x.log", 200)
        .await
        .expect("mark failed");
    let task = tasks::get_task(&pool, "a").await.expect("query").expect("row");
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failure_kind, Some(FailureKind::Test));
    assert_eq!(task.failure_detail.as_deref(), Some("matched:pytest; log=/x.log"));

    tasks::mark_succeeded(&pool, "a", 300).await.expect("mark succeeded");
    let task = tasks::get_task(&pool, "a").await.expect("query").expect("row");
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.failure_kind, None, "success clears failure_kind");
    assert_eq!(task.failure_detail, None);
}

#[tokio::test]
async fn next_runnable_honors_deps_and_age() {
    let (pool, _dir) = open_test_store().await;
    seed_plan(&pool).await;
    // b is older than a, but depends on a.
    seed_subtask(&pool, "b", 100).await;
    seed_subtask(&pool, "a", 200).await;
    seed_subtask(&pool, "c", 300).await;
    deps::insert_dep(&pool, "b", "a").await.expect("dep");

    // b is oldest but waiting on a; of the runnable rows a predates c.
    let next = tasks::next_runnable(&pool).await.expect("query").expect("runnable");
    assert_eq!(next.id, "a");

    tasks::mark_succeeded(&pool, "a", 400).await.expect("succeed");
    let next = tasks::next_runnable(&pool).await.expect("query").expect("runnable");
    assert_eq!(next.id, "b", "b unblocks once a succeeded and is oldest");

    tasks::mark_succeeded(&pool, "b", 500).await.expect("succeed");
    tasks::mark_succeeded(&pool, "c", 500).await.expect("succeed");
    assert!(tasks::next_runnable(&pool).await.expect("query").is_none());
}

#[tokio::test]
async fn worktree_binding_roundtrip() {
    let (pool, _dir) = open_test_store().await;
    seed_plan(&pool).await;
    seed_subtask(&pool, "a", 100).await;

    tasks::set_worktree(&pool, "a", "/repo/.orchestrator/worktrees/a", true, Some("orchestrator/a"), 200)
        .await
        .expect("set worktree");
    let task = tasks::get_task(&pool, "a").await.expect("query").expect("row");
    assert!(task.worktree_managed);
    assert_eq!(
        task.worktree_path.as_deref(),
        Some("/repo/.orchestrator/worktrees/a")
    );
    assert_eq!(task.worktree_branch.as_deref(), Some("orchestrator/a"));

    tasks::clear_worktree(&pool, "a", 300).await.expect("clear worktree");
    let task = tasks::get_task(&pool, "a").await.expect("query").expect("row");
    assert!(!task.worktree_managed);
    assert_eq!(task.worktree_path, None);
    assert_eq!(task.worktree_branch, None);
}

#[tokio::test]
async fn events_append_in_order_with_data() {
    let (pool, _dir) = open_test_store().await;
    seed_plan(&pool).await;

    events::insert_event(
        &pool,
        &NewEvent {
            task_id: "p1",
            ts: 100,
            level: EventLevel::Info,
            message: "enqueued plan",
            data: Some(&serde_json::json!({ "subtasks": 2 })),
        },
    )
    .await
    .expect("event");
    events::insert_event(
        &pool,
        &NewEvent {
            task_id: "p1",
            ts: 100,
            level: EventLevel::Warn,
            message: "second",
            data: None,
        },
    )
    .await
    .expect("event");

    let events = events::list_events_for_task(&pool, "p1").await.expect("list");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].message, "enqueued plan");
    assert_eq!(events[0].level, EventLevel::Info);
    let data = events[0].data.as_deref().expect("data payload");
    let parsed: serde_json::Value = serde_json::from_str(data).expect("json");
    assert_eq!(parsed["subtasks"], 2);
    assert_eq!(events[1].message, "second");
}
