//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use sqlx::{Executor, Row, Sqlite};

use crate::models::{FailureKind, Task, TaskStatus};

/// Parameters for inserting a plan row.
#[derive(Debug, Clone)]
pub struct NewPlan<'a> {
    pub id: &'a str,
    pub title: Option<&'a str>,
    pub max_attempts: i64,
    pub idempotency_key: Option<&'a str>,
    pub now: i64,
}

/// Insert a plan row. `plan_id` is set to the plan's own id.
pub async fn insert_plan<'e, E>(ex: E, new: &NewPlan<'_>) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO tasks (id, kind, plan_id, title, status, max_attempts, \
                            idempotency_key, created_at, updated_at) \
         VALUES (?, 'plan', ?, ?, 'queued', ?, ?, ?, ?)",
    )
    .bind(new.id)
    .bind(new.id)
    .bind(new.title)
    .bind(new.max_attempts)
    .bind(new.idempotency_key)
    .bind(new.now)
    .bind(new.now)
    .execute(ex)
    .await
    .with_context(|| format!("failed to insert plan {}", new.id))?;

    Ok(())
}

/// Parameters for inserting a subtask row.
#[derive(Debug, Clone)]
pub struct NewSubtask<'a> {
    pub id: &'a str,
    pub plan_id: &'a str,
    pub title: Option<&'a str>,
    pub routing: Option<&'a str>,
    pub prompt: &'a str,
    pub repo: Option<&'a str>,
    pub repo_path: Option<&'a str>,
    pub max_attempts: i64,
    pub now: i64,
}

/// Insert a subtask row, queued with zero attempts.
pub async fn insert_subtask<'e, E>(ex: E, new: &NewSubtask<'_>) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO tasks (id, kind, plan_id, title, routing, prompt, repo, \
                            repo_path, status, max_attempts, created_at, updated_at) \
         VALUES (?, 'subtask', ?, ?, ?, ?, ?, ?, 'queued', ?, ?, ?)",
    )
    .bind(new.id)
    .bind(new.plan_id)
    .bind(new.title)
    .bind(new.routing)
    .bind(new.prompt)
    .bind(new.repo)
    .bind(new.repo_path)
    .bind(new.max_attempts)
    .bind(new.now)
    .bind(new.now)
    .execute(ex)
    .await
    .with_context(|| format!("failed to insert subtask {}", new.id))?;

    Ok(())
}

/// Fetch a single task by id.
pub async fn get_task<'e, E>(ex: E, id: &str) -> Result<Option<Task>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .with_context(|| format!("failed to fetch task {id}"))?;

    Ok(task)
}

/// Look up an existing plan by idempotency key.
pub async fn find_plan_by_idempotency_key<'e, E>(ex: E, key: &str) -> Result<Option<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT id FROM tasks WHERE idempotency_key = ? AND kind = 'plan'")
        .bind(key)
        .fetch_optional(ex)
        .await
        .context("failed to look up idempotency key")?;

    Ok(match row {
        Some(row) => Some(row.try_get("id")?),
        None => None,
    })
}

/// Select one runnable subtask: queued, with every dependency succeeded.
///
/// Tie-break is ascending `created_at`. This is a scheduling hint, not a
/// claim -- the worker must re-check under an immediate transaction.
pub async fn next_runnable<'e, E>(ex: E) -> Result<Option<Task>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let task = sqlx::query_as::<_, Task>(
        "SELECT t.* \
         FROM tasks t \
         WHERE t.kind = 'subtask' \
           AND t.status = 'queued' \
           AND NOT EXISTS ( \
             SELECT 1 FROM deps d \
             JOIN tasks td ON td.id = d.depends_on \
             WHERE d.task_id = t.id AND td.status != 'succeeded' \
           ) \
         ORDER BY t.created_at ASC \
         LIMIT 1",
    )
    .fetch_optional(ex)
    .await
    .context("failed to select next runnable subtask")?;

    Ok(task)
}

/// Atomically flip a queued subtask to running, incrementing `attempt`.
///
/// The `status = 'queued'` guard makes this the claim's read-modify-write
/// check: zero affected rows means another worker got there first.
pub async fn claim_for_run<'e, E>(ex: E, id: &str, now: i64) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'running', attempt = attempt + 1, updated_at = ? \
         WHERE id = ? AND status = 'queued'",
    )
    .bind(now)
    .bind(id)
    .execute(ex)
    .await
    .with_context(|| format!("failed to claim task {id}"))?;

    Ok(result.rows_affected())
}

/// Record a successful run, clearing the failure fields.
pub async fn mark_succeeded<'e, E>(ex: E, id: &str, now: i64) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "UPDATE tasks \
         SET status = 'succeeded', failure_kind = NULL, failure_detail = NULL, \
             updated_at = ? \
         WHERE id = ?",
    )
    .bind(now)
    .bind(id)
    .execute(ex)
    .await
    .with_context(|| format!("failed to mark task {id} succeeded"))?;

    Ok(())
}

/// Record a failed run with its classification.
pub async fn mark_failed<'e, E>(
    ex: E,
    id: &str,
    kind: &FailureKind,
    detail: &str,
    now: i64,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', failure_kind = ?, failure_detail = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(kind.as_str())
    .bind(detail)
    .bind(now)
    .bind(id)
    .execute(ex)
    .await
    .with_context(|| format!("failed to mark task {id} failed"))?;

    Ok(())
}

/// Put a failed subtask back in the queue for another attempt.
pub async fn requeue<'e, E>(ex: E, id: &str, now: i64) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE tasks SET status = 'queued', updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(ex)
        .await
        .with_context(|| format!("failed to requeue task {id}"))?;

    Ok(())
}

/// Queued subtasks with at least one dependency in a terminal-non-success
/// state. These are the rows reconciliation flips to blocked.
pub async fn blocked_candidates<'e, E>(ex: E) -> Result<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT t.id \
         FROM tasks t \
         WHERE t.kind = 'subtask' \
           AND t.status = 'queued' \
           AND EXISTS ( \
             SELECT 1 FROM deps d \
             JOIN tasks td ON td.id = d.depends_on \
             WHERE d.task_id = t.id \
               AND td.status IN ('failed', 'blocked', 'canceled') \
           )",
    )
    .fetch_all(ex)
    .await
    .context("failed to select blocked candidates")?;

    let mut ids = Vec::with_capacity(rows.len());
    for row in &rows {
        ids.push(row.try_get::<String, _>("id")?);
    }
    Ok(ids)
}

/// Mark a subtask blocked with a reason.
pub async fn mark_blocked<'e, E>(ex: E, id: &str, reason: &str, now: i64) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "UPDATE tasks \
         SET status = 'blocked', blocked_reason = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(reason)
    .bind(now)
    .bind(id)
    .execute(ex)
    .await
    .with_context(|| format!("failed to mark task {id} blocked"))?;

    Ok(())
}

/// Ids of all plan rows.
pub async fn plan_ids<'e, E>(ex: E) -> Result<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT id FROM tasks WHERE kind = 'plan'")
        .fetch_all(ex)
        .await
        .context("failed to list plans")?;

    let mut ids = Vec::with_capacity(rows.len());
    for row in &rows {
        ids.push(row.try_get::<String, _>("id")?);
    }
    Ok(ids)
}

/// Statuses of a plan's subtasks (the multiset the rollup is computed from).
pub async fn subtask_statuses<'e, E>(ex: E, plan_id: &str) -> Result<Vec<TaskStatus>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT status FROM tasks WHERE kind = 'subtask' AND plan_id = ?")
        .bind(plan_id)
        .fetch_all(ex)
        .await
        .with_context(|| format!("failed to list subtask statuses for plan {plan_id}"))?;

    let mut statuses = Vec::with_capacity(rows.len());
    for row in &rows {
        let s: String = row.try_get("status")?;
        statuses.push(TaskStatus::from_wire(&s));
    }
    Ok(statuses)
}

/// Current status of a single task.
pub async fn task_status<'e, E>(ex: E, id: &str) -> Result<Option<TaskStatus>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT status FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .with_context(|| format!("failed to fetch status of task {id}"))?;

    Ok(match row {
        Some(row) => {
            let s: String = row.try_get("status")?;
            Some(TaskStatus::from_wire(&s))
        }
        None => None,
    })
}

/// Overwrite a task's status (used by the plan rollup).
pub async fn set_status<'e, E>(ex: E, id: &str, status: &TaskStatus, now: i64) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .execute(ex)
        .await
        .with_context(|| format!("failed to set status of task {id}"))?;

    Ok(())
}

/// Persist a task's worktree binding.
pub async fn set_worktree<'e, E>(
    ex: E,
    id: &str,
    path: &str,
    managed: bool,
    branch: Option<&str>,
    now: i64,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "UPDATE tasks \
         SET worktree_path = ?, worktree_managed = ?, worktree_branch = ?, \
             updated_at = ? \
         WHERE id = ?",
    )
    .bind(path)
    .bind(managed)
    .bind(branch)
    .bind(now)
    .bind(id)
    .execute(ex)
    .await
    .with_context(|| format!("failed to persist worktree for task {id}"))?;

    Ok(())
}

/// Clear a task's worktree binding after cleanup.
pub async fn clear_worktree<'e, E>(ex: E, id: &str, now: i64) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "UPDATE tasks \
         SET worktree_path = NULL, worktree_managed = 0, worktree_branch = NULL, \
             updated_at = ? \
         WHERE id = ?",
    )
    .bind(now)
    .bind(id)
    .execute(ex)
    .await
    .with_context(|| format!("failed to clear worktree for task {id}"))?;

    Ok(())
}

/// Update the observed worktree branch (monitor-owned column).
pub async fn set_worktree_branch<'e, E>(ex: E, id: &str, branch: &str, now: i64) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE tasks SET worktree_branch = ?, updated_at = ? WHERE id = ?")
        .bind(branch)
        .bind(now)
        .bind(id)
        .execute(ex)
        .await
        .with_context(|| format!("failed to set worktree branch for task {id}"))?;

    Ok(())
}

/// Parameters for the monitor's PR/CI update.
#[derive(Debug, Clone)]
pub struct PrCiUpdate<'a> {
    pub pr_number: i64,
    pub pr_url: &'a str,
    pub ci_state: &'a str,
    pub ci_detail: &'a str,
    pub ci_url: Option<&'a str>,
}

/// Persist discovered PR and CI state (monitor-owned columns).
pub async fn set_pr_ci<'e, E>(ex: E, id: &str, update: &PrCiUpdate<'_>, now: i64) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "UPDATE tasks \
         SET pr_number = ?, pr_url = ?, ci_state = ?, ci_detail = ?, ci_url = ?, \
             updated_at = ? \
         WHERE id = ?",
    )
    .bind(update.pr_number)
    .bind(update.pr_url)
    .bind(update.ci_state)
    .bind(update.ci_detail)
    .bind(update.ci_url)
    .bind(now)
    .bind(id)
    .execute(ex)
    .await
    .with_context(|| format!("failed to persist PR/CI state for task {id}"))?;

    Ok(())
}

/// Subtasks that have a worktree bound (the monitor's working set).
pub async fn subtasks_with_worktrees<'e, E>(ex: E) -> Result<Vec<Task>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE kind = 'subtask' AND worktree_path IS NOT NULL \
         ORDER BY created_at ASC",
    )
    .fetch_all(ex)
    .await
    .context("failed to list subtasks with worktrees")?;

    Ok(tasks)
}

/// List tasks for the operator view, newest first, optionally filtered by
/// status.
pub async fn list_tasks<'e, E>(ex: E, status: Option<&str>, limit: i64) -> Result<Vec<Task>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let tasks = match status {
        Some(status) => {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks WHERE status = ? \
                 ORDER BY updated_at DESC LIMIT ?",
            )
            .bind(status)
            .bind(limit)
            .fetch_all(ex)
            .await
        }
        None => {
            sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY updated_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(ex)
                .await
        }
    }
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// Total row count, for enqueue-idempotency checks.
pub async fn count_tasks<'e, E>(ex: E) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
        .fetch_one(ex)
        .await
        .context("failed to count tasks")?;

    Ok(row.0)
}
