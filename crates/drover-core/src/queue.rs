//! Plan enqueue, runnable selection, and state reconciliation.
//!
//! Enqueue is atomic: a reader either sees the whole plan or none of it.
//! Reconciliation is idempotent and eventually consistent -- each pass
//! propagates blocked state one dependency hop and recomputes every plan's
//! rollup, so repeated passes converge on the true state.

use anyhow::{Context, Result};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{info, warn};

use drover_db::models::{EventLevel, Task, TaskStatus};
use drover_db::now_ts;
use drover_db::pool::ImmediateTx;
use drover_db::queries::events::{self, NewEvent};
use drover_db::queries::tasks::{self, NewPlan, NewSubtask};
use drover_db::queries::deps;

use crate::plan::{validate_plan, PlanInput, DEFAULT_MAX_PROMPT_CHARS};

/// Reason recorded on subtasks blocked by a failed dependency.
pub const BLOCKED_REASON_DEPENDENCY: &str = "dependency_failed";

/// Options for [`enqueue_plan`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions<'a> {
    /// When set, a second enqueue with the same key returns the existing
    /// plan id and writes nothing.
    pub idempotency_key: Option<&'a str>,
    pub max_attempts: i64,
    pub max_prompt_chars: usize,
}

impl Default for EnqueueOptions<'_> {
    fn default() -> Self {
        Self {
            idempotency_key: None,
            max_attempts: 3,
            max_prompt_chars: DEFAULT_MAX_PROMPT_CHARS,
        }
    }
}

/// Validate a plan and materialize it in the store.
///
/// Runs entirely inside one immediate transaction: the plan row, every
/// subtask row (copying routing/prompt/title plus the plan-level repo and
/// repo path, with per-subtask override), every dependency edge, and the
/// enqueue event all land atomically. Returns the plan id.
pub async fn enqueue_plan(
    pool: &SqlitePool,
    plan: &PlanInput,
    options: &EnqueueOptions<'_>,
) -> Result<String> {
    validate_plan(plan, options.max_prompt_chars)?;

    let plan_id = plan
        .plan_id
        .as_deref()
        .context("plan id missing after validation")?;
    let now = now_ts();

    let mut tx = ImmediateTx::begin(pool).await?;

    if let Some(key) = options.idempotency_key {
        if let Some(existing) = tasks::find_plan_by_idempotency_key(tx.conn(), key).await? {
            // Same key: return the original plan id, write nothing.
            tx.commit().await?;
            info!(plan_id = %existing, key, "enqueue short-circuited by idempotency key");
            return Ok(existing);
        }
    }

    tasks::insert_plan(
        tx.conn(),
        &NewPlan {
            id: plan_id,
            title: plan.title.as_deref(),
            max_attempts: options.max_attempts,
            idempotency_key: options.idempotency_key,
            now,
        },
    )
    .await?;

    for subtask in &plan.subtasks {
        let id = subtask.id.as_deref().context("subtask id missing after validation")?;
        let prompt = subtask
            .prompt
            .as_deref()
            .context("subtask prompt missing after validation")?;

        tasks::insert_subtask(
            tx.conn(),
            &NewSubtask {
                id,
                plan_id,
                title: subtask.title.as_deref(),
                routing: subtask.routing.as_deref(),
                prompt,
                repo: plan.repo.as_deref(),
                repo_path: subtask.repo_path.as_deref().or(plan.repo_path.as_deref()),
                max_attempts: options.max_attempts,
                now,
            },
        )
        .await?;

        for dep in &subtask.depends_on {
            deps::insert_dep(tx.conn(), id, dep).await?;
        }
    }

    events::insert_event(
        tx.conn(),
        &NewEvent {
            task_id: plan_id,
            ts: now,
            level: EventLevel::Info,
            message: "enqueued plan",
            data: Some(&json!({ "subtasks": plan.subtasks.len() })),
        },
    )
    .await?;

    tx.commit().await?;
    info!(plan_id, subtasks = plan.subtasks.len(), "plan enqueued");
    Ok(plan_id.to_owned())
}

/// Select one runnable subtask, or `None` when nothing is ready.
///
/// A scheduling hint only -- the worker re-verifies under its claim
/// transaction.
pub async fn next_runnable(pool: &SqlitePool) -> Result<Option<Task>> {
    tasks::next_runnable(pool).await
}

/// Compute a plan's status from the multiset of its subtasks' statuses.
///
/// Priority order: all succeeded; any running; any queued; any terminal
/// non-success; otherwise queued.
pub fn rollup_status(statuses: &[TaskStatus]) -> TaskStatus {
    if statuses.iter().all(|s| *s == TaskStatus::Succeeded) {
        TaskStatus::Succeeded
    } else if statuses.iter().any(|s| *s == TaskStatus::Running) {
        TaskStatus::Running
    } else if statuses.iter().any(|s| *s == TaskStatus::Queued) {
        TaskStatus::Queued
    } else if statuses.iter().any(|s| s.is_terminal_non_success()) {
        TaskStatus::Failed
    } else {
        TaskStatus::Queued
    }
}

/// One reconciliation pass: blocked propagation, then plan rollups.
///
/// Queued subtasks with a dependency in a terminal-non-success state become
/// blocked; each plan's status is recomputed and written only on change.
/// Plans with no subtasks are left untouched. The whole pass runs in one
/// immediate transaction so every row write shares a timestamp with its
/// event.
pub async fn refresh_blocked_and_plans(pool: &SqlitePool) -> Result<()> {
    let now = now_ts();
    let mut tx = ImmediateTx::begin(pool).await?;

    let candidates = tasks::blocked_candidates(tx.conn()).await?;
    for id in &candidates {
        tasks::mark_blocked(tx.conn(), id, BLOCKED_REASON_DEPENDENCY, now).await?;
        events::insert_event(
            tx.conn(),
            &NewEvent {
                task_id: id,
                ts: now,
                level: EventLevel::Warn,
                message: "blocked: dependency_failed",
                data: None,
            },
        )
        .await?;
        warn!(task_id = %id, "subtask blocked by failed dependency");
    }

    for plan_id in tasks::plan_ids(tx.conn()).await? {
        let statuses = tasks::subtask_statuses(tx.conn(), &plan_id).await?;
        if statuses.is_empty() {
            continue;
        }

        let new_status = rollup_status(&statuses);
        let old_status = tasks::task_status(tx.conn(), &plan_id).await?;
        if old_status.as_ref() == Some(&new_status) {
            continue;
        }

        tasks::set_status(tx.conn(), &plan_id, &new_status, now).await?;
        let message = format!("plan status -> {new_status}");
        events::insert_event(
            tx.conn(),
            &NewEvent {
                task_id: &plan_id,
                ts: now,
                level: EventLevel::Info,
                message: &message,
                data: None,
            },
        )
        .await?;
        info!(plan_id = %plan_id, status = %new_status, "plan rollup changed");
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statuses(wire: &[&str]) -> Vec<TaskStatus> {
        wire.iter().map(|s| TaskStatus::from_wire(s)).collect()
    }

    #[test]
    fn rollup_all_succeeded() {
        assert_eq!(
            rollup_status(&statuses(&["succeeded", "succeeded"])),
            TaskStatus::Succeeded
        );
    }

    #[test]
    fn rollup_running_wins_over_failed() {
        assert_eq!(
            rollup_status(&statuses(&["succeeded", "running", "failed"])),
            TaskStatus::Running
        );
    }

    #[test]
    fn rollup_queued_wins_over_failed() {
        assert_eq!(
            rollup_status(&statuses(&["queued", "failed"])),
            TaskStatus::Queued
        );
    }

    #[test]
    fn rollup_terminal_failure() {
        for wire in [
            &["succeeded", "failed"][..],
            &["blocked", "succeeded"][..],
            &["canceled"][..],
        ] {
            assert_eq!(rollup_status(&statuses(wire)), TaskStatus::Failed);
        }
    }

    #[test]
    fn rollup_unrecognized_status_falls_back_to_queued() {
        assert_eq!(
            rollup_status(&statuses(&["succeeded", "paused"])),
            TaskStatus::Queued
        );
    }
}
