//! The single-claim worker loop.
//!
//! One worker per process: reconcile, claim one runnable subtask under an
//! immediate transaction, hand it to the [`Runner`], record the outcome,
//! and consult the retry gate. Several processes may share a store; the
//! claim's `status = 'queued'` guard under the write lock guarantees a
//! subtask is claimed at most once per attempt.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use drover_db::models::{EventLevel, FailureKind, Task};
use drover_db::now_ts;
use drover_db::pool::ImmediateTx;
use drover_db::queries::events::{self, NewEvent};
use drover_db::queries::tasks;

use crate::failure::classify_failure;
use crate::queue;
use crate::retry::decide_retry;
use crate::runner::{RunRequest, Runner};
use crate::worktree;

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Idle sleep between polls when nothing is runnable.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// What one iteration of the loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A subtask was claimed and its outcome recorded.
    Ran { task_id: String },
    /// The hinted subtask was claimed by someone else first.
    Lost,
    /// Nothing runnable.
    Idle,
}

/// Attempt counters captured at claim time.
#[derive(Debug, Clone, Copy)]
struct Claim {
    attempt: i64,
    max_attempts: i64,
}

/// A single-claim worker bound to a store and a runner.
pub struct Worker {
    pool: SqlitePool,
    runner: Arc<dyn Runner>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(pool: SqlitePool, runner: Arc<dyn Runner>, config: WorkerConfig) -> Self {
        Self {
            pool,
            runner,
            config,
        }
    }

    /// Run until cancelled.
    ///
    /// Cancellation is cooperative: the current iteration finishes its
    /// recording before the loop exits, so a claimed subtask is never left
    /// `running` by a graceful stop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("worker started");
        while !cancel.is_cancelled() {
            match self.step().await? {
                StepOutcome::Ran { .. } => {}
                StepOutcome::Lost => {
                    // Another worker won the same hint row. Back off with
                    // jitter so two workers stop thrashing on one row.
                    let backoff =
                        Duration::from_millis(rand::rng().random_range(50..250));
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                StepOutcome::Idle => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        }
        info!("worker stopped");
        Ok(())
    }

    /// One loop iteration: reconcile, claim, run, record, reconcile.
    pub async fn step(&self) -> Result<StepOutcome> {
        queue::refresh_blocked_and_plans(&self.pool).await?;

        let Some(task) = queue::next_runnable(&self.pool).await? else {
            return Ok(StepOutcome::Idle);
        };

        let Some(claim) = self.claim(&task).await? else {
            return Ok(StepOutcome::Lost);
        };

        // Worktree setup never fails the claim; the runner falls back to
        // whatever workdir the task row offers. A configured path is only
        // passed through when the binding is caller-supplied: the task's
        // own managed binding is re-derived from the task id, so a retry
        // does not record it as caller-supplied (which would demote it to
        // unmanaged and strand the directory at terminal cleanup).
        let configured_worktree = if task.worktree_managed {
            None
        } else {
            task.worktree_path.as_deref()
        };
        if let Err(e) = worktree::ensure_task_worktree(
            &self.pool,
            &task.id,
            task.repo_path.as_deref(),
            configured_worktree,
        )
        .await
        {
            warn!(task_id = %task.id, error = %e, "worktree setup failed");
            self.append_event(
                &task.id,
                EventLevel::Warn,
                &format!("worktree setup failed: {e:#}"),
            )
            .await?;
        }

        let request = RunRequest {
            task_id: task.id.clone(),
            routing: task.routing.clone(),
            prompt: task.prompt.clone(),
            attempt: claim.attempt,
        };

        match self.runner.run(&request).await {
            Ok(outcome) if outcome.success() => {
                // The worktree is kept: the review/commit/PR flow needs it.
                self.record_success(&task.id).await?;
            }
            Ok(outcome) => {
                let classification = classify_failure(&outcome.tail, outcome.rc);
                let detail = format!(
                    "{}; log={}",
                    classification.detail,
                    outcome.log_path.display()
                );
                // The gate also sees the output tail, so an infrastructure
                // signal in the runner's own output (connection reset, rate
                // limit) can rescue a test/ci failure.
                let gate_detail = format!("{detail} {}", outcome.tail);
                self.record_failure(&task, claim, &classification.kind, &detail, &gate_detail)
                    .await?;
            }
            Err(e) => {
                // A runner that cannot start is recorded like any other
                // failure; the loop never aborts on agent-side errors.
                let detail = format!("runner error: {e:#}");
                self.record_failure(&task, claim, &FailureKind::Agent, &detail, &detail)
                    .await?;
            }
        }

        queue::refresh_blocked_and_plans(&self.pool).await?;
        Ok(StepOutcome::Ran { task_id: task.id })
    }

    /// Claim transaction: flip queued -> running, bump `attempt`, log.
    ///
    /// Returns `None` when the row was no longer queued (lost race).
    async fn claim(&self, task: &Task) -> Result<Option<Claim>> {
        let now = now_ts();
        let mut tx = ImmediateTx::begin(&self.pool).await?;

        let rows = tasks::claim_for_run(tx.conn(), &task.id, now).await?;
        if rows == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let claimed = tasks::get_task(tx.conn(), &task.id)
            .await?
            .context("claimed task disappeared mid-transaction")?;
        let message = format!(
            "claimed for run (attempt {}/{})",
            claimed.attempt, claimed.max_attempts
        );
        events::insert_event(
            tx.conn(),
            &NewEvent {
                task_id: &task.id,
                ts: now,
                level: EventLevel::Info,
                message: &message,
                data: None,
            },
        )
        .await?;

        tx.commit().await?;
        info!(task_id = %task.id, attempt = claimed.attempt, "claimed subtask");
        Ok(Some(Claim {
            attempt: claimed.attempt,
            max_attempts: claimed.max_attempts,
        }))
    }

    async fn record_success(&self, task_id: &str) -> Result<()> {
        let now = now_ts();
        let mut tx = ImmediateTx::begin(&self.pool).await?;
        tasks::mark_succeeded(tx.conn(), task_id, now).await?;
        events::insert_event(
            tx.conn(),
            &NewEvent {
                task_id,
                ts: now,
                level: EventLevel::Info,
                message: "succeeded",
                data: None,
            },
        )
        .await?;
        tx.commit().await?;
        info!(task_id, "subtask succeeded");
        Ok(())
    }

    /// Record a failed attempt, then apply the retry gate.
    ///
    /// `detail` is what lands on the row; `gate_detail` is what the retry
    /// policy inspects (detail plus the bounded output tail).
    async fn record_failure(
        &self,
        task: &Task,
        claim: Claim,
        kind: &FailureKind,
        detail: &str,
        gate_detail: &str,
    ) -> Result<()> {
        let now = now_ts();
        let mut tx = ImmediateTx::begin(&self.pool).await?;
        tasks::mark_failed(tx.conn(), &task.id, kind, detail, now).await?;
        let message = format!("failed: {kind} ({detail})");
        events::insert_event(
            tx.conn(),
            &NewEvent {
                task_id: &task.id,
                ts: now,
                level: EventLevel::Error,
                message: &message,
                data: None,
            },
        )
        .await?;
        tx.commit().await?;
        error!(task_id = %task.id, kind = %kind, "subtask failed");

        let decision = decide_retry(
            Some(kind.as_str()),
            Some(gate_detail),
            claim.attempt,
            claim.max_attempts,
        );

        if decision.should_retry {
            let now = now_ts();
            let mut tx = ImmediateTx::begin(&self.pool).await?;
            tasks::requeue(tx.conn(), &task.id, now).await?;
            let message = format!("retry allowed: {}", decision.reason);
            events::insert_event(
                tx.conn(),
                &NewEvent {
                    task_id: &task.id,
                    ts: now,
                    level: EventLevel::Warn,
                    message: &message,
                    data: None,
                },
            )
            .await?;
            tx.commit().await?;
            warn!(task_id = %task.id, reason = %decision.reason, "retry allowed");
            // The worktree is retained for the retry.
        } else {
            self.append_event(
                &task.id,
                EventLevel::Warn,
                &format!("no retry: {}", decision.reason),
            )
            .await?;
            warn!(task_id = %task.id, reason = %decision.reason, "no retry");
            if let Err(e) = worktree::cleanup_task_worktree(&self.pool, &task.id).await {
                warn!(task_id = %task.id, error = %e, "worktree cleanup failed");
            }
        }

        Ok(())
    }

    async fn append_event(
        &self,
        task_id: &str,
        level: EventLevel,
        message: &str,
    ) -> Result<()> {
        events::insert_event(
            &self.pool,
            &NewEvent {
                task_id,
                ts: now_ts(),
                level,
                message,
                data: None,
            },
        )
        .await
    }
}
