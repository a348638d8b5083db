//! Core subsystems of the drover orchestrator.
//!
//! A plan (a DAG of subtasks) is validated and enqueued atomically; a
//! single-claim worker loop executes runnable subtasks through an opaque
//! [`runner::Runner`], classifies failures, and gates retries; coding work
//! is isolated in per-task git worktrees; an out-of-band monitor attaches
//! PR and CI state discovered from the hosting provider. All state lives
//! in the `drover-db` store -- there is no in-memory event bus.

pub mod failure;
pub mod monitor;
pub mod plan;
pub mod queue;
pub mod retry;
pub mod runner;
pub mod worker;
pub mod worktree;
