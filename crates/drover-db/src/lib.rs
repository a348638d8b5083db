//! Durable store for the drover orchestrator.
//!
//! A single SQLite file holds every task, dependency edge, and event. All
//! multi-row writes go through an immediate-mode transaction
//! ([`pool::ImmediateTx`]) so the write lock is taken at BEGIN and two
//! processes can never interleave a read-modify-write.

pub mod config;
pub mod migrate;
pub mod models;
pub mod pool;
pub mod queries;

/// Current time as integer seconds since the Unix epoch.
///
/// Every `created_at`, `updated_at`, and event `ts` comes from here; the
/// store never relies on sub-second ordering.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
