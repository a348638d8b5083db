//! Query functions grouped per table.
//!
//! Every function is generic over [`sqlx::Executor`] so the same query
//! serves plain pool reads and writes inside an
//! [`crate::pool::ImmediateTx`].

pub mod deps;
pub mod events;
pub mod tasks;
