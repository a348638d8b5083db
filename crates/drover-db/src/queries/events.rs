//! Database query functions for the append-only `events` table.

use anyhow::{Context, Result};
use sqlx::{Executor, Sqlite};

use crate::models::{Event, EventLevel};

/// Parameters for appending a new event row.
#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    pub task_id: &'a str,
    pub ts: i64,
    pub level: EventLevel,
    pub message: &'a str,
    /// Optional JSON payload; serialized to text on insert.
    pub data: Option<&'a serde_json::Value>,
}

/// Append an event. Events are never updated or deleted by the core.
pub async fn insert_event<'e, E>(ex: E, new: &NewEvent<'_>) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let data = match new.data {
        Some(value) => Some(
            serde_json::to_string(value)
                .context("failed to serialize event data")?,
        ),
        None => None,
    };

    sqlx::query(
        "INSERT INTO events (task_id, ts, level, message, data) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(new.task_id)
    .bind(new.ts)
    .bind(new.level.as_str())
    .bind(new.message)
    .bind(data)
    .execute(ex)
    .await
    .with_context(|| {
        format!(
            "failed to insert event for task {}: {}",
            new.task_id, new.message
        )
    })?;

    Ok(())
}

/// All events for a task, oldest first.
pub async fn list_events_for_task<'e, E>(ex: E, task_id: &str) -> Result<Vec<Event>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let events = sqlx::query_as::<_, Event>(
        "SELECT * FROM events WHERE task_id = ? ORDER BY id ASC",
    )
    .bind(task_id)
    .fetch_all(ex)
    .await
    .with_context(|| format!("failed to list events for task {task_id}"))?;

    Ok(events)
}

/// Count events across the whole store.
pub async fn count_events<'e, E>(ex: E) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
        .fetch_one(ex)
        .await
        .context("failed to count events")?;

    Ok(row.0)
}
