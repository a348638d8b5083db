//! Database query functions for the `deps` table.

use anyhow::{Context, Result};
use sqlx::{Executor, Row, Sqlite};

/// Insert a dependency edge: `task_id` depends on `depends_on`.
///
/// Uses `ON CONFLICT DO NOTHING` so this is idempotent.
pub async fn insert_dep<'e, E>(ex: E, task_id: &str, depends_on: &str) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO deps (task_id, depends_on) VALUES (?, ?) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_id)
    .bind(depends_on)
    .execute(ex)
    .await
    .with_context(|| format!("failed to insert dependency {task_id} -> {depends_on}"))?;

    Ok(())
}

/// Ids of all tasks that a given task depends on.
pub async fn deps_for_task<'e, E>(ex: E, task_id: &str) -> Result<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT depends_on FROM deps WHERE task_id = ?")
        .bind(task_id)
        .fetch_all(ex)
        .await
        .with_context(|| format!("failed to get dependencies of {task_id}"))?;

    let mut ids = Vec::with_capacity(rows.len());
    for row in &rows {
        ids.push(row.try_get::<String, _>("depends_on")?);
    }
    Ok(ids)
}

/// Count dependency edges across the whole store.
pub async fn count_deps<'e, E>(ex: E) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM deps")
        .fetch_one(ex)
        .await
        .context("failed to count dependency edges")?;

    Ok(row.0)
}
