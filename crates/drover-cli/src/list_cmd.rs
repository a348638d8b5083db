//! The `drover list` command: operator view of the task table.

use anyhow::Result;
use sqlx::SqlitePool;

use drover_db::queries::tasks;

/// Print tasks as tab-separated rows, most recently updated first.
pub async fn run_list(pool: &SqlitePool, status: Option<&str>, limit: i64) -> Result<()> {
    let tasks = tasks::list_tasks(pool, status, limit).await?;

    for task in &tasks {
        println!(
            "{}\t{}\t{}\t{}\t{}/{}\t{}",
            task.id,
            task.kind,
            task.routing.as_deref().unwrap_or(""),
            task.status,
            task.attempt,
            task.max_attempts,
            task.updated_at,
        );
    }

    Ok(())
}
