//! The `drover log` command: per-task event history.

use anyhow::Result;
use sqlx::SqlitePool;

use drover_db::queries::events;

/// Print a task's events, oldest first.
pub async fn run_log(pool: &SqlitePool, task_id: &str) -> Result<()> {
    let events = events::list_events_for_task(pool, task_id).await?;

    if events.is_empty() {
        println!("no events for task {task_id}");
        return Ok(());
    }

    for event in &events {
        match &event.data {
            Some(data) => {
                println!("{}  [{}] {}  {}", event.ts, event.level, event.message, data)
            }
            None => println!("{}  [{}] {}", event.ts, event.level, event.message),
        }
    }

    Ok(())
}
