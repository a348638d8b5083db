//! Versioned, idempotent schema migration.
//!
//! The `meta` table records `schema_version`. Stages are additive (no
//! destructive change) and each carries its own backfill; column additions
//! are guarded by a `PRAGMA table_info` probe so a stage can be re-run
//! against a database that already has it. The whole upgrade runs inside
//! one immediate transaction.

use anyhow::{Context, Result};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;

use crate::pool::ImmediateTx;

/// Schema version produced by a full migration.
pub const SCHEMA_VERSION: i64 = 3;

/// Bring the store up to [`SCHEMA_VERSION`]. Safe to call on every open.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    let mut tx = ImmediateTx::begin(pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS meta (
           key TEXT PRIMARY KEY,
           value TEXT NOT NULL
         )",
    )
    .execute(tx.conn())
    .await
    .context("failed to create meta table")?;

    let current = schema_version(tx.conn()).await?;
    if current >= SCHEMA_VERSION {
        tx.commit().await?;
        return Ok(());
    }

    if current < 1 {
        stage_1(tx.conn()).await.context("migration stage 1 failed")?;
    }
    if current < 2 {
        stage_2(tx.conn()).await.context("migration stage 2 failed")?;
    }
    if current < 3 {
        stage_3(tx.conn()).await.context("migration stage 3 failed")?;
    }

    sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?)")
        .bind(SCHEMA_VERSION.to_string())
        .execute(tx.conn())
        .await
        .context("failed to record schema version")?;

    tx.commit().await?;
    info!(from = current, to = SCHEMA_VERSION, "schema migrated");
    Ok(())
}

/// Read the recorded schema version; 0 on a fresh database.
pub async fn schema_version(conn: &mut SqliteConnection) -> Result<i64> {
    let row = sqlx::query("SELECT value FROM meta WHERE key = 'schema_version'")
        .fetch_optional(&mut *conn)
        .await
        .context("failed to read schema version")?;
    match row {
        Some(row) => {
            let value: String = row.try_get("value")?;
            value
                .parse::<i64>()
                .with_context(|| format!("corrupt schema_version value: {value:?}"))
        }
        None => Ok(0),
    }
}

/// Stage 1: the core tables.
async fn stage_1(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tasks (
           id TEXT PRIMARY KEY,
           kind TEXT NOT NULL,
           title TEXT,
           routing TEXT,
           prompt TEXT,
           repo TEXT,
           repo_path TEXT,
           worktree_path TEXT,
           status TEXT NOT NULL,
           blocked_reason TEXT,
           failure_kind TEXT,
           failure_detail TEXT,
           attempt INTEGER NOT NULL DEFAULT 0,
           max_attempts INTEGER NOT NULL DEFAULT 3,
           idempotency_key TEXT,
           created_at INTEGER NOT NULL,
           updated_at INTEGER NOT NULL
         )",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_idempotency
           ON tasks (idempotency_key)
           WHERE idempotency_key IS NOT NULL",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS deps (
           task_id TEXT NOT NULL,
           depends_on TEXT NOT NULL,
           PRIMARY KEY (task_id, depends_on),
           FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE,
           FOREIGN KEY (depends_on) REFERENCES tasks(id) ON DELETE CASCADE
         )",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS events (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           task_id TEXT NOT NULL,
           ts INTEGER NOT NULL,
           level TEXT NOT NULL,
           message TEXT NOT NULL,
           data TEXT,
           FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
         )",
    )
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Stage 2: `plan_id`, backfilled so plan rows point at themselves.
async fn stage_2(conn: &mut SqliteConnection) -> Result<()> {
    add_task_column(conn, "plan_id", "TEXT").await?;
    sqlx::query(
        "UPDATE tasks SET plan_id = id
         WHERE kind = 'plan' AND (plan_id IS NULL OR plan_id = '')",
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Stage 3: worktree bookkeeping and PR/CI columns for the monitor.
async fn stage_3(conn: &mut SqliteConnection) -> Result<()> {
    add_task_column(conn, "worktree_managed", "INTEGER NOT NULL DEFAULT 0").await?;
    add_task_column(conn, "worktree_branch", "TEXT").await?;
    add_task_column(conn, "pr_number", "INTEGER").await?;
    add_task_column(conn, "pr_url", "TEXT").await?;
    add_task_column(conn, "ci_state", "TEXT").await?;
    add_task_column(conn, "ci_detail", "TEXT").await?;
    add_task_column(conn, "ci_url", "TEXT").await?;
    Ok(())
}

/// `ALTER TABLE tasks ADD COLUMN`, skipped when the column already exists.
async fn add_task_column(
    conn: &mut SqliteConnection,
    name: &str,
    definition: &str,
) -> Result<()> {
    if task_columns(conn).await?.iter().any(|c| c == name) {
        return Ok(());
    }
    let stmt = format!("ALTER TABLE tasks ADD COLUMN {name} {definition}");
    sqlx::query(&stmt)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("failed to add tasks.{name}"))?;
    Ok(())
}

/// Column names of the `tasks` table.
pub async fn task_columns(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    let rows = sqlx::query("PRAGMA table_info(tasks)")
        .fetch_all(&mut *conn)
        .await
        .context("failed to inspect tasks table")?;
    let mut names = Vec::with_capacity(rows.len());
    for row in &rows {
        names.push(row.try_get::<String, _>("name")?);
    }
    Ok(names)
}
