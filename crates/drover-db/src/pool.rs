use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

use crate::config::StoreConfig;

/// Open the store, creating the database file (and its parent directory) if
/// missing.
///
/// The connection options match what the single-writer model needs: WAL
/// journaling so readers never block the writer, `synchronous=NORMAL`,
/// foreign keys ON (the deps and events tables cascade on task delete), and
/// a busy timeout so a contended `BEGIN IMMEDIATE` waits instead of failing
/// instantly.
pub async fn connect(config: &StoreConfig) -> Result<SqlitePool> {
    if let Some(dir) = config.path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir).with_context(|| {
                format!("failed to create database directory {}", dir.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(&config.path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| {
            format!("failed to open database at {}", config.path.display())
        })?;

    Ok(pool)
}

/// A write transaction that holds the store-level write lock from BEGIN.
///
/// SQLite's default deferred transactions only take the write lock at the
/// first write, which opens a read-to-write upgrade race between two
/// processes. `BEGIN IMMEDIATE` takes the lock up front, so a claim's
/// re-read of a row is already serialized against every other writer.
///
/// The transaction must be finished explicitly with [`Self::commit`] or
/// [`Self::rollback`]. If the guard is dropped while still open, the
/// underlying connection is detached from the pool and closed -- closing
/// rolls the transaction back, and a connection with a dangling transaction
/// is never handed back out.
pub struct ImmediateTx {
    conn: Option<PoolConnection<Sqlite>>,
}

impl ImmediateTx {
    /// Acquire a connection and issue `BEGIN IMMEDIATE`.
    ///
    /// Blocks (up to the busy timeout) if another process holds the write
    /// lock.
    pub async fn begin(pool: &SqlitePool) -> Result<Self> {
        let mut conn = pool
            .acquire()
            .await
            .context("failed to acquire connection for write transaction")?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .context("failed to begin immediate transaction")?;
        Ok(Self { conn: Some(conn) })
    }

    /// Executor for statements inside this transaction.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        let conn = self
            .conn
            .as_mut()
            .expect("immediate transaction already finished");
        &mut **conn
    }

    /// Commit the transaction and return the connection to the pool.
    pub async fn commit(mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
                drop(conn.detach());
                return Err(e).context("failed to commit immediate transaction");
            }
        }
        Ok(())
    }

    /// Roll the transaction back and return the connection to the pool.
    pub async fn rollback(mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                drop(conn.detach());
                return Err(e).context("failed to roll back immediate transaction");
            }
        }
        Ok(())
    }
}

impl Drop for ImmediateTx {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!("immediate transaction dropped without commit or rollback");
            drop(conn.detach());
        }
    }
}
