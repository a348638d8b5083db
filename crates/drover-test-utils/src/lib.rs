//! Shared test utilities for drover integration tests.
//!
//! The store is an embedded SQLite file, so each test gets a fully migrated
//! pool on its own scratch directory. Hold the returned [`TempDir`] for the
//! test's lifetime -- dropping it deletes the database file.

use std::path::PathBuf;
use std::process::Command;

use sqlx::SqlitePool;
use tempfile::TempDir;

use drover_db::config::StoreConfig;
use drover_db::{migrate, pool};

/// Create a migrated store on a scratch directory.
///
/// Returns `(pool, dir)`; keep `dir` alive for as long as the pool is used.
pub async fn open_test_store() -> (SqlitePool, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = StoreConfig::new(dir.path().join("drover.db"));
    let pool = pool::connect(&config)
        .await
        .expect("failed to open test store");
    migrate::migrate(&pool)
        .await
        .expect("failed to migrate test store");
    (pool, dir)
}

/// Create a scratch git repository with one commit.
///
/// Returns the TempDir (must be held alive) and the repo path. Used by
/// worktree and monitor tests that need a real repository to operate on.
pub fn create_temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    run_git(&repo_path, &["init"]);
    run_git(&repo_path, &["config", "user.email", "test@drover.dev"]);
    run_git(&repo_path, &["config", "user.name", "Drover Test"]);

    std::fs::write(repo_path.join("README.md"), "# Test repo\n")
        .expect("failed to write README");
    run_git(&repo_path, &["add", "."]);
    run_git(&repo_path, &["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

/// Run a git command in a directory, panicking on failure.
pub fn run_git(dir: &std::path::Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed to spawn: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}
