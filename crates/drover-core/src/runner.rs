//! The `Runner` boundary -- how the worker invokes an agent.
//!
//! The core does not interpret routing semantics; it hands the subtask to
//! an opaque command and observes the exit code and output. The trait is
//! object-safe so tests can substitute a scripted stub for the shell.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::worktree::sanitize_path;

/// How much of the merged output is handed to the classifier.
pub const DEFAULT_TAIL_BYTES: usize = 20 * 1024;

/// What the worker passes to a runner for one attempt.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub task_id: String,
    pub routing: Option<String>,
    pub prompt: Option<String>,
    /// Attempt ordinal (1-based; the claim has already incremented it).
    pub attempt: i64,
}

/// What a runner reports back.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Exit code; `None` when the process was killed by a signal.
    pub rc: Option<i32>,
    /// Bounded tail of the merged stdout+stderr.
    pub tail: String,
    /// Full merged output on disk, named for the attempt.
    pub log_path: PathBuf,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.rc == Some(0)
    }
}

/// Adapter interface for executing a subtask.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Execute one attempt and report its outcome.
    ///
    /// Must not raise for agent-side failures -- a non-zero exit is an
    /// outcome, not an error. Errors are reserved for the runner itself
    /// being unable to start or record the attempt.
    async fn run(&self, request: &RunRequest) -> Result<RunOutcome>;
}

// Compile-time assertion: Runner must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Runner) {}
};

/// Runs a shell command template under `sh -c`.
///
/// The template carries named placeholders `{task_id}`, `{routing}`,
/// `{prompt}`, and `{db_path}`; missing fields expand to the empty string.
/// Merged stdout+stderr is written to
/// `<log_dir>/<task id>.attempt<n>.log` and the last
/// [`DEFAULT_TAIL_BYTES`] are returned for classification.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    template: String,
    db_path: String,
    log_dir: PathBuf,
}

impl ShellRunner {
    pub fn new(
        template: impl Into<String>,
        db_path: impl Into<String>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            template: template.into(),
            db_path: db_path.into(),
            log_dir: log_dir.into(),
        }
    }

    /// Expand the command template for one request.
    fn expand(&self, request: &RunRequest) -> String {
        self.template
            .replace("{task_id}", &request.task_id)
            .replace("{routing}", request.routing.as_deref().unwrap_or(""))
            .replace("{prompt}", request.prompt.as_deref().unwrap_or(""))
            .replace("{db_path}", &self.db_path)
    }

    fn log_path(&self, request: &RunRequest) -> PathBuf {
        self.log_dir.join(format!(
            "{}.attempt{}.log",
            sanitize_path(&request.task_id),
            request.attempt
        ))
    }
}

#[async_trait]
impl Runner for ShellRunner {
    async fn run(&self, request: &RunRequest) -> Result<RunOutcome> {
        tokio::fs::create_dir_all(&self.log_dir)
            .await
            .with_context(|| {
                format!("failed to create log directory {}", self.log_dir.display())
            })?;

        let command = self.expand(request);
        tracing::debug!(task_id = %request.task_id, attempt = request.attempt, "invoking runner");

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .await
            .with_context(|| format!("failed to spawn runner for task {}", request.task_id))?;

        let mut merged = output.stdout;
        if !merged.is_empty() && !output.stderr.is_empty() {
            merged.push(b'\n');
        }
        merged.extend_from_slice(&output.stderr);

        let log_path = self.log_path(request);
        tokio::fs::write(&log_path, &merged)
            .await
            .with_context(|| format!("failed to write runner log {}", log_path.display()))?;

        let tail_start = merged.len().saturating_sub(DEFAULT_TAIL_BYTES);
        let tail = String::from_utf8_lossy(&merged[tail_start..]).into_owned();

        Ok(RunOutcome {
            rc: output.status.code(),
            tail,
            log_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(task_id: &str, attempt: i64) -> RunRequest {
        RunRequest {
            task_id: task_id.to_owned(),
            routing: Some("codex-backend".to_owned()),
            prompt: Some("do the thing".to_owned()),
            attempt,
        }
    }

    #[test]
    fn expands_all_placeholders() {
        let runner = ShellRunner::new(
            "agent --task {task_id} --route {routing} --db {db_path} -- {prompt}",
            "/tmp/orch.db",
            "/tmp/logs",
        );
        let cmd = runner.expand(&request("t1", 1));
        assert_eq!(
            cmd,
            "agent --task t1 --route codex-backend --db /tmp/orch.db -- do the thing"
        );
    }

    #[test]
    fn missing_fields_expand_empty() {
        let runner = ShellRunner::new("x{routing}y{prompt}z", "db", "logs");
        let mut req = request("t1", 1);
        req.routing = None;
        req.prompt = None;
        assert_eq!(runner.expand(&req), "xyz");
    }

    #[test]
    fn log_path_encodes_attempt() {
        let runner = ShellRunner::new("true", "db", "/var/log/drover");
        assert_eq!(
            runner.log_path(&request("t1", 2)),
            PathBuf::from("/var/log/drover/t1.attempt2.log")
        );
    }

    #[tokio::test]
    async fn captures_exit_code_and_merged_output() {
        let logs = TempDir::new().expect("temp dir");
        let runner = ShellRunner::new(
            "echo out-line; echo err-line >&2; exit 7",
            "db",
            logs.path(),
        );

        let outcome = runner.run(&request("t1", 1)).await.expect("run should work");
        assert_eq!(outcome.rc, Some(7));
        assert!(!outcome.success());
        assert!(outcome.tail.contains("out-line"));
        assert!(outcome.tail.contains("err-line"));

        let on_disk = std::fs::read_to_string(&outcome.log_path).expect("log file");
        assert_eq!(on_disk, "out-line\nerr-line\n");
    }

    #[tokio::test]
    async fn zero_exit_is_success() {
        let logs = TempDir::new().expect("temp dir");
        let runner = ShellRunner::new("echo done for {task_id}", "db", logs.path());
        let outcome = runner.run(&request("t1", 1)).await.expect("run should work");
        assert_eq!(outcome.rc, Some(0));
        assert!(outcome.success());
        assert!(outcome.tail.contains("done for t1"));
    }

    #[tokio::test]
    async fn tail_is_bounded_but_log_is_complete() {
        let logs = TempDir::new().expect("temp dir");
        let runner = ShellRunner::new(
            "head -c 30000 /dev/zero | tr '\\0' 'a'",
            "db",
            logs.path(),
        );

        let outcome = runner.run(&request("big", 1)).await.expect("run should work");
        assert_eq!(outcome.tail.len(), DEFAULT_TAIL_BYTES);
        let on_disk = std::fs::metadata(&outcome.log_path).expect("log file");
        assert_eq!(on_disk.len(), 30_000);
    }
}
