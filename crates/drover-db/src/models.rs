use std::fmt;
use std::str::FromStr;

use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Discriminator for the single `tasks` row type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// The aggregate a caller submits; never executed directly.
    Plan,
    /// The unit of scheduling and execution.
    Subtask,
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Plan => "plan",
            Self::Subtask => "subtask",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = TaskKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "subtask" => Ok(Self::Subtask),
            other => Err(TaskKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskKind`] string.
#[derive(Debug, Clone)]
pub struct TaskKindParseError(pub String);

impl fmt::Display for TaskKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task kind: {:?}", self.0)
    }
}

impl std::error::Error for TaskKindParseError {}

// ---------------------------------------------------------------------------

/// Status of a task row.
///
/// The string column in the store is the stable wire value. An on-disk value
/// this build does not know is preserved in [`TaskStatus::Other`] rather
/// than failing decode -- forensics over crashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Blocked,
    Canceled,
    /// An unrecognized on-disk value, preserved verbatim.
    Other(String),
}

impl TaskStatus {
    /// Decode a wire value. Total: unknown strings become [`Self::Other`].
    pub fn from_wire(s: &str) -> Self {
        match s {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "blocked" => Self::Blocked,
            "canceled" => Self::Canceled,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Canceled => "canceled",
            Self::Other(s) => s,
        }
    }

    /// Terminal without success: the states that block dependants.
    pub fn is_terminal_non_success(&self) -> bool {
        matches!(self, Self::Failed | Self::Blocked | Self::Canceled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------

/// Classified failure category for a failed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    Lint,
    Test,
    Build,
    Ci,
    Agent,
    Unknown,
    /// An unrecognized on-disk value (e.g. externally injected `format`
    /// or `type`), preserved verbatim.
    Other(String),
}

impl FailureKind {
    /// Decode a wire value. Total: unknown strings become [`Self::Other`].
    pub fn from_wire(s: &str) -> Self {
        match s {
            "lint" => Self::Lint,
            "test" => Self::Test,
            "build" => Self::Build,
            "ci" => Self::Ci,
            "agent" => Self::Agent,
            "unknown" => Self::Unknown,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Lint => "lint",
            Self::Test => "test",
            Self::Build => "build",
            Self::Ci => "ci",
            Self::Agent => "agent",
            Self::Unknown => "unknown",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------

/// Aggregate CI state derived by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiState {
    Passed,
    Failed,
    Pending,
    Unknown,
}

impl CiState {
    /// Decode a wire value. Anything unrecognized collapses to
    /// [`Self::Unknown`]; the monitor only ever writes the four values.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "passed" => Self::Passed,
            "failed" => Self::Failed,
            "pending" => Self::Pending,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Pending => "pending",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------

/// Severity of an event-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventLevel {
    type Err = EventLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(EventLevelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EventLevel`] string.
#[derive(Debug, Clone)]
pub struct EventLevelParseError(pub String);

impl fmt::Display for EventLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event level: {:?}", self.0)
    }
}

impl std::error::Error for EventLevelParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A row of the `tasks` table: either a plan or one of its subtasks.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    /// Owning plan id for subtasks; equal to `id` for plan rows.
    pub plan_id: Option<String>,
    pub title: Option<String>,
    pub routing: Option<String>,
    pub prompt: Option<String>,
    pub repo: Option<String>,
    pub repo_path: Option<String>,
    pub worktree_path: Option<String>,
    pub status: TaskStatus,
    pub blocked_reason: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub failure_detail: Option<String>,
    pub attempt: i64,
    pub max_attempts: i64,
    pub idempotency_key: Option<String>,
    /// True when the worktree was created by drover under the repo's
    /// `.orchestrator/worktrees/` area and is eligible for cleanup.
    pub worktree_managed: bool,
    pub worktree_branch: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    pub ci_state: Option<CiState>,
    pub ci_detail: Option<String>,
    pub ci_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<'r> FromRow<'r, SqliteRow> for Task {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        let kind = kind.parse::<TaskKind>().map_err(|e| sqlx::Error::ColumnDecode {
            index: "kind".into(),
            source: Box::new(e),
        })?;
        let status: String = row.try_get("status")?;
        let failure_kind: Option<String> = row.try_get("failure_kind")?;
        let ci_state: Option<String> = row.try_get("ci_state")?;

        Ok(Self {
            id: row.try_get("id")?,
            kind,
            plan_id: row.try_get("plan_id")?,
            title: row.try_get("title")?,
            routing: row.try_get("routing")?,
            prompt: row.try_get("prompt")?,
            repo: row.try_get("repo")?,
            repo_path: row.try_get("repo_path")?,
            worktree_path: row.try_get("worktree_path")?,
            status: TaskStatus::from_wire(&status),
            blocked_reason: row.try_get("blocked_reason")?,
            failure_kind: failure_kind.as_deref().map(FailureKind::from_wire),
            failure_detail: row.try_get("failure_detail")?,
            attempt: row.try_get("attempt")?,
            max_attempts: row.try_get("max_attempts")?,
            idempotency_key: row.try_get("idempotency_key")?,
            worktree_managed: row.try_get("worktree_managed")?,
            worktree_branch: row.try_get("worktree_branch")?,
            pr_number: row.try_get("pr_number")?,
            pr_url: row.try_get("pr_url")?,
            ci_state: ci_state.as_deref().map(CiState::from_wire),
            ci_detail: row.try_get("ci_detail")?,
            ci_url: row.try_get("ci_url")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// An edge in the subtask dependency DAG: `task_id` depends on `depends_on`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dep {
    pub task_id: String,
    pub depends_on: String,
}

impl<'r> FromRow<'r, SqliteRow> for Dep {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            task_id: row.try_get("task_id")?,
            depends_on: row.try_get("depends_on")?,
        })
    }
}

/// An entry of the append-only per-task event log.
///
/// Events are the authoritative history; the task row is a view of the
/// latest state.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    pub task_id: String,
    pub ts: i64,
    pub level: EventLevel,
    pub message: String,
    /// Optional JSON payload, stored as text.
    pub data: Option<String>,
}

impl<'r> FromRow<'r, SqliteRow> for Event {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let level: String = row.try_get("level")?;
        let level = level
            .parse::<EventLevel>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "level".into(),
                source: Box::new(e),
            })?;
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            ts: row.try_get("ts")?,
            level,
            message: row.try_get("message")?,
            data: row.try_get("data")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_wire_roundtrip() {
        let variants = [
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
            TaskStatus::Blocked,
            TaskStatus::Canceled,
        ];
        for v in &variants {
            let s = v.as_str().to_owned();
            assert_eq!(*v, TaskStatus::from_wire(&s));
        }
    }

    #[test]
    fn task_status_preserves_unknown_wire_value() {
        let status = TaskStatus::from_wire("paused");
        assert_eq!(status, TaskStatus::Other("paused".to_owned()));
        assert_eq!(status.as_str(), "paused");
    }

    #[test]
    fn terminal_non_success_states() {
        assert!(TaskStatus::Failed.is_terminal_non_success());
        assert!(TaskStatus::Blocked.is_terminal_non_success());
        assert!(TaskStatus::Canceled.is_terminal_non_success());
        assert!(!TaskStatus::Queued.is_terminal_non_success());
        assert!(!TaskStatus::Running.is_terminal_non_success());
        assert!(!TaskStatus::Succeeded.is_terminal_non_success());
    }

    #[test]
    fn failure_kind_wire_roundtrip() {
        let variants = [
            FailureKind::Lint,
            FailureKind::Test,
            FailureKind::Build,
            FailureKind::Ci,
            FailureKind::Agent,
            FailureKind::Unknown,
        ];
        for v in &variants {
            let s = v.as_str().to_owned();
            assert_eq!(*v, FailureKind::from_wire(&s));
        }
    }

    #[test]
    fn failure_kind_preserves_injected_value() {
        // The retry policy understands kinds the classifier never emits.
        let kind = FailureKind::from_wire("format");
        assert_eq!(kind.as_str(), "format");
    }

    #[test]
    fn task_kind_display_roundtrip() {
        for v in [TaskKind::Plan, TaskKind::Subtask] {
            let parsed: TaskKind = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn task_kind_invalid() {
        assert!("megaplan".parse::<TaskKind>().is_err());
    }

    #[test]
    fn event_level_display_roundtrip() {
        for v in [EventLevel::Info, EventLevel::Warn, EventLevel::Error] {
            let parsed: EventLevel = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn ci_state_collapses_unknown() {
        assert_eq!(CiState::from_wire("passed"), CiState::Passed);
        assert_eq!(CiState::from_wire("weird"), CiState::Unknown);
    }
}
