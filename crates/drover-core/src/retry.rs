//! The retry-policy gate.
//!
//! A deterministic, I/O-free decision over the persisted failure fields.
//! The policy prefers rerunning flaky infrastructure once and allowing
//! agent-driven fix-and-retry for the fixable categories; test and CI
//! failures without an infrastructure signal stay down for a human gate.
//!
//! The kind is consumed as the stored wire string so that externally
//! injected kinds (`format`, `type`) gate the same way as classifier
//! output.

/// Outcome of the retry gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub reason: String,
}

impl RetryDecision {
    fn yes(reason: impl Into<String>) -> Self {
        Self {
            should_retry: true,
            reason: reason.into(),
        }
    }

    fn no(reason: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            reason: reason.into(),
        }
    }
}

/// Decide whether a failed subtask re-enters the queue.
///
/// Rules, in order:
/// 1. `attempt >= max_attempts` -- never.
/// 2. A flaky/timeout/transient signal in the detail -- retry.
/// 3. Fixable kinds (`lint`, `format`, `type`, `build`) -- retry.
/// 4. `test`/`ci` -- retry only on an infrastructure signal in the detail.
/// 5. Anything else -- no.
pub fn decide_retry(
    failure_kind: Option<&str>,
    failure_detail: Option<&str>,
    attempt: i64,
    max_attempts: i64,
) -> RetryDecision {
    if attempt >= max_attempts {
        return RetryDecision::no(format!(
            "attempt {attempt} >= max_attempts {max_attempts}"
        ));
    }

    let kind = failure_kind.unwrap_or("unknown").to_lowercase();
    let detail = failure_detail.unwrap_or("").to_lowercase();

    // Safe flake rerun bucket.
    if detail.contains("timeout") || detail.contains("flaky") || detail.contains("temporar") {
        return RetryDecision::yes("flaky/timeout signal");
    }

    // Known fixable buckets.
    if matches!(kind.as_str(), "lint" | "format" | "type" | "build") {
        return RetryDecision::yes(format!("fixable failure_kind={kind}"));
    }

    if matches!(kind.as_str(), "test" | "ci") {
        // Only retry automatically on a strong infrastructure signal.
        let infra = ["connection reset", "rate limit", "502", "503"];
        if infra.iter().any(|s| detail.contains(s)) {
            return RetryDecision::yes("infra signal in CI/test");
        }
        return RetryDecision::no("CI/test failures require classification / human gate");
    }

    RetryDecision::no(format!("unknown/untrusted failure_kind={kind}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_attempts_never_retry() {
        let d = decide_retry(Some("lint"), Some("matched:ruff"), 3, 3);
        assert!(!d.should_retry);
        assert_eq!(d.reason, "attempt 3 >= max_attempts 3");
    }

    #[test]
    fn exhaustion_beats_flaky_signal() {
        let d = decide_retry(Some("test"), Some("timeout waiting for runner"), 5, 3);
        assert!(!d.should_retry);
    }

    #[test]
    fn flaky_signal_retries() {
        for detail in ["timeout after 30s", "flaky test detected", "temporarily unavailable"] {
            let d = decide_retry(Some("unknown"), Some(detail), 1, 3);
            assert!(d.should_retry, "detail {detail:?} should retry");
            assert_eq!(d.reason, "flaky/timeout signal");
        }
    }

    #[test]
    fn fixable_kinds_retry() {
        for kind in ["lint", "format", "type", "build"] {
            let d = decide_retry(Some(kind), Some("matched:whatever"), 1, 3);
            assert!(d.should_retry, "kind {kind:?} should retry");
            assert_eq!(d.reason, format!("fixable failure_kind={kind}"));
        }
    }

    #[test]
    fn test_failures_need_infra_signal() {
        let d = decide_retry(Some("test"), Some("matched:pytest"), 1, 3);
        assert!(!d.should_retry);

        let d = decide_retry(Some("test"), Some("pytest: connection reset by peer"), 1, 3);
        assert!(d.should_retry);
        assert_eq!(d.reason, "infra signal in CI/test");
    }

    #[test]
    fn ci_failures_retry_on_rate_limit() {
        let d = decide_retry(Some("ci"), Some("github api: rate limit exceeded"), 2, 3);
        assert!(d.should_retry);

        let d = decide_retry(Some("ci"), Some("workflow run failed"), 2, 3);
        assert!(!d.should_retry);
    }

    #[test]
    fn unknown_kind_does_not_retry() {
        let d = decide_retry(Some("unknown"), Some("connection reset by peer"), 1, 3);
        // "connection reset" only rescues test/ci kinds.
        assert!(!d.should_retry);
        assert_eq!(d.reason, "unknown/untrusted failure_kind=unknown");
    }

    #[test]
    fn missing_kind_defaults_to_unknown() {
        let d = decide_retry(None, None, 0, 3);
        assert!(!d.should_retry);
        assert_eq!(d.reason, "unknown/untrusted failure_kind=unknown");
    }
}
