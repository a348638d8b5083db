//! Failure classification for runner output.
//!
//! A pure function from `(output tail, exit code)` to a failure kind. The
//! signal banks are ordered -- lint before test before build before ci
//! before agent -- and the first match wins, so the ordering is load-bearing
//! and must be preserved when extending a bank.

use std::sync::LazyLock;

use regex::Regex;

use drover_db::models::FailureKind;

/// Result of classifying a failed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: FailureKind,
    pub detail: String,
}

/// Ordered signal banks, compiled once. Patterns are matched against the
/// lowercased output tail, so they are written in lowercase with explicit
/// word boundaries.
static SIGNAL_BANKS: LazyLock<Vec<(FailureKind, Vec<Regex>)>> = LazyLock::new(|| {
    let bank = |patterns: &[&str]| -> Vec<Regex> {
        patterns
            .iter()
            .map(|p| Regex::new(p).expect("signal pattern must compile"))
            .collect()
    };

    vec![
        (
            FailureKind::Lint,
            bank(&[
                r"\blint(?:ing)?\b",
                r"\bflake8\b",
                r"\beslint\b",
                r"\bruff\b",
                r"\bpylint\b",
                r"\bblack\b",
                r"\bstyle check\b",
                r"\bformat(?:ting)? check\b",
            ]),
        ),
        (
            FailureKind::Test,
            bank(&[
                r"\btest(?:s)?\b.*\bfailed\b",
                r"\bpytest\b",
                r"\bjunit\b",
                r"\bnosetests\b",
                r"\bfailing test\b",
                r"\bassert(?:ion)?error\b",
            ]),
        ),
        (
            FailureKind::Build,
            bank(&[
                r"\bbuild\b.*\bfailed\b",
                r"\bcompile(?:r|d)?\b",
                r"\bcompilation\b",
                r"\bsyntax error\b",
                r"\blink(?:er)? error\b",
                r"\bmodule not found\b",
                r"\bfailed to build\b",
            ]),
        ),
        (
            FailureKind::Ci,
            bank(&[
                r"\bgithub actions\b",
                r"\bworkflow run\b",
                r"\bci\b",
                r"\bcheck run\b",
                r"\bstatus check\b",
                r"\bpipeline\b",
            ]),
        ),
        (
            FailureKind::Agent,
            bank(&[
                r"\bcodex\b",
                r"\bopenclaw\b",
                r"\bagent\b",
                r"\bunsupported routing\b",
                r"\bbinary not found\b",
                r"\btimeout\b",
                r"\bpermission denied\b",
            ]),
        ),
    ]
});

/// Classify a failed run from its output tail and exit code.
///
/// Precedence: exit codes 126/127 (not-executable / command-not-found) are
/// always `agent`; otherwise the ordered signal banks are scanned and the
/// first matching pattern wins; otherwise `unknown`, with the exit code as
/// detail when one is available.
pub fn classify_failure(text: &str, rc: Option<i32>) -> Classification {
    if let Some(rc) = rc {
        if rc == 126 || rc == 127 {
            return Classification {
                kind: FailureKind::Agent,
                detail: format!("runner rc={rc}"),
            };
        }
    }

    let hay = text.to_lowercase();
    for (kind, patterns) in SIGNAL_BANKS.iter() {
        for pattern in patterns {
            if pattern.is_match(&hay) {
                return Classification {
                    kind: kind.clone(),
                    detail: format!("matched:{}", pattern.as_str()),
                };
            }
        }
    }

    match rc {
        Some(rc) => Classification {
            kind: FailureKind::Unknown,
            detail: format!("runner rc={rc}"),
        },
        None => Classification {
            kind: FailureKind::Unknown,
            detail: "no failure signal matched".to_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_lint_failure() {
        let c = classify_failure("ruff check failed with 12 violations", Some(1));
        assert_eq!(c.kind, FailureKind::Lint);
    }

    #[test]
    fn classifies_test_failure() {
        let c = classify_failure("pytest output: 2 failed, 10 passed", Some(1));
        assert_eq!(c.kind, FailureKind::Test);
    }

    #[test]
    fn classifies_build_failure() {
        let c = classify_failure("compilation failed: syntax error", Some(1));
        assert_eq!(c.kind, FailureKind::Build);
    }

    #[test]
    fn classifies_ci_failure() {
        let c = classify_failure("github actions status check failed", Some(1));
        assert_eq!(c.kind, FailureKind::Ci);
    }

    #[test]
    fn classifies_agent_from_exit_code() {
        let c = classify_failure("", Some(127));
        assert_eq!(c.kind, FailureKind::Agent);
        assert_eq!(c.detail, "runner rc=127");

        let c = classify_failure("lint errors everywhere", Some(126));
        // Exit-code precedence beats the signal banks.
        assert_eq!(c.kind, FailureKind::Agent);
    }

    #[test]
    fn classifies_unknown_with_rc() {
        let c = classify_failure("some random failure text", Some(3));
        assert_eq!(c.kind, FailureKind::Unknown);
        assert_eq!(c.detail, "runner rc=3");
    }

    #[test]
    fn classifies_unknown_without_rc() {
        let c = classify_failure("nothing recognizable here", None);
        assert_eq!(c.kind, FailureKind::Unknown);
        assert_eq!(c.detail, "no failure signal matched");
    }

    #[test]
    fn bank_order_lint_beats_test() {
        // Output mentions both lint and pytest; lint is scanned first.
        let c = classify_failure("lint stage ran before pytest", Some(1));
        assert_eq!(c.kind, FailureKind::Lint);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let c = classify_failure("ESLint found problems", Some(1));
        assert_eq!(c.kind, FailureKind::Lint);
    }

    #[test]
    fn connection_reset_alone_is_unknown() {
        // No test/ci lexeme, so the text does not classify; the retry
        // policy sees the detail, not the raw output.
        let c = classify_failure("connection reset by peer", Some(1));
        assert_eq!(c.kind, FailureKind::Unknown);
    }

    #[test]
    fn detail_names_the_matched_pattern() {
        let c = classify_failure("3 tests failed", Some(1));
        assert_eq!(c.detail, r"matched:\btest(?:s)?\b.*\bfailed\b");
    }
}
