//! Test failure classification and the cycle guard.
//!
//! The guard decides when ordinary fixes have stopped making progress:
//! - a fingerprint seen earlier in the session forces escalation;
//! - `assertion_streak` consecutive assertion failures force escalation.
//!
//! The assertion counter resets whenever a forced escalation fires, on any
//! non-assertion failure and on a passing run.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const IMPORT_MARKERS: [&str; 3] = ["ImportError", "ModuleNotFoundError", "NameError"];
const ASSERTION_MARKER: &str = "AssertionError";

/// pytest reports rewritten asserts as `E   assert ...` without naming the exception.
static PYTEST_ASSERT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^E\s+assert\s").unwrap());

/// First line of pytest's failure report: error detail, summary or traceback.
static FAILURE_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(?:E\s|FAILED\b|ERROR\b|Traceback\b)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    ImportError,
    AssertionError,
    Other,
}

/// Classify a failing test log. Import markers take precedence.
pub fn classify_failure(log: &str) -> FailureCategory {
    if IMPORT_MARKERS.iter().any(|marker| log.contains(marker)) {
        FailureCategory::ImportError
    } else if log.contains(ASSERTION_MARKER) || PYTEST_ASSERT_RE.is_match(log) {
        FailureCategory::AssertionError
    } else {
        FailureCategory::Other
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorFingerprint {
    pub category: FailureCategory,
    /// Hex SHA-256 of the failure section prefix.
    pub content_hash: String,
}

impl ErrorFingerprint {
    /// Hash the first `prefix_chars` of the failure section, skipping the
    /// session banner pytest prints identically on every run.
    pub fn new(category: FailureCategory, log: &str, prefix_chars: usize) -> Self {
        let prefix: String = failure_section(log).chars().take(prefix_chars).collect();
        Self {
            category,
            content_hash: hex::encode(Sha256::digest(prefix.as_bytes())),
        }
    }
}

/// The log from its first failure line on, or the whole log when there is none.
fn failure_section(log: &str) -> &str {
    FAILURE_START_RE
        .find(log)
        .map_or(log, |found| &log[found.start()..])
}

/// Why the guard overrode the category-based decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedEscalation {
    RepeatedFingerprint,
    AssertionStreak,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureAssessment {
    pub category: FailureCategory,
    pub fingerprint: ErrorFingerprint,
    pub forced: Option<ForcedEscalation>,
}

/// Session-scoped memory of failures seen so far.
#[derive(Debug, Clone)]
pub struct CycleGuard {
    seen: HashSet<ErrorFingerprint>,
    consecutive_assertions: u32,
    assertion_streak: u32,
    prefix_chars: usize,
}

impl CycleGuard {
    pub fn new(assertion_streak: u32, prefix_chars: usize) -> Self {
        Self {
            seen: HashSet::new(),
            consecutive_assertions: 0,
            assertion_streak,
            prefix_chars,
        }
    }

    pub fn consecutive_assertions(&self) -> u32 {
        self.consecutive_assertions
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Classify a failing run and record its fingerprint.
    pub fn assess(&mut self, log: &str) -> FailureAssessment {
        let category = classify_failure(log);
        let fingerprint = ErrorFingerprint::new(category, log, self.prefix_chars);
        let repeated = !self.seen.insert(fingerprint.clone());

        let forced = if repeated {
            self.consecutive_assertions = 0;
            Some(ForcedEscalation::RepeatedFingerprint)
        } else if category == FailureCategory::AssertionError {
            self.consecutive_assertions += 1;
            if self.consecutive_assertions >= self.assertion_streak {
                self.consecutive_assertions = 0;
                Some(ForcedEscalation::AssertionStreak)
            } else {
                None
            }
        } else {
            self.consecutive_assertions = 0;
            None
        };

        FailureAssessment {
            category,
            fingerprint,
            forced,
        }
    }

    /// A passing run clears the assertion streak.
    pub fn record_success(&mut self) {
        self.consecutive_assertions = 0;
    }
}
