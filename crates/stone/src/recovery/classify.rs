//! Transient vs permanent failure classification.

use regex::RegexSet;
use std::sync::LazyLock;

/// Messages matching any of these are worth retrying.
static TEMPORARY_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)rate.?limit",
        r"(?i)timeout|timed out",
        r"(?i)econnreset|connection reset",
        r"(?i)econnrefused|connection refused",
        r"(?i)network error",
        r"(?i)socket hang up",
        r"(?i)service unavailable",
        r"(?i)bad gateway",
        r"(?i)gateway timeout",
        r"\b50[234]\b",
        r"(?i)temporarily unavailable",
        r"(?i)too many requests",
        r"ETIMEDOUT",
        r"EAI_AGAIN",
    ])
    .expect("temporary error patterns are valid")
});

/// Whether an error message describes a transient failure.
#[must_use]
pub fn is_temporary(message: &str) -> bool {
    TEMPORARY_PATTERNS.is_match(message)
}
