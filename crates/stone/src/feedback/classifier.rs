//! Keyword-based comment classification.

use regex::Regex;
use std::sync::LazyLock;

use super::{AffectedArea, FeedbackItem, Severity};
use crate::github::Comment;

/// Comments shorter than this (in characters) are noise.
const MIN_ACTIONABLE_CHARS: usize = 10;

/// Approvals, thanks and reactions. Matched against the whole comment.
static NON_ACTIONABLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)^\s*lgtm[\s!.]*(👍|:\+1:)?[\s!.]*$").unwrap(),
        Regex::new(r"(?i)^\s*looks good( to me)?[\s!.]*$").unwrap(),
        Regex::new(r"(?i)^\s*approved?[\s!.]*$").unwrap(),
        Regex::new(r"(?i)^\s*ship it[\s!.]*$").unwrap(),
        Regex::new(r"(?i)^\s*(thanks|thank you)([\s,]+\w+)?[\s!.]*$").unwrap(),
        Regex::new(r"(?i)^\s*(nice|great) work[\s!.]*$").unwrap(),
        Regex::new(r"^\s*(👍|:\+1:)+\s*$").unwrap(),
        // Reaction shortcodes only
        Regex::new(r"^\s*(:[a-z0-9_+-]+:\s*)+$").unwrap(),
    ]
});

const CRITICAL_KEYWORDS: &[&str] = &[
    "critical",
    "blocker",
    "urgent",
    r"data\s+loss",
    r"crash\w*",
    r"production\s+down",
    "severe",
];

const HIGH_KEYWORDS: &[&str] = &[
    "bug",
    "broken",
    "incorrect",
    "wrong",
    r"fail\w*",
    "error",
    "must",
    "regression",
    "important",
    "major",
];

const LOW_KEYWORDS: &[&str] = &[
    "nit",
    "nitpick",
    "minor",
    "typo",
    "style",
    "cosmetic",
    "suggestion",
    "optional",
    "consider",
    "maybe",
    r"nice\s+to\s+have",
];

/// Area keyword sets, scanned in this order. Disjoint from the severity sets.
const AREA_KEYWORDS: &[(AffectedArea, &[&str])] = &[
    (
        AffectedArea::Performance,
        &[
            "performance",
            "perf",
            "slow",
            "latency",
            "memory",
            "cpu",
            r"optimi[sz]\w*",
            "throughput",
        ],
    ),
    (
        AffectedArea::Security,
        &[
            "security",
            r"vulnerab\w*",
            r"auth\w*",
            "xss",
            "csrf",
            "injection",
            r"secrets?",
            r"tokens?",
            r"passwords?",
            r"permissions?",
        ],
    ),
    (
        AffectedArea::Ui,
        &[
            "ui",
            "ux",
            "layout",
            "css",
            "button",
            "screen",
            "responsive",
            "accessibility",
            r"a11y",
        ],
    ),
    (
        AffectedArea::Docs,
        &["docs?", "documentation", "readme", "docstring", "changelog"],
    ),
    (
        AffectedArea::Testing,
        &[r"tests?", "testing", "coverage", "flaky", r"assertions?"],
    ),
    (
        AffectedArea::Api,
        &["api", r"endpoints?", "request", "response", "schema", "http", "graphql"],
    ),
];

fn keyword_regex(words: &[&str]) -> Regex {
    Regex::new(&format!(r"(?i)\b(?:{})\b", words.join("|"))).unwrap()
}

static CRITICAL: LazyLock<Regex> = LazyLock::new(|| keyword_regex(CRITICAL_KEYWORDS));
static HIGH: LazyLock<Regex> = LazyLock::new(|| keyword_regex(HIGH_KEYWORDS));
static LOW: LazyLock<Regex> = LazyLock::new(|| keyword_regex(LOW_KEYWORDS));
static AREAS: LazyLock<Vec<(AffectedArea, Regex)>> = LazyLock::new(|| {
    AREA_KEYWORDS
        .iter()
        .map(|(area, words)| (*area, keyword_regex(words)))
        .collect()
});

/// Turns a comment into a feedback item, or `None` when it is not actionable.
pub trait FeedbackClassifier: Send + Sync {
    fn classify(&self, comment: &Comment) -> Option<FeedbackItem>;
}

/// Fixed keyword lists; no semantic understanding.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn is_actionable(text: &str) -> bool {
        let text = text.trim();
        if NON_ACTIONABLE_PATTERNS.iter().any(|re| re.is_match(text)) {
            return false;
        }
        // Pure emoji / punctuation
        if !text.chars().any(char::is_alphanumeric) {
            return false;
        }
        text.chars().count() >= MIN_ACTIONABLE_CHARS
    }

    /// Critical beats high beats low; anything else is medium.
    #[must_use]
    pub fn severity(text: &str) -> Severity {
        if CRITICAL.is_match(text) {
            Severity::Critical
        } else if HIGH.is_match(text) {
            Severity::High
        } else if LOW.is_match(text) {
            Severity::Low
        } else {
            Severity::Medium
        }
    }

    #[must_use]
    pub fn affected_area(text: &str) -> AffectedArea {
        AREAS
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map_or(AffectedArea::Unknown, |(area, _)| *area)
    }
}

impl FeedbackClassifier for KeywordClassifier {
    fn classify(&self, comment: &Comment) -> Option<FeedbackItem> {
        let text = comment.body.trim();
        if !Self::is_actionable(text) {
            return None;
        }
        Some(FeedbackItem {
            id: format!("feedback-{}", comment.id),
            description: text.to_string(),
            severity: Self::severity(text),
            author: comment.author.clone(),
            affected_area: Self::affected_area(text),
            source_comment_id: comment.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn classify(text: &str) -> Option<FeedbackItem> {
        KeywordClassifier.classify(&Comment::new(7, "reviewer", text))
    }

    #[test]
    fn test_approvals_are_not_actionable() {
        for text in [
            "LGTM",
            "lgtm 👍",
            "Looks good to me!",
            "Approved.",
            "Ship it",
            "Thanks!",
            "thank you so",
            "Nice work!",
            "👍",
            ":+1:",
            ":tada: :rocket:",
            "🎉🚀🔥",
        ] {
            assert!(classify(text).is_none(), "{text}");
        }
    }

    #[test]
    fn test_short_comments_are_noise() {
        assert!(classify("fix this").is_none());
        assert!(classify("  ok  ").is_none());
        assert!(classify("rename this").is_some());
    }

    #[test]
    fn test_critical_security() {
        let item = classify("CRITICAL: security vulnerability in auth").unwrap();
        assert_eq!(item.severity, Severity::Critical);
        assert_eq!(item.affected_area, AffectedArea::Security);
        assert_eq!(item.source_comment_id, 7);
        assert_eq!(item.author, "reviewer");
    }

    #[test]
    fn test_severity_precedence() {
        assert_eq!(
            KeywordClassifier::severity("minor nit but this crashes on empty input"),
            Severity::Critical
        );
        assert_eq!(
            KeywordClassifier::severity("nit: this is wrong"),
            Severity::High
        );
        assert_eq!(
            KeywordClassifier::severity("nit: rename the variable"),
            Severity::Low
        );
        assert_eq!(
            KeywordClassifier::severity("Please rename the variable"),
            Severity::Medium
        );
    }

    #[test]
    fn test_area_does_not_depend_on_severity_words() {
        assert_eq!(
            KeywordClassifier::affected_area("critical regression in the login endpoint"),
            AffectedArea::Api
        );
        assert_eq!(
            KeywordClassifier::affected_area("This query is slow"),
            AffectedArea::Performance
        );
        assert_eq!(
            KeywordClassifier::affected_area("The README is out of date"),
            AffectedArea::Docs
        );
        assert_eq!(
            KeywordClassifier::affected_area("Add a test for the empty case"),
            AffectedArea::Testing
        );
        assert_eq!(
            KeywordClassifier::affected_area("Please rename the variable"),
            AffectedArea::Unknown
        );
    }

    #[test]
    fn test_word_boundaries() {
        // "latest" must not read as "test", "builds" must not read as "ui"
        assert_eq!(
            KeywordClassifier::affected_area("use the latest builds here"),
            AffectedArea::Unknown
        );
        // "mustard" is not "must"
        assert_eq!(KeywordClassifier::severity("add mustard to the list"), Severity::Medium);
    }

    #[test]
    fn test_keyword_sets_are_disjoint() {
        let severity: HashSet<&str> = CRITICAL_KEYWORDS
            .iter()
            .chain(HIGH_KEYWORDS)
            .chain(LOW_KEYWORDS)
            .copied()
            .collect();
        for (_, words) in AREA_KEYWORDS {
            for word in *words {
                assert!(!severity.contains(word), "{word} in both sets");
                let re = keyword_regex(&[*word]);
                for sev in &severity {
                    let plain = sev.replace(r"\s+", " ").replace(r"\w*", "");
                    assert!(!re.is_match(&plain), "{word} matches severity keyword {sev}");
                }
            }
        }
    }
}
