//! Complexity-tier classification.
//!
//! The tier is assigned once at request entry and is immutable for the
//! request. It scales the reasoning effort hint, the invocation budget, the
//! watchdog deadline, and the admission cap.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Complexity class of an incoming prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Simple,
    Complex,
    Critical,
}

impl Tier {
    /// The tier one hop up. Critical is the ceiling.
    pub fn next(self) -> Tier {
        match self {
            Tier::Simple => Tier::Complex,
            Tier::Complex => Tier::Critical,
            Tier::Critical => Tier::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Simple => "simple",
            Tier::Complex => "complex",
            Tier::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phrases that attempt to steer the classifier from inside the prompt.
/// Any hit pins the request to the lowest tier.
const FORBIDDEN_PHRASES: &[&str] = &["set tier to", "override reasoning", "treat as critical"];

/// Lexical signals that raise the tier.
static TIER_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "audit",
        "architecture",
        "failure mode",
        "threat",
        "infrastructure",
        "security",
        "concurrency",
        "downgrade detection",
        "watchdog",
        "multi-tenant",
    ]
});

const CRITICAL_MIN_LEN: usize = 500;
const COMPLEX_MIN_LEN: usize = 300;
const CRITICAL_MIN_HITS: usize = 2;

/// Lowercase and collapse whitespace runs to single spaces.
fn normalize(prompt: &str) -> String {
    let mut out = String::with_capacity(prompt.len());
    let mut last_was_space = false;
    for c in prompt.trim().chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            for lc in c.to_lowercase() {
                out.push(lc);
            }
            last_was_space = false;
        }
    }
    out
}

/// Count non-overlapping occurrences of `needle` in `haystack`.
fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        count += 1;
        from += pos + needle.len();
    }
    count
}

/// Classify a prompt into a [`Tier`].
///
/// Deterministic and whitespace-insensitive: the prompt is normalized first,
/// then checked against the forbidden-phrase guard, then scored by length
/// and keyword density. Critical dominates on ties.
pub fn classify(prompt: &str) -> Tier {
    let normalized = normalize(prompt);

    for phrase in FORBIDDEN_PHRASES {
        if normalized.contains(phrase) {
            warn!(phrase, "forbidden tier-steering phrase in prompt — pinning tier to simple");
            return Tier::Simple;
        }
    }

    let hits: usize = TIER_KEYWORDS
        .iter()
        .map(|kw| count_occurrences(&normalized, kw))
        .sum();
    let len = normalized.len();

    if len >= CRITICAL_MIN_LEN && hits >= CRITICAL_MIN_HITS {
        Tier::Critical
    } else if len >= COMPLEX_MIN_LEN || hits >= 1 {
        Tier::Complex
    } else {
        Tier::Simple
    }
}
