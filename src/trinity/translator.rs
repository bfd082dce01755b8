//! Mid-layer translation — strips system/audit artifacts from raw final
//! text before it reaches the caller.
//!
//! The detected intent of the *original* prompt picks the scrubbing rules.
//! Translation is idempotent: every rule either deletes matches outright or
//! rewrites to a form its own pattern no longer matches, so a second pass is
//! a no-op. The `--- CRITICAL REVIEW ---` block is user-facing output of the
//! reflection stage and is never scrubbed.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Coarse intent of the user's original prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Question,
    Command,
    Chat,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Question => "question",
            Intent::Command => "command",
            Intent::Chat => "chat",
        }
    }
}

const INTERROGATIVES: &[&str] = &[
    "what", "why", "how", "when", "where", "who", "which", "can", "could", "should", "would",
    "is", "are", "does", "do",
];

const IMPERATIVES: &[&str] = &[
    "run", "create", "delete", "list", "show", "generate", "write", "update", "build", "deploy",
    "restart", "fetch", "send", "make", "add", "remove",
];

/// Heuristic intent classifier over a small tag set.
pub fn detect_intent(prompt: &str) -> Intent {
    let trimmed = prompt.trim();
    if trimmed.ends_with('?') {
        return Intent::Question;
    }
    let first_word = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();
    if INTERROGATIVES.contains(&first_word.as_str()) {
        return Intent::Question;
    }
    if IMPERATIVES.contains(&first_word.as_str()) {
        return Intent::Command;
    }
    Intent::Chat
}

// ─── Scrub patterns ───────────────────────────────────────────────────────────

/// Internal stage banners, e.g. `[REASONING]` or `[AUDIT overall=2.1]`.
static STAGE_BANNER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*\[(?:INTAKE|REASONING|REFLECTION|FINAL|AUDIT)[^\]\n]*\][ \t]*\r?\n?")
        .expect("regex: stage banner")
});

/// Leaked system-prompt lines (`System:` / `System prompt:` prefixes).
static SYSTEM_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^[ \t]*system(?: prompt)?:[^\n]*\r?\n?").expect("regex: system line")
});

/// Internal-mode banner emitted by architectural runs.
static INTERNAL_BANNER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*--- INTERNAL (?:DIRECTIVE|MODE) ---[ \t]*\r?\n?")
        .expect("regex: internal banner")
});

/// Leading answer labels on question/command responses. Leading whitespace
/// is part of the match so repeated labels strip in one pass.
static ANSWER_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:Answer|Response|Result):[ \t]*").expect("regex: answer label")
});

/// Three or more blank lines, squeezed to one blank line.
static BLANK_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("regex: blank runs"));

/// Scrub system/audit artifacts from `raw` given the original prompt.
pub fn translate(prompt: &str, raw: &str) -> String {
    let intent = detect_intent(prompt);
    translate_with_intent(intent, raw)
}

pub fn translate_with_intent(intent: Intent, raw: &str) -> String {
    let mut text = STAGE_BANNER.replace_all(raw, "").into_owned();
    text = SYSTEM_LINE.replace_all(&text, "").into_owned();
    text = INTERNAL_BANNER.replace_all(&text, "").into_owned();

    if matches!(intent, Intent::Question | Intent::Command) {
        // Loop so stacked labels ("Answer: Answer: x") vanish in one call.
        while let Some(m) = ANSWER_LABEL.find(&text) {
            text.replace_range(..m.end(), "");
        }
    }

    text = BLANK_RUNS.replace_all(&text, "\n\n").into_owned();
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_mark_wins() {
        assert_eq!(detect_intent("deploy it now?"), Intent::Question);
    }

    #[test]
    fn interrogative_first_word() {
        assert_eq!(detect_intent("how does this work"), Intent::Question);
    }

    #[test]
    fn imperative_first_word() {
        assert_eq!(detect_intent("Restart the ingest daemon"), Intent::Command);
    }

    #[test]
    fn default_is_chat() {
        assert_eq!(detect_intent("nice weather today"), Intent::Chat);
    }

    #[test]
    fn strips_stage_banners_and_system_lines() {
        let raw = "[REASONING]\nSystem: internal instructions\nThe answer is 4.\n";
        let out = translate("what is 2+2?", raw);
        assert_eq!(out, "The answer is 4.");
    }

    #[test]
    fn strips_answer_label_for_questions_only() {
        let raw = "Answer: 4";
        assert_eq!(translate("what is 2+2?", raw), "4");
        assert_eq!(translate("hello there", raw), "Answer: 4");
    }

    #[test]
    fn preserves_critical_review_marker() {
        let raw = "draft text\n\n--- CRITICAL REVIEW ---\nno flaws found";
        let out = translate("audit the architecture for security", raw);
        assert!(out.contains("--- CRITICAL REVIEW ---"));
    }

    #[test]
    fn translation_is_idempotent() {
        let raw = "[AUDIT overall=1.2]\nAnswer: fine\n\n\n\nSystem: leaked\ntail";
        let once = translate("what now?", raw);
        let twice = translate_with_intent(Intent::Question, &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn idempotent_across_random_inputs() {
        use proptest::prelude::*;
        proptest!(|(s in "[ -~\n]{0,200}")| {
            let once = translate_with_intent(Intent::Chat, &s);
            let twice = translate_with_intent(Intent::Chat, &once);
            prop_assert_eq!(once, twice);
        });
    }
}
