//! The reasoning ledger — schema-constrained output of the reasoning stage.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Unwrap a markdown code fence around a JSON body.
///
/// Schema-constrained decoding should yield bare JSON, but fallback models
/// habitually wrap it in ```json fences; tolerating that costs nothing and
/// saves the request.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the language tag on the opening fence line, if any.
    match body.split_once('\n') {
        Some((first_line, remainder)) if !first_line.trim().starts_with('{') => remainder.trim(),
        _ => body.trim(),
    }
}

/// Structured reasoning trace produced by the reasoning stage.
///
/// A request that completes the reasoning stage always has a ledger; the
/// absence of one is fatal, never a recoverable state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReasoningLedger {
    #[serde(rename = "reasoning_steps", default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub tradeoffs: Vec<String>,
    #[serde(rename = "alternatives_considered", default)]
    pub alternatives: Vec<String>,
    #[serde(rename = "chosen_path_justification", default)]
    pub justification: String,
    #[serde(rename = "final_answer")]
    pub final_answer: String,
}

impl ReasoningLedger {
    /// Render the ledger as the draft text later stages build on.
    pub fn draft(&self) -> String {
        let mut out = String::new();
        if !self.steps.is_empty() {
            out.push_str("Reasoning:\n");
            for (i, step) in self.steps.iter().enumerate() {
                out.push_str(&format!("{}. {}\n", i + 1, step));
            }
            out.push('\n');
        }
        out.push_str(&self.final_answer);
        out
    }

    /// Compact serialization fed to the CLEAR auditor.
    pub fn to_audit_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// JSON schema enforced on the reasoning stage's decoding.
///
/// Every field is required so a partial response fails validation instead of
/// silently producing an empty ledger.
pub static REASONING_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": [
            "reasoning_steps",
            "assumptions",
            "constraints",
            "tradeoffs",
            "alternatives_considered",
            "chosen_path_justification",
            "final_answer"
        ],
        "properties": {
            "reasoning_steps":          { "type": "array", "items": { "type": "string" } },
            "assumptions":              { "type": "array", "items": { "type": "string" } },
            "constraints":              { "type": "array", "items": { "type": "string" } },
            "tradeoffs":                { "type": "array", "items": { "type": "string" } },
            "alternatives_considered":  { "type": "array", "items": { "type": "string" } },
            "chosen_path_justification": { "type": "string" },
            "final_answer":             { "type": "string" }
        }
    })
});
