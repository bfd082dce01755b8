//! The result envelope returned by the pipeline, plus its telemetry slices.

use serde::Serialize;

use crate::trinity::clear::ClearScore;
use crate::trinity::tier::Tier;

/// Routing tags accumulated as the pipeline advances, e.g.
/// `["INTAKE:gpt-4.1", "REASONING", "REFLECTION", "FINAL"]`.
pub type RoutingStages = Vec<String>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierInfo {
    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_tier: Option<Tier>,
    pub reflection_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardInfo {
    pub budget_used: u32,
    pub budget_limit: u32,
    pub elapsed_ms: u64,
    pub deadline_ms: u64,
}

/// Which stages were served by the fallback model.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackSummary {
    pub intake: bool,
    pub reasoning: bool,
    pub reflection: bool,
    pub r#final: bool,
}

impl FallbackSummary {
    pub fn any(&self) -> bool {
        self.intake || self.reasoning || self.reflection || self.r#final
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMeta {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// External response id of the final synthesis call.
    pub response_id: String,
    /// Upstream creation timestamp (epoch seconds).
    pub created: i64,
}

/// Envelope returned to the HTTP layer after a pipeline run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrinityResult {
    /// Final, translated user-facing text.
    pub result: String,
    /// Identifier of the model that produced the final synthesis.
    pub module: String,
    pub routing_stages: RoutingStages,
    pub tier_info: TierInfo,
    pub guard_info: GuardInfo,
    pub fallback_summary: FallbackSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clear_audit: Option<ClearScore>,
    /// Derived from the CLEAR overall score, in [0, 1].
    pub confidence: f64,
    pub escalated: bool,
    pub downgrade_detected: bool,
    pub request_id: String,
    pub latency_ms: u64,
    pub meta: ResultMeta,
}

/// Confidence is the overall CLEAR score projected onto [0, 1]; absent or
/// fallback audits yield 0.
pub fn confidence_from_overall(overall: Option<f64>) -> f64 {
    (overall.unwrap_or(0.0) / 5.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_projection() {
        assert_eq!(confidence_from_overall(None), 0.0);
        assert_eq!(confidence_from_overall(Some(5.0)), 1.0);
        assert_eq!(confidence_from_overall(Some(2.5)), 0.5);
        assert_eq!(confidence_from_overall(Some(7.0)), 1.0);
    }

    #[test]
    fn envelope_serializes_camel_case() {
        let result = TrinityResult {
            result: "ok".into(),
            module: "m".into(),
            routing_stages: vec!["INTAKE:m".into()],
            tier_info: TierInfo {
                tier: Tier::Simple,
                original_tier: None,
                reflection_applied: false,
                escalation_reason: None,
            },
            guard_info: GuardInfo {
                budget_used: 3,
                budget_limit: 4,
                elapsed_ms: 10,
                deadline_ms: 30_000,
            },
            fallback_summary: FallbackSummary::default(),
            clear_audit: Some(ClearScore::fallback()),
            confidence: 0.0,
            escalated: false,
            downgrade_detected: false,
            request_id: "r".into(),
            latency_ms: 10,
            meta: ResultMeta::default(),
        };
        let v = serde_json::to_value(&result).unwrap();
        assert!(v.get("routingStages").is_some());
        assert!(v.get("tierInfo").is_some());
        assert_eq!(v["tierInfo"]["reflectionApplied"], false);
        // Absent optionals are omitted, not null.
        assert!(v["tierInfo"].get("originalTier").is_none());
    }
}
