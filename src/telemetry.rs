//! Per-request telemetry records.
//!
//! One record per pipeline run, emitted whether the run succeeded, failed,
//! or was cancelled mid-flight. Records go to the structured log; the audit
//! trail itself lives in storage.

use serde::Serialize;
use tracing::info;

use crate::trinity::tier::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestOutcome {
    Success,
    Failed,
    Cancelled,
}

impl RequestOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestOutcome::Success => "success",
            RequestOutcome::Failed => "failed",
            RequestOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTelemetry {
    pub request_id: String,
    pub tier: Tier,
    pub total_tokens: u64,
    pub downgrade_detected: bool,
    pub latency_ms: u64,
    pub reflection_applied: bool,
    pub outcome: RequestOutcome,
    /// Error kind for failed runs; stays here even when the HTTP message is
    /// redacted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
}

impl RequestTelemetry {
    pub fn emit(&self) {
        info!(
            target: "trinity::telemetry",
            request_id = %self.request_id,
            tier = %self.tier,
            total_tokens = self.total_tokens,
            downgrade_detected = self.downgrade_detected,
            latency_ms = self.latency_ms,
            reflection_applied = self.reflection_applied,
            outcome = self.outcome.as_str(),
            error_kind = self.error_kind.unwrap_or("-"),
            "request completed"
        );
    }
}
