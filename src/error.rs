//! Gateway error taxonomy.
//!
//! Every fallible surface in the gateway returns [`GatewayError`]. The
//! orchestrator maps fatal pipeline outcomes onto these kinds; the REST
//! layer renders them as `{error, message}` envelopes with the matching
//! status code. IPC send failures never become errors — they are reported
//! as `ok=false` results at the call site.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Payload schema or bounds violated. The client can fix and resend.
    #[error("validation failure: {0}")]
    Validation(String),

    /// No credential was supplied on a protected route.
    #[error("authentication required")]
    AuthMissing,

    /// A credential was supplied but rejected (bad password, invalid token).
    #[error("invalid credentials")]
    AuthRejected,

    /// Valid credential, but the requester may not act on this target.
    #[error("forbidden: {0}")]
    AuthForbidden(String),

    /// Request body exceeds a configured cap.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// Sliding-window throttle exceeded.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Model backend or database unreachable.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The request spent its invocation budget. Fatal for the request.
    #[error("invocation budget exhausted ({used}/{limit})")]
    BudgetExhausted { used: u32, limit: u32 },

    /// The watchdog deadline passed. Fatal for the request.
    #[error("deadline exceeded after {elapsed_ms}ms (limit {limit_ms}ms)")]
    DeadlineExceeded { elapsed_ms: u64, limit_ms: u64 },

    /// The reasoning stage produced no usable ledger. Fatal, no retry.
    #[error("structured reasoning output missing")]
    StructuredReasoningMissing,

    /// Model downgrade while running in internal-architectural mode.
    #[error("STRICT_EXECUTION_ERROR: reasoning model downgraded from {requested} to {active}")]
    StrictExecutionDowngrade { requested: String, active: String },

    /// No connected daemon accepted the command.
    #[error("command undeliverable: {0}")]
    CommandUndeliverable(String),

    /// Malformed IPC frame. Answered in-band, never closes the connection.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

impl GatewayError {
    /// Stable machine-readable kind, carried in telemetry and the REST
    /// `error` field.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation_failure",
            GatewayError::AuthMissing => "auth_missing",
            GatewayError::AuthRejected => "auth_rejected",
            GatewayError::AuthForbidden(_) => "auth_forbidden",
            GatewayError::PayloadTooLarge(_) => "payload_too_large",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::UpstreamUnavailable(_) => "upstream_unavailable",
            GatewayError::BudgetExhausted { .. } => "budget_exhausted",
            GatewayError::DeadlineExceeded { .. } => "deadline_exceeded",
            GatewayError::StructuredReasoningMissing => "structured_reasoning_missing",
            GatewayError::StrictExecutionDowngrade { .. } => "strict_execution_downgrade",
            GatewayError::CommandUndeliverable(_) => "command_undeliverable",
            GatewayError::ProtocolViolation(_) => "protocol_violation",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::AuthMissing | GatewayError::AuthRejected => StatusCode::UNAUTHORIZED,
            GatewayError::AuthForbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BudgetExhausted { .. }
            | GatewayError::DeadlineExceeded { .. }
            | GatewayError::StructuredReasoningMissing
            | GatewayError::StrictExecutionDowngrade { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::CommandUndeliverable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ProtocolViolation(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// True for pipeline outcomes that abort the request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::BudgetExhausted { .. }
                | GatewayError::DeadlineExceeded { .. }
                | GatewayError::StructuredReasoningMissing
                | GatewayError::StrictExecutionDowngrade { .. }
        )
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        // 5xx detail stays in the log and telemetry; the wire message is
        // generic in release builds.
        let message = if status.is_server_error() && !cfg!(debug_assertions) {
            "internal error".to_string()
        } else {
            self.to_string()
        };
        let body = Json(json!({
            "error": self.kind(),
            "message": message,
        }));
        (status, body).into_response()
    }
}
