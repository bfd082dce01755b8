//! `GET /api/audit` — recent audit log entries.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use crate::error::GatewayError;
use crate::rest::auth::AuthedUser;
use crate::AppContext;

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn audit(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<AuditQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return GatewayError::Validation(format!("limit must be between 1 and {MAX_LIMIT}"))
            .into_response();
    }

    let Some(storage) = &ctx.storage else {
        return GatewayError::UpstreamUnavailable("no database configured".into())
            .into_response();
    };

    match storage.recent_logs(limit).await {
        Ok(logs) => Json(json!({ "count": logs.len(), "logs": logs })).into_response(),
        Err(e) => GatewayError::UpstreamUnavailable(format!("audit query failed: {e}"))
            .into_response(),
    }
}

/// `GET /api/conversations` — the caller's recent conversations. A zero
/// limit is a validation error, never a silent empty result.
pub async fn conversations(
    State(ctx): State<Arc<AppContext>>,
    Extension(user): Extension<AuthedUser>,
    Query(query): Query<AuditQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return GatewayError::Validation(format!("limit must be between 1 and {MAX_LIMIT}"))
            .into_response();
    }

    let Some(storage) = &ctx.storage else {
        return GatewayError::UpstreamUnavailable("no database configured".into())
            .into_response();
    };

    match storage.recent_conversations(&user.user_id, limit).await {
        Ok(rows) => Json(json!({ "count": rows.len(), "conversations": rows })).into_response(),
        Err(e) => GatewayError::UpstreamUnavailable(format!("conversation query failed: {e}"))
            .into_response(),
    }
}
