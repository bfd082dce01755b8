//! `POST /api/update` — ingest a client-side state update into the audit
//! trail.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::rest::auth::AuthedUser;
use crate::storage::DaemonEventRecord;
use crate::AppContext;

/// Serialized `data` cap: 10 KB.
const MAX_DATA_BYTES: usize = 10 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    #[serde(default)]
    pub update_type: String,
    #[serde(default)]
    pub data: Value,
}

pub async fn update(
    State(ctx): State<Arc<AppContext>>,
    Extension(user): Extension<AuthedUser>,
    Json(body): Json<UpdateRequest>,
) -> Response {
    let update_type = body.update_type.trim();
    if update_type.is_empty() {
        return GatewayError::Validation("updateType is required".into()).into_response();
    }

    let serialized = body.data.to_string();
    if serialized.len() > MAX_DATA_BYTES {
        return GatewayError::PayloadTooLarge(format!(
            "data exceeds {MAX_DATA_BYTES} bytes serialized"
        ))
        .into_response();
    }

    if let Some(storage) = &ctx.storage {
        let record = DaemonEventRecord {
            event_type: format!("update.{update_type}"),
            event_id: Uuid::new_v4().to_string(),
            user_id: user.user_id.clone(),
            connection_id: "http".to_string(),
            payload: body.data,
        };
        if let Err(e) = storage.append_event(record).await {
            warn!(err = %e, "update append failed — continuing");
        }
    }

    Json(json!({ "ok": true })).into_response()
}
