//! `POST /api/daemon/command` — fan a command out to the caller's
//! connected daemons.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::error::GatewayError;
use crate::ipc::protocol::build_command;
use crate::rest::auth::AuthedUser;
use crate::AppContext;

const MAX_COMMAND_LEN: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub payload: Option<Map<String, Value>>,
    #[serde(default)]
    pub target_user_id: Option<String>,
}

/// `GET /api/daemon/connections` — the caller's live daemon connections.
pub async fn list_connections(
    State(ctx): State<Arc<AppContext>>,
    Extension(user): Extension<AuthedUser>,
) -> Json<Value> {
    let connections: Vec<Value> = ctx
        .registry
        .list(Some(&user.user_id))
        .iter()
        .map(|c| {
            json!({
                "connectionId": c.connection_id,
                "connectedAt": c.connected_at,
                "lastSeenAt": c.last_seen_at,
                "open": c.is_open(),
                "metadata": c.metadata,
            })
        })
        .collect();
    Json(json!({ "count": connections.len(), "connections": connections }))
}

pub async fn dispatch_command(
    State(ctx): State<Arc<AppContext>>,
    Extension(user): Extension<AuthedUser>,
    Json(body): Json<CommandRequest>,
) -> Response {
    let command = body.command.trim();
    if command.is_empty() || command.len() > MAX_COMMAND_LEN {
        return GatewayError::Validation(format!(
            "command must be 1..={MAX_COMMAND_LEN} characters"
        ))
        .into_response();
    }

    // Requesters may only target their own daemons.
    let target = body.target_user_id.unwrap_or_else(|| user.user_id.clone());
    if target != user.user_id {
        return GatewayError::AuthForbidden(
            "commands may only target the authenticated user".into(),
        )
        .into_response();
    }

    let (command_id, message) = build_command(command, body.payload);
    let delivery = ctx.registry.send_command_to_user(&target, &message);

    if delivery.ok {
        info!(
            command_id = %command_id,
            user_id = %target,
            delivered = delivery.sent_count,
            "command dispatched"
        );
        (
            StatusCode::ACCEPTED,
            Json(json!({
                "commandId": command_id,
                "deliveredConnections": delivery.connection_ids,
            })),
        )
            .into_response()
    } else {
        GatewayError::CommandUndeliverable(
            delivery
                .error
                .unwrap_or_else(|| "no daemon connection accepted the command".into()),
        )
        .into_response()
    }
}
