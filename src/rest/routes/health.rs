//! Liveness and route-inventory endpoints (no auth).

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use sysinfo::System;

use crate::AppContext;

/// Resident memory of this process in bytes, best effort.
fn process_memory_bytes() -> u64 {
    let mut sys = System::new();
    let pid = sysinfo::get_current_pid().ok();
    match pid {
        Some(pid) => {
            sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
            sys.process(pid).map(|p| p.memory()).unwrap_or(0)
        }
        None => 0,
    }
}

/// `GET /api/health` (also served at `/healthcheck`).
pub async fn health(State(ctx): State<Arc<AppContext>>) -> Response {
    let database = match &ctx.storage {
        Some(storage) => {
            if storage.healthy().await {
                "ok"
            } else {
                "unreachable"
            }
        }
        None => "absent",
    };

    let degraded = database == "unreachable" && ctx.config.database_required;
    let status = if degraded { "degraded" } else { "ok" };
    let body = Json(json!({
        "status": status,
        "uptime": ctx.started_at.elapsed().as_secs(),
        "database": database,
        "memory": { "rssBytes": process_memory_bytes() },
    }));

    if degraded {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    } else {
        (StatusCode::OK, body).into_response()
    }
}

/// `GET /api/route-status` — static route inventory.
pub async fn route_status() -> Json<serde_json::Value> {
    Json(json!({
        "routes": [
            { "method": "GET",  "path": "/api/health",         "auth": false },
            { "method": "GET",  "path": "/healthcheck",        "auth": false },
            { "method": "GET",  "path": "/api/route-status",   "auth": false },
            { "method": "POST", "path": "/api/auth/login",     "auth": false },
            { "method": "POST", "path": "/api/ask",            "auth": true },
            { "method": "POST", "path": "/api/update",         "auth": true },
            { "method": "GET",  "path": "/api/audit",          "auth": true },
            { "method": "GET",  "path": "/api/conversations",  "auth": true },
            { "method": "POST", "path": "/api/daemon/command", "auth": true },
            { "method": "GET",  "path": "/api/daemon/connections", "auth": true },
            { "method": "GET",  "path": "/api/metrics",        "auth": true },
            { "method": "POST", "path": "/api/transcribe",     "auth": true },
            { "method": "POST", "path": "/api/vision",         "auth": true },
        ]
    }))
}
