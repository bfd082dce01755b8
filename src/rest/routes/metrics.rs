//! `GET /api/metrics` — gateway counters and gauges.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::AppContext;

pub async fn metrics(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let pipeline = ctx.metrics.snapshot();
    let drift = ctx.drift.snapshot().await;
    Json(json!({
        "pipeline": pipeline,
        "latency": drift,
        "daemonConnections": ctx.registry.len(),
        "activeSessions": ctx.session_tokens.session_count().await,
        "clearThreshold": ctx.clear_tuner.threshold(),
        "uptimeSecs": ctx.started_at.elapsed().as_secs(),
    }))
}
