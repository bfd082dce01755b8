//! `POST /api/transcribe` and `POST /api/vision` — media bridges to the
//! model provider.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::error::GatewayError;
use crate::AppContext;

/// Base64 payload cap, in characters.
const MAX_BASE64_CHARS: usize = 8_000_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeRequest {
    #[serde(default)]
    pub audio_base64: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

pub async fn transcribe(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<TranscribeRequest>,
) -> Response {
    if body.audio_base64.is_empty() {
        return GatewayError::Validation("audioBase64 is required".into()).into_response();
    }
    if body.audio_base64.len() > MAX_BASE64_CHARS {
        return GatewayError::Validation(format!(
            "audioBase64 exceeds {MAX_BASE64_CHARS} characters"
        ))
        .into_response();
    }

    match ctx
        .media
        .transcribe(
            &body.audio_base64,
            body.model.as_deref(),
            body.filename.as_deref(),
            body.language.as_deref(),
        )
        .await
    {
        Ok(t) => Json(json!({ "text": t.text, "model": t.model })).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisionRequest {
    #[serde(default)]
    pub image_base64: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

pub async fn vision(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<VisionRequest>,
) -> Response {
    if body.image_base64.is_empty() {
        return GatewayError::Validation("imageBase64 is required".into()).into_response();
    }
    if body.image_base64.len() > MAX_BASE64_CHARS {
        return GatewayError::PayloadTooLarge(format!(
            "imageBase64 exceeds {MAX_BASE64_CHARS} characters"
        ))
        .into_response();
    }

    match ctx
        .media
        .vision(
            &body.image_base64,
            body.prompt.as_deref(),
            body.model.as_deref(),
            body.temperature,
            body.max_tokens,
        )
        .await
    {
        Ok(text) => Json(json!({ "result": text })).into_response(),
        Err(e) => e.into_response(),
    }
}
