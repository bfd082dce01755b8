//! `POST /api/ask` — the main reasoning entrypoint.
//!
//! Accepts either a `messages` array or a single `message` string, runs the
//! Trinity pipeline, and answers with the full result envelope. With
//! `stream: true` the translated result is delivered as SSE deltas
//! terminated by `[DONE]`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures_util::stream;
use serde::Deserialize;
use serde_json::json;

use crate::error::GatewayError;
use crate::rest::auth::AuthedUser;
use crate::trinity::{self, TrinityRequest};
use crate::AppContext;

const MAX_MESSAGES: usize = 20;
const MAX_CONTENT_CHARS: usize = 8_000;
const MAX_TOTAL_CHARS: usize = 12_000;
const DEFAULT_TEMPERATURE: f32 = 0.7;
/// Size of each SSE delta chunk, in characters.
const DELTA_CHUNK_CHARS: usize = 64;

#[derive(Debug, Deserialize)]
pub struct AskMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    #[serde(default)]
    pub messages: Option<Vec<AskMessage>>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: Option<bool>,
}

/// Validated prompt material extracted from the request body.
struct AskInput {
    prompt: String,
    memory_context: String,
    temperature: f32,
}

fn validate(body: &AskRequest) -> Result<AskInput, GatewayError> {
    let temperature = body.temperature.unwrap_or(DEFAULT_TEMPERATURE);
    if !(0.0..=2.0).contains(&temperature) {
        return Err(GatewayError::Validation(
            "temperature must be between 0.0 and 2.0".into(),
        ));
    }

    if let Some(messages) = &body.messages {
        if messages.is_empty() {
            return Err(GatewayError::Validation("messages must not be empty".into()));
        }
        if messages.len() > MAX_MESSAGES {
            return Err(GatewayError::Validation(format!(
                "at most {MAX_MESSAGES} messages are accepted"
            )));
        }
        let mut total = 0usize;
        for m in messages {
            if !matches!(m.role.as_str(), "user" | "assistant" | "system") {
                return Err(GatewayError::Validation(format!(
                    "unknown message role '{}'",
                    m.role
                )));
            }
            if m.content.chars().count() > MAX_CONTENT_CHARS {
                return Err(GatewayError::PayloadTooLarge(format!(
                    "message content exceeds {MAX_CONTENT_CHARS} characters"
                )));
            }
            total += m.content.chars().count();
        }
        if total > MAX_TOTAL_CHARS {
            return Err(GatewayError::PayloadTooLarge(format!(
                "total message content exceeds {MAX_TOTAL_CHARS} characters"
            )));
        }

        let prompt_idx = messages
            .iter()
            .rposition(|m| m.role == "user")
            .ok_or_else(|| {
                GatewayError::Validation("messages must contain a user message".into())
            })?;
        let prompt = messages[prompt_idx].content.clone();
        let memory_context = messages
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != prompt_idx)
            .map(|(_, m)| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        return Ok(AskInput {
            prompt,
            memory_context,
            temperature,
        });
    }

    match &body.message {
        Some(message) if !message.trim().is_empty() => {
            if message.chars().count() > MAX_CONTENT_CHARS {
                return Err(GatewayError::PayloadTooLarge(format!(
                    "message exceeds {MAX_CONTENT_CHARS} characters"
                )));
            }
            Ok(AskInput {
                prompt: message.clone(),
                memory_context: String::new(),
                temperature,
            })
        }
        _ => Err(GatewayError::Validation(
            "either 'messages' or 'message' is required".into(),
        )),
    }
}

/// Summarize the user's recent conversations for the intake/final stages.
/// Best effort: storage failures just yield an empty context.
async fn recalled_context(ctx: &AppContext, user_id: &str) -> String {
    const RECALL_LIMIT: u32 = 5;
    const SNIPPET_CHARS: usize = 240;

    let Some(storage) = &ctx.storage else {
        return String::new();
    };
    match storage.recent_conversations(user_id, RECALL_LIMIT).await {
        Ok(rows) => rows
            .iter()
            .rev()
            .map(|row| {
                let response: String = row.response.chars().take(SNIPPET_CHARS).collect();
                format!("previously asked: {}\npreviously answered: {}", row.prompt, response)
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Err(e) => {
            tracing::warn!(err = %e, "conversation recall failed — continuing without context");
            String::new()
        }
    }
}

pub async fn ask(
    State(ctx): State<Arc<AppContext>>,
    Extension(user): Extension<AuthedUser>,
    Json(body): Json<AskRequest>,
) -> Response {
    let input = match validate(&body) {
        Ok(input) => input,
        Err(e) => return e.into_response(),
    };

    // Single-message callers get their memory context from the stored
    // conversation history; multi-message callers already carry it inline.
    let memory_context = if input.memory_context.is_empty() {
        recalled_context(&ctx, &user.user_id).await
    } else {
        input.memory_context
    };

    let request = TrinityRequest {
        prompt: input.prompt,
        session_id: user.user_id.clone(),
        user_id: user.user_id,
        memory_context,
        model_override: body.model.clone(),
        temperature_override: Some(input.temperature),
    };

    let result = match trinity::run(&ctx, &request).await {
        Ok(result) => result,
        Err(e) => return e.into_response(),
    };

    if body.stream.unwrap_or(false) {
        // The pipeline has already produced the full translated answer;
        // deliver it in SSE delta chunks with the standard terminator.
        let text = result.result.clone();
        let chunks: Vec<String> = text
            .chars()
            .collect::<Vec<_>>()
            .chunks(DELTA_CHUNK_CHARS)
            .map(|c| c.iter().collect())
            .collect();

        let events = chunks
            .into_iter()
            .map(|delta| {
                Ok::<Event, Infallible>(
                    Event::default().data(json!({ "delta": delta }).to_string()),
                )
            })
            .chain(std::iter::once(Ok(Event::default().data("[DONE]"))));

        return Sse::new(stream::iter(events))
            .keep_alive(KeepAlive::default())
            .into_response();
    }

    Json(result).into_response()
}
