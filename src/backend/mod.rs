//! Model backend adapter.
//!
//! One uniform call surface for chat completion and schema-constrained
//! reasoning. The orchestrator and stage runners only see [`ModelBackend`];
//! the production implementation speaks the OpenAI-compatible chat
//! completions wire format over `reqwest`, with a fallback model and a
//! circuit breaker in front.

pub mod breaker;
pub mod media;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use breaker::CircuitBreaker;

// ─── Request / response types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A single backend invocation.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Requested model; the backend may serve a fallback instead.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Reasoning effort hint ("high" for complex/critical reasoning).
    pub reasoning_effort: Option<String>,
    /// Schema-constrained decoding: the response must validate against this
    /// JSON schema and arrives as raw JSON text.
    pub response_schema: Option<Value>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>, temperature: f32) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature,
            max_tokens: None,
            reasoning_effort: None,
            response_schema: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Result of one backend invocation.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    /// Model that actually served the call.
    pub model: String,
    /// True when the fallback model served the call.
    pub fallback: bool,
    pub usage: Usage,
    pub response_id: String,
    /// Upstream creation timestamp (epoch seconds).
    pub created: i64,
}

// ─── Trait ────────────────────────────────────────────────────────────────────

/// Uniform, cancel-aware call surface over the remote model provider.
///
/// `timeout` is the per-stage soft deadline — the remaining watchdog budget
/// at call entry. Implementations must give up (and abort the in-flight
/// request, best effort) once it elapses.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn chat(&self, req: ChatRequest, timeout: Duration) -> Result<ChatOutcome, GatewayError>;

    /// Streaming chat for the interactive ask surface. Deltas are pushed
    /// into `tx` as they arrive; the final outcome carries the assembled
    /// text and usage.
    async fn chat_stream(
        &self,
        req: ChatRequest,
        timeout: Duration,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatOutcome, GatewayError>;
}

// ─── OpenAI-compatible implementation ─────────────────────────────────────────

/// Production backend speaking the chat completions wire format.
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    fallback_model: String,
    breaker: CircuitBreaker,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    created: i64,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct WireDelta {
    choices: Vec<WireDeltaChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    created: Option<i64>,
}

#[derive(Deserialize)]
struct WireDeltaChoice {
    delta: WireDeltaContent,
}

#[derive(Deserialize, Default)]
struct WireDeltaContent {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiBackend {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.model_base_url.trim_end_matches('/').to_string(),
            api_key: config.model_api_key.clone(),
            fallback_model: config.fallback_model.clone(),
            breaker: CircuitBreaker::new("model-backend"),
        }
    }

    fn body(&self, req: &ChatRequest, model: &str, stream: bool) -> Value {
        let mut body = json!({
            "model": model,
            "messages": req.messages,
            "temperature": req.temperature,
            "stream": stream,
        });
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(effort) = &req.reasoning_effort {
            body["reasoning_effort"] = json!(effort);
        }
        if let Some(schema) = &req.response_schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "structured_output",
                    "strict": true,
                    "schema": schema,
                }
            });
        }
        body
    }

    async fn post_once(
        &self,
        req: &ChatRequest,
        model: &str,
        timeout: Duration,
    ) -> Result<ChatOutcome, GatewayError> {
        if timeout.is_zero() {
            return Err(GatewayError::UpstreamUnavailable(
                "no watchdog budget left for a backend call".into(),
            ));
        }

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.body(req, model, false))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("model backend: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamUnavailable(format!(
                "model backend returned {status}: {detail}"
            )));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("malformed backend body: {e}")))?;

        let content = wire
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        let active_model = if wire.model.is_empty() {
            model.to_string()
        } else {
            wire.model
        };

        Ok(ChatOutcome {
            content,
            fallback: active_model != req.model,
            model: active_model,
            usage: wire.usage,
            response_id: wire.id,
            created: wire.created,
        })
    }

    /// Primary model first; one attempt on the fallback model when the
    /// primary is unavailable. No retry loops beyond that — every call is
    /// budgeted by the request.
    async fn call_with_fallback(
        &self,
        req: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatOutcome, GatewayError> {
        if !self.breaker.is_allowed().await {
            return Err(GatewayError::UpstreamUnavailable(
                "model backend circuit open".into(),
            ));
        }

        match self.post_once(req, &req.model, timeout).await {
            Ok(outcome) => {
                self.breaker.record_success().await;
                Ok(outcome)
            }
            Err(primary_err) => {
                if self.fallback_model == req.model {
                    self.breaker.record_failure().await;
                    return Err(primary_err);
                }
                warn!(
                    model = %req.model,
                    fallback = %self.fallback_model,
                    err = %primary_err,
                    "primary model failed — trying fallback"
                );
                match self.post_once(req, &self.fallback_model, timeout).await {
                    Ok(mut outcome) => {
                        self.breaker.record_success().await;
                        outcome.fallback = true;
                        Ok(outcome)
                    }
                    Err(fallback_err) => {
                        self.breaker.record_failure().await;
                        Err(fallback_err)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    async fn chat(&self, req: ChatRequest, timeout: Duration) -> Result<ChatOutcome, GatewayError> {
        debug!(model = %req.model, messages = req.messages.len(), "backend chat call");
        self.call_with_fallback(&req, timeout).await
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
        timeout: Duration,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatOutcome, GatewayError> {
        if !self.breaker.is_allowed().await {
            return Err(GatewayError::UpstreamUnavailable(
                "model backend circuit open".into(),
            ));
        }

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.body(&req, &req.model, true))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("model backend: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            self.breaker.record_failure().await;
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamUnavailable(format!(
                "model backend returned {status}: {detail}"
            )));
        }

        // SSE body: one `data: {json}` line per delta, `data: [DONE]` last.
        let mut assembled = String::new();
        let mut usage = Usage::default();
        let mut response_id = String::new();
        let mut active_model = req.model.clone();
        let mut created = 0i64;
        let mut buffer = String::new();

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk =
                chunk.map_err(|e| GatewayError::UpstreamUnavailable(format!("stream: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);

                let Some(payload) = line.strip_prefix("data: ") else {
                    continue;
                };
                if payload == "[DONE]" {
                    buffer.clear();
                    break;
                }
                let Ok(delta) = serde_json::from_str::<WireDelta>(payload) else {
                    continue;
                };
                if let Some(id) = delta.id {
                    response_id = id;
                }
                if let Some(model) = delta.model {
                    active_model = model;
                }
                if let Some(ts) = delta.created {
                    created = ts;
                }
                if let Some(u) = delta.usage {
                    usage = u;
                }
                for choice in delta.choices {
                    if let Some(text) = choice.delta.content {
                        if !text.is_empty() {
                            assembled.push_str(&text);
                            // Receiver gone means the client disconnected;
                            // stop reading the upstream stream.
                            if tx.send(text).await.is_err() {
                                self.breaker.record_success().await;
                                return Ok(ChatOutcome {
                                    content: assembled,
                                    fallback: active_model != req.model,
                                    model: active_model,
                                    usage,
                                    response_id,
                                    created,
                                });
                            }
                        }
                    }
                }
            }
        }

        self.breaker.record_success().await;
        Ok(ChatOutcome {
            content: assembled,
            fallback: active_model != req.model,
            model: active_model,
            usage,
            response_id,
            created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roles_serialize_lowercase() {
        let m = ChatMessage::system("x");
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["role"], "system");
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total.add(&Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        total.add(&Usage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
        });
        assert_eq!(total.total_tokens, 18);
        assert_eq!(total.prompt_tokens, 11);
    }

    #[test]
    fn schema_request_sets_response_format() {
        let backend = OpenAiBackend {
            client: reqwest::Client::new(),
            base_url: "http://localhost".into(),
            api_key: String::new(),
            fallback_model: "small".into(),
            breaker: CircuitBreaker::new("t"),
        };
        let mut req = ChatRequest::new("big", vec![ChatMessage::user("q")], 0.2);
        req.response_schema = Some(serde_json::json!({"type": "object"}));
        let body = backend.body(&req, "big", false);
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
    }

    #[test]
    fn effort_hint_is_optional() {
        let backend = OpenAiBackend {
            client: reqwest::Client::new(),
            base_url: "http://localhost".into(),
            api_key: String::new(),
            fallback_model: "small".into(),
            breaker: CircuitBreaker::new("t"),
        };
        let req = ChatRequest::new("big", vec![ChatMessage::user("q")], 0.2);
        let body = backend.body(&req, "big", false);
        assert!(body.get("reasoning_effort").is_none());
    }
}
