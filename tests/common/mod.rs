//! Shared fixtures: a scripted model backend that recognizes each pipeline
//! stage by its request shape, and a ready-made application context.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use trinityd::backend::{ChatOutcome, ChatRequest, ModelBackend, Role, Usage};
use trinityd::config::GatewayConfig;
use trinityd::error::GatewayError;
use trinityd::AppContext;

const LEDGER_JSON: &str = r#"{
    "reasoning_steps": ["inspect the request", "derive the answer"],
    "assumptions": ["the prompt is complete"],
    "constraints": [],
    "tradeoffs": [],
    "alternatives_considered": ["answer directly"],
    "chosen_path_justification": "shortest correct path",
    "final_answer": "the derived answer"
}"#;

const HIGH_AUDIT: &str =
    r#"{"clarity":4,"leverage":4,"efficiency":4,"alignment":4,"resilience":4,"overall":4}"#;

/// Backend that answers intake/reasoning/reflection/audit/final calls with
/// canned content, keyed off the request shape rather than call order.
pub struct PipelineBackend {
    /// Model reported as active; set it to something other than the
    /// requested model to simulate a downgrade.
    pub active_model: String,
    /// Audit responses, consumed in order; empty falls back to a high score.
    audits: Mutex<Vec<String>>,
    pub calls: AtomicUsize,
}

impl PipelineBackend {
    pub fn new() -> Self {
        Self {
            active_model: "gpt-4.1".to_string(),
            audits: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_audit_scores(scores: &[&str]) -> Self {
        let backend = Self::new();
        *backend.audits.lock().unwrap() = scores.iter().map(|s| s.to_string()).collect();
        backend
    }

    fn classify(&self, req: &ChatRequest) -> String {
        if req.response_schema.is_some() {
            return LEDGER_JSON.to_string();
        }
        let system = req
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        if system.contains("reasoning auditor") {
            let mut audits = self.audits.lock().unwrap();
            return if audits.is_empty() {
                HIGH_AUDIT.to_string()
            } else {
                audits.remove(0)
            };
        }
        if system.contains("Critique") {
            return "no structural flaws found".to_string();
        }
        if req.messages.len() == 4 {
            // Final synthesis: echo the draft so markers survive.
            return req.messages[2].content.clone();
        }
        // Intake framing.
        let user = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        format!("framed request: {user}")
    }
}

#[async_trait]
impl ModelBackend for PipelineBackend {
    async fn chat(&self, req: ChatRequest, _timeout: Duration) -> Result<ChatOutcome, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = self.classify(&req);
        Ok(ChatOutcome {
            content,
            fallback: self.active_model != req.model,
            model: self.active_model.clone(),
            usage: Usage {
                prompt_tokens: 20,
                completion_tokens: 30,
                total_tokens: 50,
            },
            response_id: "resp-fixture".to_string(),
            created: 1_750_000_000,
        })
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
        timeout: Duration,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatOutcome, GatewayError> {
        let outcome = self.chat(req, timeout).await?;
        let _ = tx.send(outcome.content.clone()).await;
        Ok(outcome)
    }
}

pub fn test_config() -> GatewayConfig {
    std::env::remove_var("AUTH_MODE");
    GatewayConfig::new(None, None, None).expect("test config")
}

pub fn context_with(backend: Arc<dyn ModelBackend>) -> Arc<AppContext> {
    Arc::new(AppContext::new(test_config(), backend))
}

#[allow(dead_code)]
pub fn context() -> Arc<AppContext> {
    context_with(Arc::new(PipelineBackend::new()))
}
