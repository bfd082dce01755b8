//! Audio transcription and vision calls against the model provider.
//!
//! Separate from [`super::ModelBackend`]: these are single-shot media
//! endpoints with their own wire shapes, not part of the reasoning
//! pipeline's budgeted call surface.

use base64::Engine;
use serde_json::{json, Value};

use crate::config::GatewayConfig;
use crate::error::GatewayError;

const DEFAULT_TRANSCRIBE_MODEL: &str = "whisper-1";
const TRANSCRIBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

pub struct MediaClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    vision_model: String,
}

#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub model: String,
}

impl MediaClient {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.model_base_url.trim_end_matches('/').to_string(),
            api_key: config.model_api_key.clone(),
            vision_model: config.model.clone(),
        }
    }

    /// Transcribe base64-encoded audio. Size caps are enforced by the HTTP
    /// layer before the payload reaches this call.
    pub async fn transcribe(
        &self,
        audio_base64: &str,
        model: Option<&str>,
        filename: Option<&str>,
        language: Option<&str>,
    ) -> Result<Transcription, GatewayError> {
        let audio = base64::engine::general_purpose::STANDARD
            .decode(audio_base64)
            .map_err(|_| GatewayError::Validation("audioBase64 is not valid base64".into()))?;

        let model = model.unwrap_or(DEFAULT_TRANSCRIBE_MODEL).to_string();
        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio)
                    .file_name(filename.unwrap_or("audio.webm").to_string()),
            )
            .text("model", model.clone());
        if let Some(language) = language {
            form = form.text("language", language.to_string());
        }

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .timeout(TRANSCRIBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("transcription: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamUnavailable(format!(
                "transcription returned {status}: {detail}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("transcription body: {e}")))?;
        let text = body
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Transcription { text, model })
    }

    /// Describe a base64-encoded image via a chat call carrying a data URL.
    pub async fn vision(
        &self,
        image_base64: &str,
        prompt: Option<&str>,
        model: Option<&str>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<String, GatewayError> {
        let model = model.unwrap_or(&self.vision_model);
        let body = json!({
            "model": model,
            "temperature": temperature.unwrap_or(0.2),
            "max_tokens": max_tokens.unwrap_or(1024),
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt.unwrap_or("Describe this image.") },
                    { "type": "image_url",
                      "image_url": { "url": format!("data:image/png;base64,{image_base64}") } }
                ]
            }]
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(TRANSCRIBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("vision: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamUnavailable(format!(
                "vision returned {status}: {detail}"
            )));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("vision body: {e}")))?;
        Ok(parsed["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }
}
