//! Client for OpenAI-compatible `/chat/completions` endpoints.

use std::time::Duration;

use reqwest::blocking::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use super::{Completion, CompletionClient, CompletionError, CompletionRequest, ContentPart};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const PROVIDER: &str = "openai";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: SecretString,
}

impl OpenAiClient {
    /// Builds a client whose calls are bounded by `timeout`.
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        timeout: Duration,
    ) -> Result<Self, CompletionError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|e| CompletionError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// Chat request body for a single user message.
pub fn request_body(request: &CompletionRequest) -> Value {
    let content: Vec<Value> = request
        .parts
        .iter()
        .map(|part| match part {
            ContentPart::Text(text) => json!({ "type": "text", "text": text }),
            ContentPart::Image {
                media_type,
                data_base64,
            } => json!({
                "type": "image_url",
                "image_url": { "url": ContentPart::data_url(media_type, data_base64) },
            }),
        })
        .collect();

    json!({
        "model": request.model,
        "messages": [{ "role": "user", "content": content }],
        "max_tokens": request.max_tokens,
    })
}

/// Extracts the completion from a chat response body.
pub fn parse_response(body: Value, requested_model: &str) -> Result<Completion, CompletionError> {
    let text = body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| CompletionError::InvalidResponse("missing choices[0].message.content".to_string()))?
        .to_string();
    let tokens_used = body
        .pointer("/usage/total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or(requested_model)
        .to_string();

    Ok(Completion {
        provider: PROVIDER.to_string(),
        model,
        text,
        tokens_used,
        raw: body,
    })
}

impl CompletionClient for OpenAiClient {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        let _span = tracing::info_span!("completion.openai", model = %request.model).entered();

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.api_key.expose_secret())
            .json(&request_body(request))
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::Timeout
                } else {
                    CompletionError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            log::warn!("Completion API returned {}: {}", status, body);
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().map_err(|e| {
            if e.is_timeout() {
                CompletionError::Timeout
            } else {
                CompletionError::InvalidResponse(e.to_string())
            }
        })?;

        parse_response(body, &request.model)
    }
}
