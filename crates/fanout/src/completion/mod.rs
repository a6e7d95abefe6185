//! Completion API abstraction.
//!
//! The executor only sees [`CompletionClient`]; [`openai::OpenAiClient`] is the
//! shipped implementation for OpenAI-compatible chat endpoints.

pub mod openai;

use serde_json::{json, Value};
use thiserror::Error;

pub use openai::OpenAiClient;

/// Version tag of the normalized response layout stored with each result.
pub const NORMALIZE_VERSION: &str = "v1.0";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    #[error("Completion request failed: {0}")]
    Transport(String),

    #[error("Completion request timed out")]
    Timeout,

    #[error("Completion API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid completion response: {0}")]
    InvalidResponse(String),

    #[error("Failed to build completion request: {0}")]
    Request(String),
}

/// One piece of user content sent to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    Image {
        media_type: String,
        data_base64: String,
    },
}

impl ContentPart {
    pub fn data_url(media_type: &str, data_base64: &str) -> String {
        format!("data:{};base64,{}", media_type, data_base64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub model: String,
    pub parts: Vec<ContentPart>,
    pub max_tokens: u32,
}

impl CompletionRequest {
    /// Request summary stored alongside each response. Image bytes are
    /// replaced by their media type and encoded length.
    pub fn echo(&self) -> Value {
        let content: Vec<Value> = self
            .parts
            .iter()
            .map(|part| match part {
                ContentPart::Text(text) => json!({ "type": "text", "text": text }),
                ContentPart::Image {
                    media_type,
                    data_base64,
                } => json!({
                    "type": "image",
                    "media_type": media_type,
                    "encoded_length": data_base64.len(),
                }),
            })
            .collect();
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "content": content,
        })
    }
}

/// A successful completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub provider: String,
    pub model: String,
    pub text: String,
    pub tokens_used: u64,
    /// Provider response body as received.
    pub raw: Value,
}

impl Completion {
    /// Provider-independent layout persisted as the unit's response data.
    pub fn normalized(&self) -> Value {
        json!({
            "provider": self.provider,
            "version": NORMALIZE_VERSION,
            "model": self.model,
            "tokens": self.tokens_used,
            "content": self.text,
            "raw": self.raw,
        })
    }
}

pub trait CompletionClient: Send + Sync {
    /// Sends one request. Blocking; called from worker threads only.
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_elides_image_bytes() {
        let request = CompletionRequest {
            model: "gpt-4o-mini".to_string(),
            parts: vec![
                ContentPart::Text("Describe".to_string()),
                ContentPart::Image {
                    media_type: "image/png".to_string(),
                    data_base64: "QUJD".to_string(),
                },
            ],
            max_tokens: 500,
        };
        let echo = request.echo();
        assert_eq!(echo["model"], "gpt-4o-mini");
        assert_eq!(echo["content"][0]["text"], "Describe");
        assert_eq!(echo["content"][1]["encoded_length"], 4);
        assert!(echo["content"][1].get("data_base64").is_none());
    }

    #[test]
    fn test_normalized_layout() {
        let completion = Completion {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            text: "Hi".to_string(),
            tokens_used: 12,
            raw: json!({"id": "x"}),
        };
        let value = completion.normalized();
        assert_eq!(value["version"], "v1.0");
        assert_eq!(value["tokens"], 12);
        assert_eq!(value["content"], "Hi");
        assert_eq!(value["raw"]["id"], "x");
    }

    #[test]
    fn test_data_url() {
        assert_eq!(
            ContentPart::data_url("image/jpeg", "AAA"),
            "data:image/jpeg;base64,AAA"
        );
    }
}
