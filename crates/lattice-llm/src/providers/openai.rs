use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use lattice_core::error::{LatticeError, Result};
use lattice_core::traits::LlmClient;
use lattice_core::types::{ChatMessage, LlmResponse, Role};

use crate::streaming::SseStream;

pub const GROQ_API_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
pub const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// OpenAI-compatible hosted client. Works with Groq, OpenRouter, and any
/// backend speaking the chat-completions wire format.
///
/// One instance is bound to one credential; the pool constructs an instance
/// per (kind, credential-index) pair.
pub struct OpenAiCompatClient {
    http: Client,
    name: String,
    url: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiCompatClient {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        api_key: impl Into<String>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            http: Client::new(),
            name: name.into(),
            url: url.into(),
            api_key: api_key.into(),
            max_tokens,
            temperature,
        }
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct OaiMessage {
    role: String,
    content: String,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OaiMessage> {
    messages
        .into_iter()
        .map(|m| OaiMessage {
            role: match m.role {
                Role::System => "system".to_string(),
                Role::User => "user".to_string(),
                Role::Assistant => "assistant".to_string(),
            },
            content: m.content,
        })
        .collect()
}

impl LlmClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<LlmResponse>> {
        let model = model.to_string();

        Box::pin(async move {
            let body = ChatRequest {
                model: model.clone(),
                messages: convert_messages(messages),
                max_tokens: self.max_tokens,
                temperature: Some(self.temperature),
                stream: false,
            };

            let response = self
                .http
                .post(&self.url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| LatticeError::LlmRequest(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                // 429s get their own variant so the retry layer can rotate keys.
                if status.as_u16() == 429 {
                    return Err(LatticeError::RateLimited(format!("HTTP 429: {}", body)));
                }
                return Err(LatticeError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| LatticeError::LlmRequest(e.to_string()))?;

            let content = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| {
                    LatticeError::LlmRequest(format!("{}: empty choices in response", self.name))
                })?;

            debug!(provider = %self.name, model = %model, "Chat completion received");

            Ok(LlmResponse { content, model })
        })
    }

    fn invoke_stream(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        let model = model.to_string();

        Box::pin(async move {
            let body = ChatRequest {
                model,
                messages: convert_messages(messages),
                max_tokens: self.max_tokens,
                temperature: Some(self.temperature),
                stream: true,
            };

            let response = self
                .http
                .post(&self.url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| LatticeError::LlmRequest(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                if status.as_u16() == 429 {
                    return Err(LatticeError::RateLimited(format!("HTTP 429: {}", body)));
                }
                return Err(LatticeError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let sse_stream = SseStream::new(response.bytes_stream());

            let chunk_stream = sse_stream.filter_map(|event| async move {
                if event.data.trim() == "[DONE]" {
                    return None;
                }
                match serde_json::from_str::<StreamChunk>(&event.data) {
                    Ok(chunk) => chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .filter(|c| !c.is_empty())
                        .map(Ok),
                    Err(e) => Some(Err(LatticeError::LlmStream(e.to_string()))),
                }
            });

            Ok(Box::pin(chunk_stream) as BoxStream<'_, Result<String>>)
        })
    }

    fn is_available(&self) -> BoxFuture<'_, bool> {
        // Hosted kinds: availability = a credential is configured.
        let available = !self.api_key.is_empty();
        Box::pin(async move { available })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn availability_tracks_credential_presence() {
        let with_key = OpenAiCompatClient::new("groq", GROQ_API_URL, "gsk_test", 4096, 0.7);
        assert!(with_key.is_available().await);

        let without_key = OpenAiCompatClient::new("groq", GROQ_API_URL, "", 4096, 0.7);
        assert!(!without_key.is_available().await);
    }

    #[test]
    fn stream_chunk_parses_delta_content() {
        let data = r#"{"choices":[{"delta":{"content":"hel"}}]}"#;
        let chunk: StreamChunk = serde_json::from_str(data).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hel"));
    }
}
