use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use lattice_core::error::{LatticeError, Result};
use lattice_core::traits::LlmClient;
use lattice_core::types::{ChatMessage, LlmResponse, Role};

use crate::streaming::NdjsonParser;

const TAGS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for a locally hosted Ollama server.
pub struct OllamaClient {
    http: Client,
    base_url: String,
    temperature: f32,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, temperature: f32) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            temperature,
        }
    }
}

#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Deserialize, Debug)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
}

#[derive(Deserialize, Debug)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Debug)]
struct OllamaStreamChunk {
    #[serde(default)]
    message: Option<OllamaResponseMessage>,
    #[serde(default)]
    done: bool,
}

fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OllamaMessage> {
    messages
        .into_iter()
        .map(|m| OllamaMessage {
            role: match m.role {
                Role::System => "system".to_string(),
                Role::User => "user".to_string(),
                Role::Assistant => "assistant".to_string(),
            },
            content: m.content,
        })
        .collect()
}

impl LlmClient for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    fn invoke(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<LlmResponse>> {
        let model = model.to_string();

        Box::pin(async move {
            let body = OllamaChatRequest {
                model: model.clone(),
                messages: convert_messages(messages),
                stream: false,
                options: OllamaOptions {
                    temperature: self.temperature,
                },
            };

            let response = self
                .http
                .post(format!("{}/api/chat", self.base_url))
                .json(&body)
                .send()
                .await
                .map_err(|e| LatticeError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                return Err(LatticeError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let parsed: OllamaChatResponse = response
                .json()
                .await
                .map_err(|e| LatticeError::LlmRequest(e.to_string()))?;

            debug!(model = %model, "Ollama chat complete");

            Ok(LlmResponse {
                content: parsed.message.content,
                model,
            })
        })
    }

    fn invoke_stream(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        let model = model.to_string();

        Box::pin(async move {
            let body = OllamaChatRequest {
                model: model.clone(),
                messages: convert_messages(messages),
                stream: true,
                options: OllamaOptions {
                    temperature: self.temperature,
                },
            };

            let response = self
                .http
                .post(format!("{}/api/chat", self.base_url))
                .json(&body)
                .send()
                .await
                .map_err(|e| LatticeError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                return Err(LatticeError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let byte_stream = response.bytes_stream();
            let mut parser = NdjsonParser::new();

            let chunk_stream = byte_stream.flat_map(move |bytes| {
                let chunks: Vec<Result<String>> = match bytes {
                    Ok(bytes) => match std::str::from_utf8(&bytes) {
                        Ok(text) => parser
                            .feed(text)
                            .into_iter()
                            .filter_map(|line| {
                                match serde_json::from_str::<OllamaStreamChunk>(&line) {
                                    Ok(chunk) if chunk.done => None,
                                    Ok(chunk) => {
                                        chunk.message.map(|m| Ok(m.content)).filter(|c| {
                                            !matches!(c, Ok(s) if s.is_empty())
                                        })
                                    }
                                    Err(e) => {
                                        warn!(line = %line, error = %e, "Bad NDJSON chunk");
                                        None
                                    }
                                }
                            })
                            .collect(),
                        Err(_) => Vec::new(),
                    },
                    Err(e) => vec![Err(LatticeError::LlmStream(e.to_string()))],
                };
                futures::stream::iter(chunks)
            });

            Ok(Box::pin(chunk_stream) as BoxStream<'_, Result<String>>)
        })
    }

    fn is_available(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            match self
                .http
                .get(format!("{}/api/tags", self.base_url))
                .timeout(TAGS_PROBE_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) => resp.status().is_success(),
                Err(_) => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = OllamaClient::new("http://localhost:11434/", 0.7);
        assert_eq!(client.base_url, "http://localhost:11434");
    }

    #[test]
    fn message_roles_map_to_wire_names() {
        let converted = convert_messages(vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ]);
        assert_eq!(converted[0].role, "system");
        assert_eq!(converted[1].role, "user");
        assert_eq!(converted[2].role, "assistant");
    }
}
