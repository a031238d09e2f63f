use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::{ChatMessage, LlmResponse};

/// Inference backend client.
///
/// One implementation per backend kind; the provider pool constructs and
/// caches one client per (kind, credential) pair.
pub trait LlmClient: Send + Sync + 'static {
    /// Backend kind name (e.g., "ollama", "groq").
    fn name(&self) -> &str;

    /// Send a chat request and receive the complete response.
    fn invoke(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<LlmResponse>>;

    /// Send a chat request and receive incremental content chunks.
    fn invoke_stream(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>>;

    /// Whether the backend is reachable and ready to serve requests.
    ///
    /// Local kinds probe the server; hosted kinds report credential presence.
    fn is_available(&self) -> BoxFuture<'_, bool>;
}
