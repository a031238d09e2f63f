use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, warn};

use lattice_core::config::{BackendMode, LlmConfig, RetryConfig};
use lattice_core::error::{LatticeError, Result};
use lattice_core::traits::LlmClient;
use lattice_core::types::{ChatMessage, LlmResponse};

use crate::providers::ollama::OllamaClient;
use crate::providers::openai::{OpenAiCompatClient, GROQ_API_URL, OPENROUTER_API_URL};

/// Backend kind. Closed set, resolved once per handle construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Ollama,
    Groq,
    OpenRouter,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Ollama => write!(f, "ollama"),
            ProviderKind::Groq => write!(f, "groq"),
            ProviderKind::OpenRouter => write!(f, "openrouter"),
        }
    }
}

/// Constructor closure for backend clients: (kind, api key) → client.
/// The default factory builds real HTTP clients; tests inject mocks.
pub type ClientFactory = dyn Fn(ProviderKind, &str) -> Arc<dyn LlmClient> + Send + Sync;

/// Ordered credentials for one hosted kind, with the round-robin cursor and
/// per-credential rate-limit counters. The cursor lives for the process
/// lifetime.
struct CredentialSet {
    keys: Vec<String>,
    cursor: usize,
    rate_limit_hits: Vec<u64>,
}

impl CredentialSet {
    fn new(keys: Vec<String>) -> Self {
        let keys: Vec<String> = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        let hits = vec![0; keys.len()];
        Self {
            keys,
            cursor: 0,
            rate_limit_hits: hits,
        }
    }

    /// Return the current key index and advance (round-robin).
    fn next_index(&mut self) -> Option<usize> {
        if self.keys.is_empty() {
            return None;
        }
        let idx = self.cursor;
        self.cursor = (self.cursor + 1) % self.keys.len();
        Some(idx)
    }
}

/// Resolves model identifiers to invocable backend handles.
///
/// Owns the credential sets, the rotation cursors, and the client cache
/// (one client per (kind, credential-index) pair). Constructed once and
/// shared through the engine context — never a process-wide global.
pub struct ProviderPool {
    mode: BackendMode,
    retry: RetryConfig,
    credentials: Mutex<HashMap<ProviderKind, CredentialSet>>,
    clients: Mutex<HashMap<(ProviderKind, usize), Arc<dyn LlmClient>>>,
    factory: Box<ClientFactory>,
}

impl ProviderPool {
    pub fn new(llm: &LlmConfig, retry: RetryConfig) -> Arc<Self> {
        let cfg = llm.clone();
        let factory: Box<ClientFactory> = Box::new(move |kind, key| match kind {
            ProviderKind::Ollama => {
                Arc::new(OllamaClient::new(&cfg.ollama_base_url, cfg.temperature))
            }
            ProviderKind::Groq => Arc::new(OpenAiCompatClient::new(
                "groq",
                GROQ_API_URL,
                key,
                cfg.max_tokens,
                cfg.temperature,
            )),
            ProviderKind::OpenRouter => Arc::new(OpenAiCompatClient::new(
                "openrouter",
                OPENROUTER_API_URL,
                key,
                cfg.max_tokens,
                cfg.temperature,
            )),
        });
        Self::with_factory(llm, retry, factory)
    }

    /// Construct with an explicit client factory (used by tests).
    pub fn with_factory(llm: &LlmConfig, retry: RetryConfig, factory: Box<ClientFactory>) -> Arc<Self> {
        let mut credentials = HashMap::new();
        credentials.insert(
            ProviderKind::Groq,
            CredentialSet::new(llm.groq_api_keys.clone()),
        );
        credentials.insert(
            ProviderKind::OpenRouter,
            CredentialSet::new(llm.openrouter_api_keys.clone()),
        );

        Arc::new(Self {
            mode: llm.mode,
            retry,
            credentials: Mutex::new(credentials),
            clients: Mutex::new(HashMap::new()),
            factory,
        })
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Resolve a model identifier to an invocable handle.
    ///
    /// A namespace prefix (`groq/…`, `openrouter/…`, `ollama/…`) forces the
    /// kind; otherwise the process-wide mode decides, with reachability and
    /// credential fallback between kinds.
    pub async fn handle(self: &Arc<Self>, model_id: &str) -> Result<ProviderHandle> {
        let (forced, model) = split_model_id(model_id);
        let kind = match forced {
            Some(kind) => kind,
            None => self.resolve_mode_kind().await,
        };
        self.handle_for(kind, model)
    }

    /// Construct a handle for an explicit kind. Advances the rotation cursor
    /// for hosted kinds (rotation is per handle construction, not per call).
    pub fn handle_for(self: &Arc<Self>, kind: ProviderKind, model: &str) -> Result<ProviderHandle> {
        let key_index = match kind {
            ProviderKind::Ollama => 0,
            _ => {
                let mut creds = self.credentials.lock().expect("credential lock poisoned");
                let set = creds.get_mut(&kind).expect("known provider kind");
                set.next_index().ok_or_else(|| {
                    LatticeError::ProviderUnavailable(format!("no API keys configured for {}", kind))
                })?
            }
        };

        let client = self.client_at(kind, key_index);
        debug!(kind = %kind, key_index, model, "Provider handle constructed");

        Ok(ProviderHandle {
            pool: Arc::clone(self),
            client,
            kind,
            key_index,
            model: model.to_string(),
        })
    }

    /// Get or build the cached client for (kind, credential-index).
    fn client_at(&self, kind: ProviderKind, key_index: usize) -> Arc<dyn LlmClient> {
        let key = match kind {
            ProviderKind::Ollama => String::new(),
            _ => {
                let creds = self.credentials.lock().expect("credential lock poisoned");
                creds.get(&kind).expect("known provider kind").keys[key_index].clone()
            }
        };

        let mut clients = self.clients.lock().expect("client cache lock poisoned");
        clients
            .entry((kind, key_index))
            .or_insert_with(|| (self.factory)(kind, &key))
            .clone()
    }

    /// Pick the backend kind for the configured mode, falling back when the
    /// preferred kind cannot serve.
    async fn resolve_mode_kind(self: &Arc<Self>) -> ProviderKind {
        match self.mode {
            BackendMode::Local => {
                let ollama = self.client_at(ProviderKind::Ollama, 0);
                if ollama.is_available().await {
                    ProviderKind::Ollama
                } else if self.credential_count(ProviderKind::Groq) > 0 {
                    warn!("Ollama is unreachable, falling back to hosted backend");
                    ProviderKind::Groq
                } else {
                    warn!("Ollama is unreachable and no hosted keys configured, proceeding anyway");
                    ProviderKind::Ollama
                }
            }
            BackendMode::Hosted => {
                if self.credential_count(ProviderKind::Groq) > 0 {
                    ProviderKind::Groq
                } else {
                    warn!("Hosted mode selected but no API keys found, falling back to Ollama");
                    ProviderKind::Ollama
                }
            }
        }
    }

    pub fn credential_count(&self, kind: ProviderKind) -> usize {
        if kind == ProviderKind::Ollama {
            return 1;
        }
        let creds = self.credentials.lock().expect("credential lock poisoned");
        creds.get(&kind).map(|s| s.keys.len()).unwrap_or(0)
    }

    /// Drop the cached client for a credential so the next checkout rebuilds it.
    pub(crate) fn evict(&self, kind: ProviderKind, key_index: usize) {
        let mut clients = self.clients.lock().expect("client cache lock poisoned");
        clients.remove(&(kind, key_index));
    }

    pub(crate) fn record_rate_limit(&self, kind: ProviderKind, key_index: usize) {
        let mut creds = self.credentials.lock().expect("credential lock poisoned");
        if let Some(set) = creds.get_mut(&kind) {
            if let Some(hits) = set.rate_limit_hits.get_mut(key_index) {
                *hits += 1;
            }
        }
    }

    /// Status snapshot for the CLI.
    pub async fn status(self: &Arc<Self>) -> PoolStatus {
        let ollama_available = self.client_at(ProviderKind::Ollama, 0).is_available().await;
        let kinds = {
            let creds = self.credentials.lock().expect("credential lock poisoned");
            let mut kinds: Vec<KindStatus> = creds
                .iter()
                .map(|(kind, set)| KindStatus {
                    kind: kind.to_string(),
                    total_keys: set.keys.len(),
                    active_key_index: set.cursor,
                    rate_limit_hits: set.rate_limit_hits.clone(),
                })
                .collect();
            kinds.sort_by(|a, b| a.kind.cmp(&b.kind));
            kinds
        };

        PoolStatus {
            mode: match self.mode {
                BackendMode::Local => "local".to_string(),
                BackendMode::Hosted => "hosted".to_string(),
            },
            ollama_available,
            kinds,
        }
    }
}

/// Pool status snapshot.
#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub mode: String,
    pub ollama_available: bool,
    pub kinds: Vec<KindStatus>,
}

#[derive(Debug, Serialize)]
pub struct KindStatus {
    pub kind: String,
    pub total_keys: usize,
    pub active_key_index: usize,
    pub rate_limit_hits: Vec<u64>,
}

/// Split an optional kind prefix off a model identifier.
fn split_model_id(model_id: &str) -> (Option<ProviderKind>, &str) {
    if let Some(rest) = model_id.strip_prefix("groq/") {
        (Some(ProviderKind::Groq), rest)
    } else if let Some(rest) = model_id.strip_prefix("openrouter/") {
        (Some(ProviderKind::OpenRouter), rest)
    } else if let Some(rest) = model_id.strip_prefix("ollama/") {
        (Some(ProviderKind::Ollama), rest)
    } else {
        (None, model_id)
    }
}

/// An invocable backend handle bound to one (kind, credential, model) triple.
#[derive(Clone)]
pub struct ProviderHandle {
    pub(crate) pool: Arc<ProviderPool>,
    pub(crate) client: Arc<dyn LlmClient>,
    pub kind: ProviderKind,
    pub key_index: usize,
    pub model: String,
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("kind", &self.kind)
            .field("key_index", &self.key_index)
            .field("model", &self.model)
            .finish()
    }
}

impl ProviderHandle {
    pub fn provider_name(&self) -> &str {
        self.client.name()
    }

    /// One request, no retry.
    pub async fn invoke(&self, messages: Vec<ChatMessage>) -> Result<LlmResponse> {
        self.client.invoke(&self.model, messages).await
    }

    /// One streaming request; yields incremental content chunks.
    pub async fn invoke_stream(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<futures::stream::BoxStream<'_, Result<String>>> {
        self.client.invoke_stream(&self.model, messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::stream::BoxStream;

    struct NullClient;

    impl LlmClient for NullClient {
        fn name(&self) -> &str {
            "null"
        }

        fn invoke(
            &self,
            model: &str,
            _messages: Vec<ChatMessage>,
        ) -> BoxFuture<'_, Result<LlmResponse>> {
            let model = model.to_string();
            Box::pin(async move {
                Ok(LlmResponse {
                    content: "{}".into(),
                    model,
                })
            })
        }

        fn invoke_stream(
            &self,
            _model: &str,
            _messages: Vec<ChatMessage>,
        ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
            Box::pin(async move {
                Ok(Box::pin(futures::stream::empty()) as BoxStream<'_, Result<String>>)
            })
        }

        fn is_available(&self) -> BoxFuture<'_, bool> {
            Box::pin(async { true })
        }
    }

    fn hosted_pool(keys: &[&str]) -> Arc<ProviderPool> {
        let llm = LlmConfig {
            mode: BackendMode::Hosted,
            groq_api_keys: keys.iter().map(|k| k.to_string()).collect(),
            ..Default::default()
        };
        ProviderPool::with_factory(
            &llm,
            RetryConfig::default(),
            Box::new(|_, _| Arc::new(NullClient)),
        )
    }

    #[tokio::test]
    async fn rotation_is_fair_across_constructions() {
        let pool = hosted_pool(&["k1", "k2", "k3"]);

        let mut counts = [0usize; 3];
        for _ in 0..9 {
            let handle = pool.handle("llama-3.3-70b-versatile").await.unwrap();
            counts[handle.key_index] += 1;
        }

        // 9 constructions over 3 credentials: each selected exactly 3 times.
        assert_eq!(counts, [3, 3, 3]);
    }

    #[tokio::test]
    async fn clients_are_cached_per_credential() {
        let pool = hosted_pool(&["k1", "k2"]);

        let a = pool.handle("m").await.unwrap();
        let b = pool.handle("m").await.unwrap();
        let a2 = pool.handle("m").await.unwrap();

        assert_eq!(a.key_index, 0);
        assert_eq!(b.key_index, 1);
        assert_eq!(a2.key_index, 0);
        // Same credential → same cached client instance.
        assert!(Arc::ptr_eq(&a.client, &a2.client));
        assert!(!Arc::ptr_eq(&a.client, &b.client));
    }

    #[tokio::test]
    async fn prefix_forces_kind() {
        let llm = LlmConfig {
            mode: BackendMode::Hosted,
            groq_api_keys: vec!["k1".into()],
            openrouter_api_keys: vec!["or1".into()],
            ..Default::default()
        };
        let pool = ProviderPool::with_factory(
            &llm,
            RetryConfig::default(),
            Box::new(|_, _| Arc::new(NullClient)),
        );

        let handle = pool.handle("openrouter/deepseek/deepseek-chat").await.unwrap();
        assert_eq!(handle.kind, ProviderKind::OpenRouter);
        assert_eq!(handle.model, "deepseek/deepseek-chat");

        let handle = pool.handle("groq/llama-3.1-8b-instant").await.unwrap();
        assert_eq!(handle.kind, ProviderKind::Groq);
        assert_eq!(handle.model, "llama-3.1-8b-instant");
    }

    #[tokio::test]
    async fn hosted_mode_without_keys_falls_back_to_local() {
        let llm = LlmConfig {
            mode: BackendMode::Hosted,
            ..Default::default()
        };
        let pool = ProviderPool::with_factory(
            &llm,
            RetryConfig::default(),
            Box::new(|_, _| Arc::new(NullClient)),
        );

        let handle = pool.handle("phi3:mini").await.unwrap();
        assert_eq!(handle.kind, ProviderKind::Ollama);
    }

    #[tokio::test]
    async fn forced_kind_without_keys_is_an_error() {
        let pool = hosted_pool(&[]);
        let err = pool.handle("openrouter/some-model").await.unwrap_err();
        assert!(matches!(err, LatticeError::ProviderUnavailable(_)));
    }

    #[test]
    fn blank_keys_are_filtered() {
        let set = CredentialSet::new(vec!["  ".into(), "k1".into(), String::new()]);
        assert_eq!(set.keys, vec!["k1"]);
    }
}
