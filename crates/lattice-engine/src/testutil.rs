use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use lattice_core::config::{AppConfig, BackendMode};
use lattice_core::error::Result;
use lattice_core::event::EventBus;
use lattice_core::traits::LlmClient;
use lattice_core::types::{ChatMessage, LlmResponse};
use lattice_llm::ProviderPool;
use lattice_store::{ResponseCache, SessionStore};

use crate::context::EngineContext;
use crate::lock::DocumentLock;

/// Backend stub that always answers with the same content and counts calls.
pub(crate) struct StaticClient {
    content: String,
    calls: Arc<AtomicUsize>,
}

impl LlmClient for StaticClient {
    fn name(&self) -> &str {
        "static"
    }

    fn invoke(
        &self,
        model: &str,
        _messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<LlmResponse>> {
        let model = model.to_string();
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(LlmResponse {
                content: self.content.clone(),
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

fn assemble(config: AppConfig, pool: Arc<ProviderPool>) -> Arc<EngineContext> {
    let poll = Duration::from_millis(config.lock.poll_interval_ms);
    EngineContext::new(
        config,
        pool,
        Arc::new(ResponseCache::in_memory().expect("in-memory cache")),
        Arc::new(SessionStore::in_memory(3600)),
        Arc::new(DocumentLock::new(poll)),
        Arc::new(EventBus::default()),
    )
}

/// Context whose provider pool cannot serve any model: the reasoning model is
/// pinned to a hosted kind with no credentials configured.
pub(crate) fn test_context() -> Arc<EngineContext> {
    let mut config = AppConfig::default();
    config.llm.mode = BackendMode::Hosted;
    config.llm.model_reasoning = "openrouter/unconfigured".to_string();
    config.lock.poll_interval_ms = 10;
    config.gate.poll_interval_ms = 10;
    let pool = ProviderPool::new(&config.llm, config.retry.clone());
    assemble(config, pool)
}

/// Context with a mock backend that always answers `content`; returns the
/// call counter alongside.
pub(crate) fn counting_context(content: &str) -> (Arc<EngineContext>, Arc<AtomicUsize>) {
    let mut config = AppConfig::default();
    config.llm.mode = BackendMode::Hosted;
    config.llm.groq_api_keys = vec!["test-key".to_string()];
    config.lock.poll_interval_ms = 10;
    config.gate.poll_interval_ms = 10;

    let calls = Arc::new(AtomicUsize::new(0));
    let content = content.to_string();
    let calls_factory = calls.clone();
    let pool = ProviderPool::with_factory(
        &config.llm,
        config.retry.clone(),
        Box::new(move |_, _| {
            Arc::new(StaticClient {
                content: content.clone(),
                calls: calls_factory.clone(),
            })
        }),
    );

    (assemble(config, pool), calls)
}
