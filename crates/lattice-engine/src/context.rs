use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lattice_core::config::AppConfig;
use lattice_core::error::Result;
use lattice_core::event::EventBus;
use lattice_llm::ProviderPool;
use lattice_store::{ResponseCache, SessionStore};

use crate::lock::DocumentLock;

/// Shared runtime owned by one engine instance.
///
/// All previously process-wide registries (provider client cache, response
/// cache, lock table, session store) live here, constructed once and passed
/// by reference through the graph — there are no ambient globals.
pub struct EngineContext {
    pub config: AppConfig,
    pub pool: Arc<ProviderPool>,
    pub cache: Arc<ResponseCache>,
    pub sessions: Arc<SessionStore>,
    pub lock: Arc<DocumentLock>,
    pub events: Arc<EventBus>,
}

impl EngineContext {
    /// Assemble a context from explicit parts.
    pub fn new(
        config: AppConfig,
        pool: Arc<ProviderPool>,
        cache: Arc<ResponseCache>,
        sessions: Arc<SessionStore>,
        lock: Arc<DocumentLock>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            pool,
            cache,
            sessions,
            lock,
            events,
        })
    }

    /// Build the default runtime for a configuration.
    pub fn from_config(config: AppConfig) -> Result<Arc<Self>> {
        let pool = ProviderPool::new(&config.llm, config.retry.clone());

        let cache = match &config.cache.path {
            Some(path) => ResponseCache::open(Path::new(path))?,
            None => ResponseCache::in_memory()?,
        };

        let sessions = match &config.store.path {
            Some(path) => SessionStore::open(Path::new(path), config.store.ttl_secs),
            None => SessionStore::in_memory(config.store.ttl_secs),
        };

        let lock = DocumentLock::new(Duration::from_millis(config.lock.poll_interval_ms));

        Ok(Self::new(
            config,
            pool,
            Arc::new(cache),
            Arc::new(sessions),
            Arc::new(lock),
            Arc::new(EventBus::default()),
        ))
    }
}
