use std::time::Duration;

use tracing::{info, warn};

use lattice_core::config::RetryConfig;
use lattice_core::error::{LatticeError, Result};
use lattice_core::types::{ChatMessage, LlmResponse};

use crate::pool::{ProviderHandle, ProviderKind};

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = (config.initial_backoff_ms * 2u64.pow(attempt)).min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl ProviderHandle {
    /// Invoke with automatic credential rotation and backoff on rate limits.
    ///
    /// A rate-limited response evicts the cached client for the current
    /// credential, sleeps with exponential backoff, and retries on a freshly
    /// constructed handle (which advances the rotation cursor). Non-rate-limit
    /// errors, and pools with a single credential, propagate immediately.
    /// Exhausting the retry ceiling returns the last error.
    pub async fn invoke_with_retry(&self, messages: Vec<ChatMessage>) -> Result<LlmResponse> {
        let retry = self.pool.retry_config().clone();
        let rotatable =
            self.kind != ProviderKind::Ollama && self.pool.credential_count(self.kind) > 1;

        let mut current = self.clone();
        let mut last_err: Option<LatticeError> = None;

        for attempt in 0..=retry.max_retries {
            match current.invoke(messages.clone()).await {
                Ok(response) => {
                    if attempt > 0 {
                        info!(
                            kind = %current.kind,
                            key_index = current.key_index,
                            attempt,
                            "Request succeeded after credential rotation"
                        );
                    }
                    return Ok(response);
                }
                Err(e) => {
                    if !e.is_rate_limited() || !rotatable {
                        return Err(e);
                    }
                    self.pool.record_rate_limit(current.kind, current.key_index);
                    self.pool.evict(current.kind, current.key_index);

                    if attempt >= retry.max_retries {
                        last_err = Some(e);
                        break;
                    }

                    let backoff = calculate_backoff(attempt, &retry);
                    warn!(
                        kind = %current.kind,
                        key_index = current.key_index,
                        attempt = attempt + 1,
                        max_retries = retry.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Rate limit hit, rotating credential"
                    );
                    tokio::time::sleep(backoff).await;
                    last_err = Some(e);
                    current = self.pool.handle_for(current.kind, &current.model)?;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| LatticeError::LlmRequest("all retry attempts exhausted".into())))
    }
}
