use thiserror::Error;

#[derive(Debug, Error)]
pub enum LatticeError {
    // Provider errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    // Graph / step errors
    #[error("Step failed: {step}: {message}")]
    Step { step: String, message: String },

    // Lock errors
    #[error("Lock timeout after {timeout_secs}s: {resource}")]
    LockTimeout { resource: String, timeout_secs: u64 },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Store error: {0}")]
    Store(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LatticeError {
    /// Whether this error was classified as a rate limit by the provider layer,
    /// or carries one of the usual "too many requests" markers in its message.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            LatticeError::RateLimited(_) => true,
            LatticeError::LlmRequest(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("429")
                    || msg.contains("rate limit")
                    || msg.contains("rate_limit")
                    || msg.contains("too many requests")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LatticeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_classification() {
        assert!(LatticeError::RateLimited("quota".into()).is_rate_limited());
        assert!(LatticeError::LlmRequest("HTTP 429: slow down".into()).is_rate_limited());
        assert!(LatticeError::LlmRequest("Too Many Requests".into()).is_rate_limited());
        assert!(!LatticeError::LlmRequest("HTTP 500: boom".into()).is_rate_limited());
        assert!(!LatticeError::Config("bad".into()).is_rate_limited());
    }
}
