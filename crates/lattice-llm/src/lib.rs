pub mod pool;
pub mod providers;
pub mod retry;
pub mod streaming;

pub use pool::{PoolStatus, ProviderHandle, ProviderKind, ProviderPool};
pub use providers::ollama::OllamaClient;
pub use providers::openai::OpenAiCompatClient;
