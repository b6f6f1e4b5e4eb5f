// Engine configuration from environment variables

use std::path::PathBuf;

/// Runtime configuration, read once at startup
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the single-file store
    pub store_path: PathBuf,
    pub bind_addr: String,
    /// OpenAI-compatible endpoint; enrichment is disabled when unset
    pub llm_provider_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_workers: usize,
    pub llm_queue_capacity: usize,
    /// Anthropic key enables the fallback provider
    pub anthropic_api_key: Option<String>,
}

impl EngineConfig {
    /// Read configuration from the environment, applying defaults
    pub fn from_env() -> Self {
        Self {
            store_path: std::env::var("STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_store_path()),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:5620".to_string()),
            llm_provider_url: std::env::var("LLM_PROVIDER_URL").ok(),
            llm_api_key: std::env::var("LLM_API_KEY").ok(),
            llm_model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            llm_workers: env_usize("LLM_WORKERS", 2),
            llm_queue_capacity: env_usize("LLM_QUEUE_CAPACITY", 256),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("procmine")
        .join("state.db")
}
