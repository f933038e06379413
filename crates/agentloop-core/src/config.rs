//! Process-level configuration, loaded from the environment (§3 Config,
//! §7). Per-request `Setting` values always win over these defaults; see
//! `Setting::chat`/`Setting::embedding` for the fields these fill in.

use anyhow::{Context, Result};

use crate::model::{DEFAULT_LLM_CALL_BUDGET, DEFAULT_MAX_HISTORY_LEN};

#[derive(Debug, Clone)]
pub struct Config {
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,

    pub embedding_base_url: String,
    pub embedding_api_key: String,
    pub embedding_model: String,

    pub vector_db_url: String,

    pub http_port: u16,

    pub request_timeout_ms: u64,
    pub embedding_timeout_ms: u64,
    pub vector_store_timeout_ms: u64,

    pub default_llm_call_budget: u32,
    pub default_max_history_len: usize,

    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            llm_base_url: std::env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or_default(),
            llm_model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),

            embedding_base_url: std::env::var("EMBEDDING_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            embedding_api_key: std::env::var("EMBEDDING_API_KEY").unwrap_or_default(),
            embedding_model: std::env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),

            vector_db_url: std::env::var("VECTOR_DB_URL").unwrap_or_default(),

            http_port: std::env::var("HTTP_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("HTTP_PORT must be a valid port number")?,

            request_timeout_ms: env_u64("LLM_TIMEOUT_MS", 60_000)?,
            embedding_timeout_ms: env_u64("EMBEDDING_TIMEOUT_MS", 30_000)?,
            vector_store_timeout_ms: env_u64("VECTOR_STORE_TIMEOUT_MS", 30_000)?,

            default_llm_call_budget: std::env::var("DEFAULT_LLM_CALL_BUDGET")
                .ok()
                .map(|v| v.parse().context("DEFAULT_LLM_CALL_BUDGET must be a valid integer"))
                .transpose()?
                .unwrap_or(DEFAULT_LLM_CALL_BUDGET),

            default_max_history_len: std::env::var("DEFAULT_MAX_HISTORY_LEN")
                .ok()
                .map(|v| v.parse().context("DEFAULT_MAX_HISTORY_LEN must be a valid integer"))
                .transpose()?
                .unwrap_or(DEFAULT_MAX_HISTORY_LEN),

            log_filter: std::env::var("RUST_LOG").unwrap_or_else(|_| "agentloop=info".to_string()),
        })
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(v) => v.parse().with_context(|| format!("{key} must be a valid integer")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_uses_defaults_when_unset() {
        // Scoped to variables this test controls; doesn't assert on
        // ambient environment state set by other tests running in parallel.
        let config = Config::from_env().expect("defaults alone must parse");
        assert_eq!(config.default_llm_call_budget, DEFAULT_LLM_CALL_BUDGET);
    }
}
