//! Layered error model (§7). Each layer gets its own `thiserror` enum;
//! higher layers absorb lower ones with `#[from]`. The HTTP boundary maps
//! `OrchestratorError` (and its ancestors) to status codes via `IntoResponse`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Fatal at turn start — caller-supplied configuration is invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("agent_name must not be empty")]
    EmptyAgentName,
    #[error("api key missing for {0}")]
    MissingApiKey(&'static str),
    #[error("vector_dim must be >= 1, got {0}")]
    InvalidVectorDim(i64),
    #[error("environment variable {0} is missing or malformed: {1}")]
    Env(String, String),
}

/// Network-level failures talking to any provider. Retried once at the
/// gateway that issued the call; this variant represents the final,
/// unretryable failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Failures the provider itself reported.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("authentication failed")]
    Auth,
    #[error("rate limited after retries")]
    RateLimited,
    #[error("provider returned a response that could not be parsed: {0}")]
    BadResponse(String),
}

/// Errors from the vector store client (§4.3, §7).
#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("collection '{0}' already exists with a different vector dimension")]
    DimensionConflict(String),
    #[error("collection '{0}' does not exist")]
    CollectionMissing(String),
    #[error("store returned an unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("limit {0} exceeds the store's page-size cap of {1}")]
    LimitTooLarge(usize, usize),
}

/// Errors from the embedding gateway (§4.2).
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("provider returned {got}-dimensional vectors, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Errors surfaced by the action executor (§4.9). `ToolExecError` is
/// deliberately not fatal — callers record it in a Step and keep going.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("tool execution failed: {0}")]
    ToolExecError(String),
}

/// Top-level errors the orchestrator (and HTTP boundary) deal with.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error("an FSM-selected state was outside the candidate set after re-ask: {0}")]
    FsmViolation(String),
    #[error("malformed ChatML role: {0}")]
    InvalidChatRole(String),
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = match &self {
            OrchestratorError::Config(_) | OrchestratorError::InvalidChatRole(_) => {
                StatusCode::BAD_REQUEST
            }
            OrchestratorError::Provider(ProviderError::Auth) => StatusCode::UNAUTHORIZED,
            OrchestratorError::VectorStore(VectorStoreError::DimensionConflict(_)) => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Never echo raw provider text that might embed an API key; the
        // Display impls above are written to avoid that, but keep this
        // boundary explicit rather than forwarding `self` unexamined.
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_maps_to_bad_request() {
        let err = OrchestratorError::Config(ConfigError::EmptyAgentName);
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
