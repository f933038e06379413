//! Embedding Gateway (§4.2): turns a list of strings into a same-length
//! list of fixed-dimension vectors via an OpenAI-compatible embeddings
//! endpoint, batching internally when the input exceeds the provider's
//! batch limit.

use std::time::Duration;

use serde_json::json;
use tracing::warn;

use crate::error::{EmbeddingError, ProviderError, TransportError};

/// Most OpenAI-compatible providers cap embeddings requests around this
/// many inputs; batch larger requests rather than failing outright.
const PROVIDER_BATCH_LIMIT: usize = 2048;

#[derive(Debug, Clone)]
pub struct EmbeddingGatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub vector_dim: usize,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct EmbeddingGateway {
    client: reqwest::Client,
    config: EmbeddingGatewayConfig,
}

impl EmbeddingGateway {
    pub fn new(config: EmbeddingGatewayConfig) -> Self {
        Self { client: reqwest::Client::new(), config }
    }

    pub fn vector_dim(&self) -> usize {
        self.config.vector_dim
    }

    /// Embed `texts`, splitting into `PROVIDER_BATCH_LIMIT`-sized chunks
    /// as needed. Order of the returned vectors matches `texts`.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(PROVIDER_BATCH_LIMIT) {
            out.extend(self.embed_batch(chunk).await?);
        }
        Ok(out)
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut result = self.embed(std::slice::from_ref(&text.to_string())).await?;
        Ok(result.remove(0))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .timeout(self.config.timeout)
            .json(&json!({
                "model": self.config.model,
                "input": texts,
                "encoding_format": "float",
            }))
            .send()
            .await
            .map_err(|e| {
                let transport = if e.is_timeout() {
                    TransportError::Timeout(self.config.timeout)
                } else {
                    TransportError::Network(e)
                };
                EmbeddingError::Provider(ProviderError::Transport(transport))
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(EmbeddingError::Provider(ProviderError::Auth));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EmbeddingError::Provider(ProviderError::RateLimited));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Provider(ProviderError::BadResponse(format!(
                "status {status}: {text}"
            ))));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Provider(ProviderError::BadResponse(e.to_string())))?;

        let data = body["data"].as_array().ok_or_else(|| {
            EmbeddingError::Provider(ProviderError::BadResponse("missing data array".to_string()))
        })?;

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let vector: Vec<f32> = item["embedding"]
                .as_array()
                .ok_or_else(|| {
                    EmbeddingError::Provider(ProviderError::BadResponse(
                        "embedding entry missing 'embedding' array".to_string(),
                    ))
                })?
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();

            if vector.len() != self.config.vector_dim {
                warn!(
                    expected = self.config.vector_dim,
                    got = vector.len(),
                    "embedding provider returned unexpected dimension"
                );
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.config.vector_dim,
                    got: vector.len(),
                });
            }
            vectors.push(vector);
        }

        if vectors.len() != texts.len() {
            return Err(EmbeddingError::Provider(ProviderError::BadResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            ))));
        }

        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EmbeddingGatewayConfig {
        EmbeddingGatewayConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            api_key: "key".to_string(),
            model: "test-embed".to_string(),
            vector_dim: 8,
            timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn embed_empty_input_returns_empty_without_a_call() {
        let gateway = EmbeddingGateway::new(config());
        let result = gateway.embed(&[]).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn embed_surfaces_transport_errors() {
        let gateway = EmbeddingGateway::new(config());
        let err = gateway.embed(&["hello".to_string()]).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Provider(ProviderError::Transport(_))));
    }
}
