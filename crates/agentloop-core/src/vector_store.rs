//! Vector Store Client (§4.3): creates, queries, inserts, and deletes
//! per-agent collections in an external vector database over its REST
//! API. The wire shape here follows a Weaviate-style schema/objects/graphql
//! surface (`objects`, `class`, `vectorizer: "none"`) since that is the
//! de facto REST contract §4.3's HNSW/cosine/efConstruction language
//! describes; any compliant store that exposes the same verbs works.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{TransportError, VectorStoreError};

/// §4.3: "`limit` must be ≤ 10,000." Named so call sites don't hardcode it.
pub const MAX_PAGE_LIMIT: usize = 10_000;

const HNSW_EF_CONSTRUCTION: u32 = 128;
const HNSW_MAX_CONNECTIONS: u32 = 64;

#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    pub base_url: String,
    pub timeout: Duration,
}

/// One stored object as the vector-store client sees it: opaque
/// properties plus its vector, keyed by an id the store or caller
/// assigns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: String,
    pub properties: serde_json::Map<String, Value>,
    #[serde(default)]
    pub vector: Vec<f32>,
}

/// Conjunction of tag equalities used to narrow `query_by_vector` and
/// (indirectly, via `properties.tags`) `list`.
#[derive(Debug, Clone, Default)]
pub struct TagFilter(pub Vec<String>);

impl TagFilter {
    pub fn matches(&self, tags: &[String]) -> bool {
        self.0.iter().all(|required| tags.iter().any(|t| t == required))
    }
}

/// Tracks which collections this client has confirmed exist and at what
/// vector dimension, so repeated `ensure_collection` calls for the same
/// agent don't round-trip to the store every turn. Process-wide and
/// mutex-guarded per §5.
pub struct VectorStoreClient {
    client: reqwest::Client,
    config: VectorStoreConfig,
    known_dims: Mutex<HashMap<String, usize>>,
}

impl VectorStoreClient {
    pub fn new(config: VectorStoreConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            known_dims: Mutex::new(HashMap::new()),
        }
    }

    /// Sanitize an agent name into the store's identifier rules: letters,
    /// digits, and underscores only, with a leading letter (a common
    /// requirement of class/collection identifiers in REST vector
    /// stores).
    pub fn collection_name(agent_name: &str) -> String {
        let mut sanitized: String = agent_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let needs_prefix = match sanitized.chars().next() {
            Some(c) => c.is_ascii_digit(),
            None => true,
        };
        if needs_prefix {
            sanitized = format!("a_{sanitized}");
        }
        sanitized
    }

    /// Idempotent collection creation. HNSW/cosine/efConstruction=128/
    /// maxConnections=64, vectorizer "none" (§4.3). Fails loudly with
    /// `DimensionConflict` rather than silently reusing a mismatched
    /// collection.
    pub async fn ensure_collection(&self, name: &str, vector_dim: usize) -> Result<(), VectorStoreError> {
        {
            let known = self.known_dims.lock().expect("vector store mutex poisoned");
            if let Some(&existing) = known.get(name) {
                if existing != vector_dim {
                    return Err(VectorStoreError::DimensionConflict(name.to_string()));
                }
                return Ok(());
            }
        }

        let existing_dim = self.fetch_collection_dim(name).await?;
        match existing_dim {
            Some(dim) if dim != vector_dim => {
                return Err(VectorStoreError::DimensionConflict(name.to_string()));
            }
            Some(_) => {}
            None => {
                self.create_collection(name, vector_dim).await?;
            }
        }

        self.known_dims
            .lock()
            .expect("vector store mutex poisoned")
            .insert(name.to_string(), vector_dim);
        Ok(())
    }

    async fn fetch_collection_dim(&self, name: &str) -> Result<Option<usize>, VectorStoreError> {
        let response = self
            .client
            .get(format!("{}/v1/schema/{name}", self.config.base_url))
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(map_transport)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(VectorStoreError::UnexpectedResponse(format!(
                "schema lookup returned {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| VectorStoreError::UnexpectedResponse(e.to_string()))?;
        Ok(body["vectorDim"].as_u64().map(|v| v as usize))
    }

    async fn create_collection(&self, name: &str, vector_dim: usize) -> Result<(), VectorStoreError> {
        info!(collection = %name, vector_dim, "creating vector store collection");
        let body = json!({
            "class": name,
            "vectorizer": "none",
            "vectorDim": vector_dim,
            "vectorIndexConfig": {
                "distance": "cosine",
                "efConstruction": HNSW_EF_CONSTRUCTION,
                "maxConnections": HNSW_MAX_CONNECTIONS,
            },
        });
        let response = self
            .client
            .post(format!("{}/v1/schema", self.config.base_url))
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;
        if !response.status().is_success() {
            return Err(VectorStoreError::UnexpectedResponse(format!(
                "collection create returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Upsert by id.
    pub async fn insert(
        &self,
        name: &str,
        id: &str,
        properties: serde_json::Map<String, Value>,
        vector: &[f32],
    ) -> Result<(), VectorStoreError> {
        let body = json!({
            "id": id,
            "class": name,
            "properties": properties,
            "vector": vector,
        });
        debug!(collection = %name, id = %id, "upserting object");
        let response = self
            .client
            .put(format!("{}/v1/objects/{name}/{id}", self.config.base_url))
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;
        if !response.status().is_success() {
            return Err(VectorStoreError::UnexpectedResponse(format!(
                "insert returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Remove every object in the collection but keep the collection.
    pub async fn delete_all(&self, name: &str) -> Result<(), VectorStoreError> {
        let response = self
            .client
            .delete(format!("{}/v1/objects/{name}", self.config.base_url))
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(map_transport)?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(VectorStoreError::UnexpectedResponse(format!(
                "delete_all returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Drop the collection entirely.
    pub async fn delete_collection(&self, name: &str) -> Result<(), VectorStoreError> {
        let response = self
            .client
            .delete(format!("{}/v1/schema/{name}", self.config.base_url))
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(map_transport)?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(VectorStoreError::UnexpectedResponse(format!(
                "delete_collection returned {}",
                response.status()
            )));
        }
        self.known_dims.lock().expect("vector store mutex poisoned").remove(name);
        Ok(())
    }

    /// Up to `top_k` nearest objects by cosine distance, optionally
    /// narrowed by a conjunction of tag equalities.
    pub async fn query_by_vector(
        &self,
        name: &str,
        vector: &[f32],
        top_k: usize,
        tag_filter: Option<&TagFilter>,
    ) -> Result<Vec<StoredObject>, VectorStoreError> {
        let mut body = json!({
            "vector": vector,
            "limit": top_k,
        });
        if let Some(filter) = tag_filter {
            if !filter.0.is_empty() {
                body["tagFilter"] = json!(filter.0);
            }
        }

        let response = self
            .client
            .post(format!("{}/v1/objects/{name}/query", self.config.base_url))
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(VectorStoreError::CollectionMissing(name.to_string()));
        }
        if !response.status().is_success() {
            return Err(VectorStoreError::UnexpectedResponse(format!(
                "query_by_vector returned {}",
                response.status()
            )));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| VectorStoreError::UnexpectedResponse(e.to_string()))?;
        Ok(parsed.objects)
    }

    /// Paginated scan, capped at `MAX_PAGE_LIMIT` per call (§4.3).
    pub async fn list(&self, name: &str, offset: usize, limit: usize) -> Result<Vec<StoredObject>, VectorStoreError> {
        if limit > MAX_PAGE_LIMIT {
            return Err(VectorStoreError::LimitTooLarge(limit, MAX_PAGE_LIMIT));
        }

        let response = self
            .client
            .get(format!("{}/v1/objects/{name}", self.config.base_url))
            .timeout(self.config.timeout)
            .query(&[("offset", offset.to_string()), ("limit", limit.to_string())])
            .send()
            .await
            .map_err(map_transport)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(VectorStoreError::CollectionMissing(name.to_string()));
        }
        if !response.status().is_success() {
            return Err(VectorStoreError::UnexpectedResponse(format!(
                "list returned {}",
                response.status()
            )));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| VectorStoreError::UnexpectedResponse(e.to_string()))?;
        Ok(parsed.objects)
    }
}

/// Process-wide registry of `VectorStoreClient`s keyed by `base_url`
/// (§3: `Setting.vector_db_url` may differ per agent; §5: the client
/// itself is process-wide and mutex-guarded). Agents pointed at the
/// same store share a client and its `ensure_collection` dimension
/// cache.
pub struct VectorStoreRegistry {
    timeout: Duration,
    clients: Mutex<HashMap<String, Arc<VectorStoreClient>>>,
}

impl VectorStoreRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, clients: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, base_url: &str) -> Arc<VectorStoreClient> {
        let mut clients = self.clients.lock().expect("vector store registry mutex poisoned");
        clients
            .entry(base_url.to_string())
            .or_insert_with(|| {
                Arc::new(VectorStoreClient::new(VectorStoreConfig {
                    base_url: base_url.to_string(),
                    timeout: self.timeout,
                }))
            })
            .clone()
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    objects: Vec<StoredObject>,
}

fn map_transport(err: reqwest::Error) -> VectorStoreError {
    VectorStoreError::Transport(TransportError::Network(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_name_sanitizes_non_alphanumeric() {
        assert_eq!(VectorStoreClient::collection_name("bot-one.v2"), "bot_one_v2");
    }

    #[test]
    fn collection_name_prefixes_when_leading_digit() {
        assert_eq!(VectorStoreClient::collection_name("123bot"), "a_123bot");
    }

    #[test]
    fn tag_filter_requires_every_tag_present() {
        let filter = TagFilter(vec!["state_name:greeting".to_string()]);
        assert!(filter.matches(&["state_name:greeting".to_string(), "observation_name:x".to_string()]));
        assert!(!filter.matches(&["observation_name:x".to_string()]));
    }

    #[tokio::test]
    async fn list_rejects_limit_above_the_page_cap() {
        let client = VectorStoreClient::new(VectorStoreConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            timeout: Duration::from_millis(50),
        });
        let err = client.list("agent_a", 0, MAX_PAGE_LIMIT + 1).await.unwrap_err();
        assert!(matches!(err, VectorStoreError::LimitTooLarge(_, _)));
    }
}
