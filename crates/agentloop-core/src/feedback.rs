//! Feedback Service (§4.4): per-agent collection lifecycle, embed-on-
//! insert, tag-filtered semantic retrieval of (observation, action)
//! exemplars.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::embedding::EmbeddingGateway;
use crate::error::{EmbeddingError, VectorStoreError};
use crate::vector_store::{StoredObject, TagFilter, VectorStoreClient, MAX_PAGE_LIMIT};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationRef {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRef {
    pub name: String,
    pub content: String,
}

/// A stored (observation, action) exemplar (§3 Feedback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(default)]
    pub id: String,
    pub agent_name: String,
    pub observation: ObservationRef,
    pub action: ActionRef,
    #[serde(default)]
    pub state_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Feedback {
    /// `"{observation.name}: {observation.content}\n{action.name}: {action.content}"` (§4.4).
    pub fn canonical_text(&self) -> String {
        format!(
            "{}: {}\n{}: {}",
            self.observation.name, self.observation.content, self.action.name, self.action.content
        )
    }

    fn derived_tags(&self) -> Vec<String> {
        let mut tags = vec![format!("observation_name:{}", self.observation.name)];
        if let Some(state) = &self.state_name {
            if !state.is_empty() {
                tags.push(format!("state_name:{state}"));
            }
        }
        tags
    }
}

pub struct FeedbackService {
    vector_store: Arc<VectorStoreClient>,
    embedding: EmbeddingGateway,
}

impl FeedbackService {
    pub fn new(vector_store: Arc<VectorStoreClient>, embedding: EmbeddingGateway) -> Self {
        Self { vector_store, embedding }
    }

    pub async fn ensure_ready(&self, agent_name: &str, vector_dim: usize) -> Result<(), VectorStoreError> {
        let collection = VectorStoreClient::collection_name(agent_name);
        self.vector_store.ensure_collection(&collection, vector_dim).await
    }

    /// Insert `feedbacks`, generating a fresh id per feedback at call
    /// time — never reused across calls (§4.4, §9: the default-argument
    /// UUID bug this guards against). Returns the ids that were
    /// assigned, in order.
    pub async fn add(&self, agent_name: &str, feedbacks: Vec<Feedback>) -> Result<Vec<String>, FeedbackError> {
        if feedbacks.is_empty() {
            return Ok(Vec::new());
        }

        let collection = VectorStoreClient::collection_name(agent_name);
        self.ensure_ready(agent_name, self.embedding.vector_dim())
            .await
            .map_err(FeedbackError::VectorStore)?;

        let texts: Vec<String> = feedbacks.iter().map(Feedback::canonical_text).collect();
        let vectors = self.embedding.embed(&texts).await.map_err(FeedbackError::Embedding)?;

        let mut ids = Vec::with_capacity(feedbacks.len());
        for (mut feedback, vector) in feedbacks.into_iter().zip(vectors.into_iter()) {
            // Generated here, per insert, never at struct-construction time.
            let id = Uuid::new_v4().to_string();
            feedback.id = id.clone();
            feedback.agent_name = agent_name.to_string();
            feedback.tags = feedback.derived_tags();

            let properties = feedback_properties(&feedback);
            self.vector_store
                .insert(&collection, &id, properties, &vector)
                .await
                .map_err(FeedbackError::VectorStore)?;
            ids.push(id);
        }
        Ok(ids)
    }

    pub async fn list(&self, agent_name: &str, offset: usize, limit: usize) -> Result<Vec<Feedback>, FeedbackError> {
        let limit = limit.min(MAX_PAGE_LIMIT);
        let collection = VectorStoreClient::collection_name(agent_name);
        match self.vector_store.list(&collection, offset, limit).await {
            Ok(objects) => Ok(objects.iter().filter_map(object_to_feedback).collect()),
            Err(VectorStoreError::CollectionMissing(_)) => Ok(Vec::new()),
            Err(err) => Err(FeedbackError::VectorStore(err)),
        }
    }

    /// Embed `query_text`, then query by vector, filtered by `tags`.
    /// Returns an empty list (never an error) if the collection doesn't
    /// exist yet — a cold agent simply has no feedback to retrieve.
    pub async fn retrieve(
        &self,
        agent_name: &str,
        query_text: &str,
        top_k: usize,
        tags: &[String],
    ) -> Vec<Feedback> {
        if top_k == 0 {
            return Vec::new();
        }
        let vector = match self.embedding.embed_one(query_text).await {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "embedding query text failed; returning no feedback");
                return Vec::new();
            }
        };

        let collection = VectorStoreClient::collection_name(agent_name);
        let filter = if tags.is_empty() { None } else { Some(TagFilter(tags.to_vec())) };
        match self.vector_store.query_by_vector(&collection, &vector, top_k, filter.as_ref()).await {
            Ok(objects) => objects.iter().filter_map(object_to_feedback).collect(),
            Err(VectorStoreError::CollectionMissing(_)) => Vec::new(),
            Err(err) => {
                warn!(error = %err, "feedback retrieval failed; returning empty");
                Vec::new()
            }
        }
    }

    pub async fn clear(&self, agent_name: &str) -> Result<(), VectorStoreError> {
        let collection = VectorStoreClient::collection_name(agent_name);
        self.vector_store.delete_all(&collection).await
    }

    pub async fn drop(&self, agent_name: &str) -> Result<(), VectorStoreError> {
        let collection = VectorStoreClient::collection_name(agent_name);
        self.vector_store.delete_collection(&collection).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedbackError {
    #[error(transparent)]
    VectorStore(VectorStoreError),
    #[error(transparent)]
    Embedding(EmbeddingError),
}

fn feedback_properties(feedback: &Feedback) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("agent_name".to_string(), json!(feedback.agent_name));
    map.insert("observation_name".to_string(), json!(feedback.observation.name));
    map.insert("observation_content".to_string(), json!(feedback.observation.content));
    map.insert("action_name".to_string(), json!(feedback.action.name));
    map.insert("action_content".to_string(), json!(feedback.action.content));
    map.insert("state_name".to_string(), json!(feedback.state_name.clone().unwrap_or_default()));
    map.insert("tags".to_string(), json!(feedback.tags));
    map
}

fn object_to_feedback(object: &StoredObject) -> Option<Feedback> {
    let properties = &object.properties;
    Some(Feedback {
        id: object.id.clone(),
        agent_name: properties.get("agent_name")?.as_str()?.to_string(),
        observation: ObservationRef {
            name: properties.get("observation_name")?.as_str()?.to_string(),
            content: properties.get("observation_content")?.as_str()?.to_string(),
        },
        action: ActionRef {
            name: properties.get("action_name")?.as_str()?.to_string(),
            content: properties.get("action_content")?.as_str()?.to_string(),
        },
        state_name: properties
            .get("state_name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
        tags: properties
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(obs: &str) -> Feedback {
        Feedback {
            id: String::new(),
            agent_name: "A".to_string(),
            observation: ObservationRef { name: "user_says".to_string(), content: obs.to_string() },
            action: ActionRef { name: "reply".to_string(), content: "Hi there".to_string() },
            state_name: Some("greeting".to_string()),
            tags: Vec::new(),
        }
    }

    #[test]
    fn canonical_text_matches_spec_format() {
        let feedback = sample("hi");
        assert_eq!(feedback.canonical_text(), "user_says: hi\nreply: Hi there");
    }

    #[test]
    fn derived_tags_include_observation_and_state() {
        let feedback = sample("hi");
        let tags = feedback.derived_tags();
        assert!(tags.contains(&"observation_name:user_says".to_string()));
        assert!(tags.contains(&"state_name:greeting".to_string()));
    }

    #[test]
    fn derived_tags_omit_state_when_absent() {
        let mut feedback = sample("hi");
        feedback.state_name = None;
        let tags = feedback.derived_tags();
        assert_eq!(tags, vec!["observation_name:user_says".to_string()]);
    }
}
