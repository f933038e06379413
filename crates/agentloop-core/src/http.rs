//! HTTP surface (§6): an `axum` router exposing `/chat`, `/learn`,
//! `/feedbacks`, `/collections/{agent_name}`, and `/health`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::embedding::{EmbeddingGateway, EmbeddingGatewayConfig};
use crate::error::OrchestratorError;
use crate::feedback::{Feedback, FeedbackService};
use crate::model::{ChatMlMessage, Memory, Setting};
use crate::orchestrator::{ChatOrchestrator, ChatTurnRequest, ChatTurnResponse};
use crate::token::TokenCounter;
use crate::tool::RequestTool;
use crate::vector_store::VectorStoreRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub token_counter: Arc<TokenCounter>,
    pub vector_store_registry: Arc<VectorStoreRegistry>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let vector_store_registry =
            Arc::new(VectorStoreRegistry::new(Duration::from_millis(config.vector_store_timeout_ms)));
        Self { config, token_counter: Arc::new(TokenCounter::new()), vector_store_registry }
    }

    fn orchestrator(&self) -> ChatOrchestrator {
        ChatOrchestrator::new(self.config.clone(), self.token_counter.clone(), self.vector_store_registry.clone())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/learn", post(learn))
        .route("/feedbacks", get(list_feedbacks).delete(clear_feedbacks))
        .route("/collections/{agent_name}", delete(drop_collection))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// §6.1: `user_message: string | ChatML[]`. The raw body keeps the union
/// shape; normalization to `Vec<ChatMlMessage>` happens here, at the
/// boundary (§9).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UserMessageBody {
    Plain(String),
    ChatMl(Vec<ChatMlMessage>),
}

impl UserMessageBody {
    fn normalize(self) -> Vec<ChatMlMessage> {
        match self {
            UserMessageBody::Plain(content) => {
                vec![ChatMlMessage { role: "user".to_string(), content }]
            }
            UserMessageBody::ChatMl(messages) => messages,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatRequestBody {
    user_message: UserMessageBody,
    #[serde(default)]
    edited_last_response: Option<String>,
    #[serde(default)]
    recall_last_user_message: bool,
    settings: Setting,
    memory: Memory,
    #[serde(default)]
    request_tools: Vec<RequestTool>,
}

#[derive(Debug, Serialize)]
struct ChatResponseBody {
    response: Memory,
    memory: Memory,
    result_type: &'static str,
    llm_calling_times: u64,
    total_input_token: u64,
    total_output_token: u64,
}

impl From<ChatTurnResponse> for ChatResponseBody {
    fn from(turn: ChatTurnResponse) -> Self {
        let result_type = match turn.result_type {
            crate::orchestrator::ResultType::Success => "success",
            crate::orchestrator::ResultType::BudgetExceeded => "budget_exceeded",
            crate::orchestrator::ResultType::Error => "error",
        };
        Self {
            response: turn.memory.clone(),
            memory: turn.memory,
            result_type,
            llm_calling_times: turn.llm_calling_times,
            total_input_token: turn.total_input_tokens,
            total_output_token: turn.total_output_tokens,
        }
    }
}

async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatRequestBody>,
) -> Result<Json<ChatResponseBody>, OrchestratorError> {
    let request = ChatTurnRequest {
        user_message: body.user_message.normalize(),
        edited_last_response: body.edited_last_response,
        recall_last_user_message: body.recall_last_user_message,
        setting: body.settings,
        memory: body.memory,
        request_tools: body.request_tools,
    };
    let response = state.orchestrator().run_turn(request).await?;
    Ok(Json(response.into()))
}

#[derive(Debug, Deserialize)]
struct LearnRequestBody {
    settings: Setting,
    feedbacks: Vec<Feedback>,
}

#[derive(Debug, Serialize)]
struct LearnResponseBody {
    status: &'static str,
    data: Vec<String>,
}

async fn learn(
    State(state): State<AppState>,
    Json(body): Json<LearnRequestBody>,
) -> Result<Json<LearnResponseBody>, OrchestratorError> {
    let embedding = EmbeddingGatewayConfig {
        base_url: body.settings.embedding.base_url.clone(),
        api_key: body.settings.embedding.api_key.clone(),
        model: body.settings.embedding.model.clone(),
        vector_dim: body.settings.embedding.vector_dim,
        timeout: Duration::from_millis(state.config.embedding_timeout_ms),
    };
    let vector_store = state.vector_store_registry.get(&body.settings.vector_db_url);
    let service = FeedbackService::new(vector_store, EmbeddingGateway::new(embedding));

    match service.add(&body.settings.agent_name, body.feedbacks).await {
        Ok(ids) => Ok(Json(LearnResponseBody { status: "Success", data: ids })),
        Err(err) => Ok(Json(LearnResponseBody { status: "Failed", data: vec![err.to_string()] })),
    }
}

#[derive(Debug, Deserialize)]
struct FeedbacksQuery {
    agent_name: String,
    #[serde(default)]
    vector_db_url: String,
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn list_feedbacks(
    State(state): State<AppState>,
    Query(query): Query<FeedbacksQuery>,
) -> Result<Json<Vec<Feedback>>, OrchestratorError> {
    let service = bare_feedback_service(&state, &query.vector_db_url);
    let feedbacks = service
        .list(&query.agent_name, query.offset, query.limit)
        .await
        .map_err(|e| OrchestratorError::VectorStore(into_vector_store_error(e)))?;
    Ok(Json(feedbacks))
}

#[derive(Debug, Deserialize)]
struct AgentQuery {
    agent_name: String,
    #[serde(default)]
    vector_db_url: String,
}

async fn clear_feedbacks(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> Result<StatusCode, OrchestratorError> {
    let service = bare_feedback_service(&state, &query.vector_db_url);
    service
        .clear(&query.agent_name)
        .await
        .map_err(OrchestratorError::VectorStore)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn drop_collection(
    State(state): State<AppState>,
    Path(agent_name): Path<String>,
    Query(query): Query<VectorDbQuery>,
) -> Result<StatusCode, OrchestratorError> {
    let service = bare_feedback_service(&state, &query.vector_db_url);
    service
        .drop(&agent_name)
        .await
        .map_err(OrchestratorError::VectorStore)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct VectorDbQuery {
    #[serde(default)]
    vector_db_url: String,
}

/// `/feedbacks` and `/collections` endpoints only read or delete by id —
/// they never embed anything, so the embedding gateway backing the
/// `FeedbackService` is constructed with placeholder coordinates that
/// are never dialed.
fn bare_feedback_service(state: &AppState, vector_db_url: &str) -> FeedbackService {
    let vector_store = state.vector_store_registry.get(vector_db_url);
    let embedding = EmbeddingGateway::new(EmbeddingGatewayConfig {
        base_url: String::new(),
        api_key: String::new(),
        model: String::new(),
        vector_dim: 1,
        timeout: Duration::from_millis(state.config.embedding_timeout_ms),
    });
    FeedbackService::new(vector_store, embedding)
}

fn into_vector_store_error(err: crate::feedback::FeedbackError) -> crate::error::VectorStoreError {
    match err {
        crate::feedback::FeedbackError::VectorStore(e) => e,
        crate::feedback::FeedbackError::Embedding(_) => {
            crate::error::VectorStoreError::UnexpectedResponse("embedding error on a read-only path".to_string())
        }
    }
}
