//! LLM Gateway (§4.1): a thin adapter around an OpenAI-compatible
//! chat-completions endpoint, in three modes — plain ask, tool-calling
//! ask, and structured-output ask. Every call records usage under the
//! session id this gateway was constructed with.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{ProviderError, TransportError};
use crate::token::TokenCounter;
use crate::tool::ToolDescriptor;

/// Never forward `null` for `max_tokens` — a safe floor per §4.1.
pub const DEFAULT_MAX_COMPLETION_TOKENS: u32 = 1024;

const MAX_RATE_LIMIT_RETRIES: u32 = 2;
const BASE_BACKOFF_MS: u64 = 250;

/// A single ChatML-style message as sent to/from the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: Some(content.into()), tool_calls: None, tool_call_id: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: Some(content.into()), tool_calls: None, tool_call_id: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: Some(content.into()), tool_calls: None, tool_call_id: None }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// One tool call the model asked to make.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    #[serde(default)]
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Raw JSON-encoded arguments string, as the wire format sends it.
    #[serde(default)]
    pub arguments: String,
}

/// The assistant message returned by `ask_with_tools`: whatever text the
/// model said, plus whatever tools it asked to call.
#[derive(Debug, Clone, Default)]
pub struct AssistantMessage {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

#[derive(Debug, Clone)]
pub struct LlmGatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub timeout: Duration,
}

/// Per-turn adapter. Constructed fresh for every turn (§9: no process-wide
/// cache of agent/client instances) and bound to one `session_id` for its
/// whole lifetime.
pub struct LlmGateway {
    client: reqwest::Client,
    config: LlmGatewayConfig,
    token_counter: Arc<TokenCounter>,
    session_id: String,
}

impl LlmGateway {
    pub fn new(config: LlmGatewayConfig, token_counter: Arc<TokenCounter>, session_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            token_counter,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Plain completion: `system` + `history` + `user`.
    pub async fn ask(
        &self,
        system: &str,
        user: &str,
        history: &[ChatMessage],
    ) -> Result<String, ProviderError> {
        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(history.iter().cloned());
        messages.push(ChatMessage::user(user));

        let body = self.request_body(&messages, None, None);
        let response = self.send_with_retries(&body).await?;
        self.record_usage(&response);
        extract_content(&response)
    }

    /// Tool-calling ask: returns the raw assistant message, including any
    /// textual content alongside the tool-call list.
    pub async fn ask_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
    ) -> Result<AssistantMessage, ProviderError> {
        let tool_defs: Vec<Value> = tools.iter().map(|t| t.to_openai_tool()).collect();
        let body = self.request_body(messages, Some(tool_defs), None);
        let response = self.send_with_retries(&body).await?;
        self.record_usage(&response);
        extract_assistant_message(&response)
    }

    /// Structured-output ask: request JSON conforming to `schema`. On a
    /// parse failure, re-ask once with the parse error appended as
    /// guidance before failing with `BadResponse` (§4.1).
    pub async fn ask_structured(
        &self,
        messages: &[ChatMessage],
        schema: &Value,
    ) -> Result<Value, ProviderError> {
        let body = self.request_body(messages, None, Some(schema.clone()));
        let response = self.send_with_retries(&body).await?;
        self.record_usage(&response);
        let content = extract_content(&response)?;

        match serde_json::from_str::<Value>(&content) {
            Ok(value) => Ok(value),
            Err(first_err) => {
                warn!(error = %first_err, "structured response failed to parse; repairing once");
                let mut repair_messages = messages.to_vec();
                repair_messages.push(ChatMessage::assistant(content));
                repair_messages.push(ChatMessage::user(format!(
                    "Your previous reply was not valid JSON matching the required schema: {first_err}. \
                     Reply again with ONLY the corrected JSON object."
                )));
                let repair_body = self.request_body(&repair_messages, None, Some(schema.clone()));
                let repair_response = self.send_with_retries(&repair_body).await?;
                self.record_usage(&repair_response);
                let repaired = extract_content(&repair_response)?;
                serde_json::from_str::<Value>(&repaired)
                    .map_err(|e| ProviderError::BadResponse(e.to_string()))
            }
        }
    }

    fn request_body(&self, messages: &[ChatMessage], tools: Option<Vec<Value>>, schema: Option<Value>) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "max_tokens": DEFAULT_MAX_COMPLETION_TOKENS,
        });
        if let Some(tools) = tools {
            body["tools"] = json!(tools);
        }
        if let Some(schema) = schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": { "name": "structured_output", "schema": schema }
            });
        }
        body
    }

    /// Issue the HTTP request, retrying rate-limited responses with
    /// jittered exponential backoff up to `MAX_RATE_LIMIT_RETRIES` times
    /// (§4.1). A single network-level failure is retried once before
    /// being surfaced as `TransportError`.
    async fn send_with_retries(&self, body: &Value) -> Result<Value, ProviderError> {
        let mut attempt = 0;
        loop {
            let result = self.send_once(body).await;
            match result {
                Ok(response) => return Ok(response),
                Err(ProviderError::RateLimited) if attempt < MAX_RATE_LIMIT_RETRIES => {
                    attempt += 1;
                    let delay = jittered_backoff(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "rate limited, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(ProviderError::Transport(_)) if attempt == 0 => {
                    attempt += 1;
                    let delay = jittered_backoff(attempt);
                    warn!(delay_ms = delay.as_millis() as u64, "transport error, retrying once");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(&self, body: &Value) -> Result<Value, ProviderError> {
        debug!(base_url = %self.config.base_url, "issuing chat completion request");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .timeout(self.config.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Transport(TransportError::Timeout(self.config.timeout))
                } else {
                    ProviderError::Transport(TransportError::Network(e))
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::Auth);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::BadResponse(format!("status {status}: {text}")));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::BadResponse(e.to_string()))
    }

    fn record_usage(&self, response: &Value) {
        let prompt_tokens = response["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
        let completion_tokens = response["usage"]["completion_tokens"].as_u64().unwrap_or(0);
        self.token_counter.add(&self.session_id, prompt_tokens, completion_tokens);
    }
}

fn jittered_backoff(attempt: u32) -> Duration {
    let base = BASE_BACKOFF_MS * 2u64.pow(attempt.saturating_sub(1));
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

fn first_choice(response: &Value) -> Result<&Value, ProviderError> {
    response["choices"]
        .get(0)
        .ok_or_else(|| ProviderError::BadResponse("response has no choices".to_string()))
}

fn extract_content(response: &Value) -> Result<String, ProviderError> {
    let choice = first_choice(response)?;
    choice["message"]["content"]
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| ProviderError::BadResponse("message has no content".to_string()))
}

fn extract_assistant_message(response: &Value) -> Result<AssistantMessage, ProviderError> {
    let choice = first_choice(response)?;
    let message = &choice["message"];
    let content = message["content"].as_str().map(|s| s.to_string());
    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| serde_json::from_value::<ToolCallRequest>(call.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    Ok(AssistantMessage { content, tool_calls })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_content_reads_first_choice() {
        let response = json!({
            "choices": [{ "message": { "content": "hi" } }],
            "usage": { "prompt_tokens": 3, "completion_tokens": 1 }
        });
        assert_eq!(extract_content(&response).unwrap(), "hi");
    }

    #[test]
    fn extract_assistant_message_parses_tool_calls() {
        let response = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "function": { "name": "send_message_to_user", "arguments": "{\"agent_message\":\"hi\"}" }
                    }]
                }
            }]
        });
        let assistant = extract_assistant_message(&response).unwrap();
        assert_eq!(assistant.tool_calls.len(), 1);
        assert_eq!(assistant.tool_calls[0].function.name, "send_message_to_user");
    }

    #[test]
    fn jittered_backoff_grows_with_attempt() {
        let d1 = jittered_backoff(1);
        let d2 = jittered_backoff(2);
        assert!(d2 >= Duration::from_millis(BASE_BACKOFF_MS));
        assert!(d1 >= Duration::from_millis(BASE_BACKOFF_MS / 2));
    }
}
