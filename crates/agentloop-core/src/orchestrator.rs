//! Chat Orchestrator (§4.10): the per-turn loop that ties state
//! selection, action selection, and action execution together and
//! enforces termination. This is the only component permitted to
//! mutate `Memory`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{EmbeddingGateway, EmbeddingGatewayConfig};
use crate::error::{ConfigError, OrchestratorError};
use crate::executor::ActionExecutor;
use crate::feedback::FeedbackService;
use crate::fsm::StateMachine;
use crate::llm::{LlmGateway, LlmGatewayConfig};
use crate::model::{ChatMlMessage, Memory, Setting, Step};
use crate::new_state::NewStateAgent;
use crate::select_actions::SelectActionsAgent;
use crate::state_select::StateSelectAgent;
use crate::tool::{RequestTool, ToolDescriptor};
use crate::token::TokenCounter;
use crate::vector_store::VectorStoreRegistry;

/// The apology synthesized on budget exceedance. Implementation-defined
/// text per §9; kept as a named constant so callers can match on it.
pub const BUDGET_EXCEEDED_REPLY: &str =
    "I'm sorry, I wasn't able to finish that within the time I have for this turn. Could you try again?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    Success,
    BudgetExceeded,
    Error,
}

#[derive(Debug, Clone)]
pub struct ChatTurnRequest {
    /// Already normalized to a ChatML sequence at the HTTP boundary
    /// (§9: "a normalization step at the boundary converts strings to
    /// single-element ChatML arrays; downstream code sees one shape").
    pub user_message: Vec<ChatMlMessage>,
    pub edited_last_response: Option<String>,
    pub recall_last_user_message: bool,
    pub setting: Setting,
    pub memory: Memory,
    pub request_tools: Vec<RequestTool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurnResponse {
    pub memory: Memory,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub llm_calling_times: u64,
    pub result_type: ResultType,
}

pub struct ChatOrchestrator {
    config: Config,
    token_counter: Arc<TokenCounter>,
    vector_store_registry: Arc<VectorStoreRegistry>,
}

impl ChatOrchestrator {
    pub fn new(config: Config, token_counter: Arc<TokenCounter>, vector_store_registry: Arc<VectorStoreRegistry>) -> Self {
        Self { config, token_counter, vector_store_registry }
    }

    #[instrument(skip_all, fields(agent_name = %request.setting.agent_name))]
    pub async fn run_turn(&self, mut request: ChatTurnRequest) -> Result<ChatTurnResponse, OrchestratorError> {
        validate_setting(&request.setting)?;

        if request.recall_last_user_message {
            request.memory.recall_last_user_message();
        }
        if let Some(edited) = &request.edited_last_response {
            request.memory.edit_last_response(edited);
        }

        let mut memory = request.memory;
        let mut turn_global_prompt = request.setting.global_prompt.clone();
        append_user_message(&mut memory, &request.user_message, &mut turn_global_prompt)?;

        // session id is produced once and reused for every LLM call this
        // turn; the counter lookup at the end uses the exact same string
        // (§4.10, §9 — the historical two-components-two-keys bug).
        let session_id = format!("{}:{}", request.setting.agent_name, Uuid::new_v4());

        let max_history_len = if request.setting.chat.max_history_len == 0 {
            self.config.default_max_history_len
        } else {
            request.setting.chat.max_history_len
        };
        let budget = request.setting.llm_call_budget.unwrap_or(self.config.default_llm_call_budget);

        let llm = LlmGateway::new(
            LlmGatewayConfig {
                base_url: request.setting.chat.base_url.clone(),
                api_key: request.setting.chat.api_key.clone(),
                model: request.setting.chat.model.clone(),
                temperature: request.setting.chat.temperature,
                top_p: request.setting.chat.top_p,
                timeout: Duration::from_millis(self.config.request_timeout_ms),
            },
            self.token_counter.clone(),
            session_id.clone(),
        );

        let feedback_service = if request.setting.feedback_enabled() {
            let vector_store = self.vector_store_registry.get(&request.setting.vector_db_url);
            Some(FeedbackService::new(
                vector_store,
                EmbeddingGateway::new(EmbeddingGatewayConfig {
                    base_url: request.setting.embedding.base_url.clone(),
                    api_key: request.setting.embedding.api_key.clone(),
                    model: request.setting.embedding.model.clone(),
                    vector_dim: request.setting.embedding.vector_dim,
                    timeout: Duration::from_millis(self.config.embedding_timeout_ms),
                }),
            ))
        } else {
            None
        };

        let query_text = memory
            .steps
            .iter()
            .rev()
            .find(|s| matches!(s.role, crate::model::Role::User))
            .map(|s| s.content.clone())
            .unwrap_or_default();

        let feedbacks = match &feedback_service {
            Some(service) => {
                service
                    .retrieve(&request.setting.agent_name, &query_text, request.setting.top_k, &[])
                    .await
            }
            None => Vec::new(),
        };

        let tools = ToolDescriptor::default_tools(&request.request_tools);
        let executor = ActionExecutor::new();

        let mut terminated = false;
        let mut result_type = ResultType::Success;

        let mut iteration = 0u32;
        while iteration < budget {
            iteration += 1;

            let state = self
                .select_state(&llm, &turn_global_prompt, max_history_len, &request.setting.state_machine, &memory.steps, &feedbacks)
                .await?;

            let select_actions = SelectActionsAgent::new(&llm, &turn_global_prompt, max_history_len);
            let actions = select_actions.step(&state, &memory.steps, &tools).await?;

            let results = executor.execute_batch(&actions, &tools).await;
            for (action, result) in actions.into_iter().zip(results.into_iter()) {
                let is_reply = ActionExecutor::is_reply(&action);
                let success = result.exec_state == crate::model::ExecState::Success;
                let ordinal = memory.next_ordinal();
                let step = Step::assistant(action, result, state.name.clone(), ordinal);
                memory.push(step);
                if is_reply && success {
                    terminated = true;
                    break;
                }
            }
            if terminated {
                break;
            }
        }

        if !terminated {
            warn!(session_id = %session_id, "turn exhausted its call budget without a reply");
            result_type = ResultType::BudgetExceeded;
            let mut arguments = serde_json::Map::new();
            arguments.insert("agent_message".to_string(), serde_json::Value::String(BUDGET_EXCEEDED_REPLY.to_string()));
            let action = crate::model::Action {
                name: crate::tool::SEND_MESSAGE_TOOL_NAME.to_string(),
                arguments,
                tool_call_id: String::new(),
            };
            let result = executor.execute(&action, &tools).await;
            let ordinal = memory.next_ordinal();
            let current_state_name = memory.current_state_name();
            memory.push(Step::assistant(action, result, current_state_name, ordinal));
        }

        memory.dedup_consecutive_replies();

        let usage = self.token_counter.get(&session_id);
        self.token_counter.clear(&session_id);

        info!(
            session_id = %session_id,
            result_type = ?result_type,
            total_input_tokens = usage.total_input_tokens,
            total_output_tokens = usage.total_output_tokens,
            "turn complete"
        );

        Ok(ChatTurnResponse {
            memory,
            total_input_tokens: usage.total_input_tokens,
            total_output_tokens: usage.total_output_tokens,
            llm_calling_times: usage.call_count,
            result_type,
        })
    }

    async fn select_state(
        &self,
        llm: &LlmGateway,
        global_prompt: &str,
        max_history_len: usize,
        fsm: &StateMachine,
        history: &[Step],
        feedbacks: &[crate::feedback::Feedback],
    ) -> Result<crate::fsm::State, OrchestratorError> {
        if fsm.is_empty() {
            let agent = NewStateAgent::new(llm, global_prompt, max_history_len);
            return Ok(agent.step(history).await?);
        }

        let agent = StateSelectAgent::new(llm, global_prompt, max_history_len);
        match agent.step(fsm, history, feedbacks).await? {
            Some(state) => Ok(state),
            None => {
                let fallback = NewStateAgent::new(llm, global_prompt, max_history_len);
                Ok(fallback.step(history).await?)
            }
        }
    }
}

fn validate_setting(setting: &Setting) -> Result<(), ConfigError> {
    if setting.agent_name.trim().is_empty() {
        return Err(ConfigError::EmptyAgentName);
    }
    if setting.chat.api_key.trim().is_empty() {
        return Err(ConfigError::MissingApiKey("chat"));
    }
    if setting.feedback_enabled() && setting.embedding.vector_dim == 0 {
        return Err(ConfigError::InvalidVectorDim(0));
    }
    Ok(())
}

/// Normalize `user_message` into `memory` (§9 boundary normalization).
/// `user`/`assistant` entries become ordinary Steps extending the
/// conversation; `system` entries are folded into this turn's effective
/// global prompt rather than stored as a Step, since Step's role is
/// restricted to {user, assistant} (§3).
fn append_user_message(
    memory: &mut Memory,
    user_message: &[ChatMlMessage],
    turn_global_prompt: &mut String,
) -> Result<(), OrchestratorError> {
    if user_message.is_empty() {
        return Ok(());
    }
    for message in user_message {
        match message.role.as_str() {
            "user" => {
                let ordinal = memory.next_ordinal();
                memory.push(Step::user(message.content.clone(), ordinal));
            }
            "assistant" => {
                let ordinal = memory.next_ordinal();
                let action = crate::model::Action {
                    name: crate::tool::SEND_MESSAGE_TOOL_NAME.to_string(),
                    arguments: serde_json::Map::new(),
                    tool_call_id: String::new(),
                };
                let result = crate::model::ActionResult::success(message.content.clone());
                memory.push(Step::assistant(action, result, memory.current_state_name(), ordinal));
            }
            "system" => {
                if !turn_global_prompt.is_empty() {
                    turn_global_prompt.push('\n');
                }
                turn_global_prompt.push_str(&message.content);
            }
            other => return Err(OrchestratorError::InvalidChatRole(other.to_string())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    use crate::fsm::State;
    use crate::tool::{HttpMethod, RequestTool};

    #[test]
    fn validate_setting_rejects_empty_agent_name() {
        let setting = Setting {
            agent_name: String::new(),
            ..default_setting()
        };
        assert!(matches!(validate_setting(&setting), Err(ConfigError::EmptyAgentName)));
    }

    #[test]
    fn validate_setting_rejects_missing_api_key() {
        let mut setting = default_setting();
        setting.chat.api_key = String::new();
        assert!(matches!(validate_setting(&setting), Err(ConfigError::MissingApiKey(_))));
    }

    #[test]
    fn append_user_message_rejects_unknown_roles() {
        let mut memory = Memory::default();
        let mut prompt = String::new();
        let messages = vec![ChatMlMessage { role: "tool".to_string(), content: "x".to_string() }];
        let result = append_user_message(&mut memory, &messages, &mut prompt);
        assert!(matches!(result, Err(OrchestratorError::InvalidChatRole(_))));
    }

    #[test]
    fn append_user_message_folds_system_into_prompt() {
        let mut memory = Memory::default();
        let mut prompt = String::from("base");
        let messages = vec![ChatMlMessage { role: "system".to_string(), content: "extra".to_string() }];
        append_user_message(&mut memory, &messages, &mut prompt).unwrap();
        assert_eq!(prompt, "base\nextra");
        assert!(memory.steps.is_empty());
    }

    fn default_setting() -> Setting {
        Setting {
            agent_name: "A".to_string(),
            chat: crate::model::ChatModelConfig {
                base_url: "http://localhost".to_string(),
                api_key: "key".to_string(),
                model: "test".to_string(),
                temperature: 0.7,
                top_p: 1.0,
                max_history_len: 0,
            },
            embedding: crate::model::EmbeddingModelConfig {
                base_url: "http://localhost".to_string(),
                api_key: "key".to_string(),
                model: "test-embed".to_string(),
                vector_dim: 8,
            },
            vector_db_url: String::new(),
            top_k: 0,
            global_prompt: String::new(),
            state_machine: StateMachine::default(),
            llm_call_budget: None,
        }
    }

    fn test_config() -> Config {
        Config {
            llm_base_url: String::new(),
            llm_api_key: String::new(),
            llm_model: String::new(),
            embedding_base_url: String::new(),
            embedding_api_key: String::new(),
            embedding_model: String::new(),
            vector_db_url: String::new(),
            http_port: 0,
            request_timeout_ms: 2_000,
            embedding_timeout_ms: 2_000,
            vector_store_timeout_ms: 2_000,
            default_llm_call_budget: crate::model::DEFAULT_LLM_CALL_BUDGET,
            default_max_history_len: crate::model::DEFAULT_MAX_HISTORY_LEN,
            log_filter: "agentloop=warn".to_string(),
        }
    }

    fn test_orchestrator() -> ChatOrchestrator {
        ChatOrchestrator::new(
            test_config(),
            Arc::new(TokenCounter::new()),
            Arc::new(VectorStoreRegistry::new(Duration::from_millis(2_000))),
        )
    }

    fn turn_request(setting: Setting, user_message: &str) -> ChatTurnRequest {
        ChatTurnRequest {
            user_message: vec![ChatMlMessage { role: "user".to_string(), content: user_message.to_string() }],
            edited_last_response: None,
            recall_last_user_message: false,
            setting,
            memory: Memory::default(),
            request_tools: Vec::new(),
        }
    }

    /// Matches a mocked chat-completions request whose body contains `has`
    /// but not `lacks` — used to tell a first structured ask apart from its
    /// re-ask (the re-ask prompt appends a "MUST reply" constraint), since
    /// both hit the same endpoint with otherwise-similar bodies.
    struct BodyContainsButNot(&'static str, &'static str);

    impl wiremock::Match for BodyContainsButNot {
        fn matches(&self, request: &Request) -> bool {
            let body = String::from_utf8_lossy(&request.body);
            body.contains(self.0) && !body.contains(self.1)
        }
    }

    fn respond_tool_call(name: &str, arguments_json: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "function": { "name": name, "arguments": arguments_json }
                    }]
                }
            }],
            "usage": { "prompt_tokens": 4, "completion_tokens": 2 }
        }))
    }

    fn respond_structured(content_json: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": content_json } }],
            "usage": { "prompt_tokens": 4, "completion_tokens": 2 }
        }))
    }

    /// §8 S1: greeting with no FSM configured. NewStateAgent then
    /// SelectActionsAgent each make one LLM call; the model replies with a
    /// single `send_message_to_user` tool call and the turn terminates.
    #[tokio::test]
    async fn run_turn_matches_scenario_s1_greeting_without_fsm() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("\"scenario\""))
            .respond_with(respond_structured(
                "{\"name\":\"greeting\",\"scenario\":\"start of conversation\",\"instruction\":\"say hi\"}",
            ))
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("\"tools\""))
            .respond_with(respond_tool_call("send_message_to_user", "{\"agent_message\":\"Hi!\"}"))
            .mount(&mock_server)
            .await;

        let mut setting = default_setting();
        setting.chat.base_url = mock_server.uri();

        let response = test_orchestrator().run_turn(turn_request(setting, "hello")).await.unwrap();

        assert_eq!(response.result_type, ResultType::Success);
        assert_eq!(response.llm_calling_times, 2);
        assert_eq!(response.memory.steps.len(), 2);
        assert_eq!(response.memory.steps[0].content, "hello");
        assert_eq!(response.memory.steps[1].reply_text(), Some("Hi!"));
    }

    /// §8 S4: the model never replies with `send_message_to_user`, always
    /// emitting a `RequestTool` call instead. The turn must stop after the
    /// configured budget, append exactly one synthesized apology Step, and
    /// report `budget_exceeded`.
    #[tokio::test]
    async fn run_turn_matches_scenario_s4_budget_exceeded() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("\"scenario\""))
            .respond_with(respond_structured(
                "{\"name\":\"idle\",\"scenario\":\"anything\",\"instruction\":\"look busy\"}",
            ))
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("\"tools\""))
            .respond_with(respond_tool_call("weather", "{\"city\":\"X\"}"))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/weather"))
            .respond_with(ResponseTemplate::new(200).set_body_string("sunny"))
            .mount(&mock_server)
            .await;

        let mut setting = default_setting();
        setting.chat.base_url = mock_server.uri();
        setting.llm_call_budget = Some(2);

        let weather_tool = RequestTool {
            name: "weather".to_string(),
            description: "look up the weather".to_string(),
            method: HttpMethod::Get,
            url: {
                let mut url = format!("{}/weather", mock_server.uri());
                url.push_str("?city={{city}}");
                url
            },
            headers: HashMap::new(),
            body: None,
            timeout_ms: 2_000,
            parameter_schema: json!({ "type": "object", "properties": { "city": { "type": "string" } } }),
        };

        let mut request = turn_request(setting, "what's the weather");
        request.request_tools = vec![weather_tool];

        let response = test_orchestrator().run_turn(request).await.unwrap();

        assert_eq!(response.result_type, ResultType::BudgetExceeded);
        assert_eq!(response.llm_calling_times, 4);
        assert_eq!(response.memory.steps.last().unwrap().reply_text(), Some(BUDGET_EXCEEDED_REPLY));
    }

    /// §8 S6: the State-Select Agent picks a state outside the candidate
    /// set; the orchestrator re-asks once with an explicit constraint and
    /// accepts the corrected choice without surfacing an error.
    #[tokio::test]
    async fn run_turn_matches_scenario_s6_fsm_violation_recovery() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(BodyContainsButNot("state_name", "MUST reply"))
            .respond_with(respond_structured("{\"state_name\":\"S9\"}"))
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("MUST reply"))
            .respond_with(respond_structured("{\"state_name\":\"S2\"}"))
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("\"tools\""))
            .respond_with(respond_tool_call("send_message_to_user", "{\"agent_message\":\"done\"}"))
            .mount(&mock_server)
            .await;

        let mut setting = default_setting();
        setting.chat.base_url = mock_server.uri();
        setting.state_machine = StateMachine {
            states: vec![
                State { name: "S1".to_string(), scenario: String::new(), instruction: String::new(), next_states: vec![] },
                State { name: "S2".to_string(), scenario: String::new(), instruction: String::new(), next_states: vec![] },
            ],
            free_states: vec!["S1".to_string(), "S2".to_string()],
            entry_state: Some("S1".to_string()),
        };

        let response = test_orchestrator().run_turn(turn_request(setting, "hi")).await.unwrap();

        assert_eq!(response.result_type, ResultType::Success);
        assert_eq!(response.memory.steps.last().unwrap().state_name, "S2");
    }
}
