//! Select-Actions Agent (§4.8): prompts the LLM, with tools attached, to
//! emit one or more tool calls for the current state.

use serde_json::Value;

use crate::error::ProviderError;
use crate::fsm::State;
use crate::llm::LlmGateway;
use crate::llm::ChatMessage;
use crate::model::{Action, Step};
use crate::tool::{ToolDescriptor, SEND_MESSAGE_TOOL_NAME};

pub struct SelectActionsAgent<'a> {
    llm: &'a LlmGateway,
    global_prompt: &'a str,
    max_history_len: usize,
}

impl<'a> SelectActionsAgent<'a> {
    pub fn new(llm: &'a LlmGateway, global_prompt: &'a str, max_history_len: usize) -> Self {
        Self { llm, global_prompt, max_history_len }
    }

    /// §4.8 algorithm. The returned actions are not yet validated against
    /// `tools` beyond what's needed to normalize shape — an unknown
    /// `name` is passed through and the Action Executor (§4.9) is the
    /// component that turns it into a `skipped` Step, so the "unknown
    /// tool" rule is enforced exactly once.
    pub async fn step(
        &self,
        state: &State,
        history: &[Step],
        tools: &[ToolDescriptor],
    ) -> Result<Vec<Action>, ProviderError> {
        let system = format!("{}\n\n{}", self.global_prompt, state.instruction);
        let mut messages = vec![ChatMessage::system(system)];
        let start = history.len().saturating_sub(self.max_history_len);
        for step in &history[start..] {
            messages.push(replay_message(step));
        }

        let assistant = self.llm.ask_with_tools(&messages, tools).await?;

        if !assistant.tool_calls.is_empty() {
            return Ok(assistant
                .tool_calls
                .into_iter()
                .map(|call| {
                    let arguments = parse_arguments(&call.function.arguments);
                    Action { name: call.function.name, arguments, tool_call_id: call.id }
                })
                .collect());
        }

        // Textual content but no tool calls: synthesize a single
        // send_message_to_user action (§4.8 step 4).
        if let Some(content) = assistant.content.filter(|c| !c.trim().is_empty()) {
            let mut arguments = serde_json::Map::new();
            arguments.insert("agent_message".to_string(), Value::String(content));
            return Ok(vec![Action {
                name: SEND_MESSAGE_TOOL_NAME.to_string(),
                arguments,
                tool_call_id: String::new(),
            }]);
        }

        Ok(Vec::new())
    }
}

fn parse_arguments(raw: &str) -> serde_json::Map<String, Value> {
    if raw.trim().is_empty() {
        return serde_json::Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

fn replay_message(step: &Step) -> ChatMessage {
    match step.role {
        crate::model::Role::User => ChatMessage::user(step.content.clone()),
        crate::model::Role::Assistant => match &step.result {
            Some(result) => ChatMessage::assistant(result.content.clone()),
            None => ChatMessage::assistant(String::new()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_arguments_defaults_to_empty_map_when_missing() {
        assert!(parse_arguments("").is_empty());
        assert!(parse_arguments("not json").is_empty());
    }

    #[test]
    fn parse_arguments_reads_json_object() {
        let map = parse_arguments(r#"{"city":"Paris"}"#);
        assert_eq!(map.get("city").unwrap().as_str().unwrap(), "Paris");
    }
}
