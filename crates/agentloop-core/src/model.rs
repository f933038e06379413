//! Core conversational data model: settings, steps, memory, and token accounting.
//!
//! These types are intentionally plain data — the Orchestrator is the only
//! component permitted to mutate a `Memory` (see orchestrator.rs).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::fsm::StateMachine;

/// Default per-turn LLM call ceiling when neither `Setting::llm_call_budget`
/// nor `Config::default_llm_call_budget` narrows it further.
pub const DEFAULT_LLM_CALL_BUDGET: u32 = 8;

/// Default truncation applied to conversation history when a `Setting`
/// leaves `max_history_len` at zero.
pub const DEFAULT_MAX_HISTORY_LEN: usize = 128;

/// Per-request configuration. Immutable for the duration of a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    pub agent_name: String,
    pub chat: ChatModelConfig,
    pub embedding: EmbeddingModelConfig,
    #[serde(default)]
    pub vector_db_url: String,
    #[serde(default)]
    pub top_k: usize,
    #[serde(default)]
    pub global_prompt: String,
    #[serde(default)]
    pub state_machine: StateMachine,
    #[serde(default)]
    pub llm_call_budget: Option<u32>,
}

impl Setting {
    /// Feedback retrieval is only possible when a vector store endpoint is configured.
    pub fn feedback_enabled(&self) -> bool {
        !self.vector_db_url.trim().is_empty()
    }

    pub fn max_history_len(&self) -> usize {
        if self.chat.max_history_len == 0 {
            DEFAULT_MAX_HISTORY_LEN
        } else {
            self.chat.max_history_len
        }
    }

    pub fn llm_call_budget(&self) -> u32 {
        self.llm_call_budget.unwrap_or(DEFAULT_LLM_CALL_BUDGET)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub max_history_len: usize,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub vector_dim: usize,
}

/// Role of a `Step` in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// An action the assistant chose to take: a tool name plus arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default)]
    pub tool_call_id: String,
}

/// Execution status of an action's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecState {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// The outcome of executing an `Action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub error: Option<String>,
    pub exec_state: ExecState,
}

impl ActionResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            error: None,
            exec_state: ExecState::Success,
        }
    }

    pub fn failed(content: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            error: Some(error.into()),
            exec_state: ExecState::Failed,
        }
    }

    pub fn skipped(error: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            error: Some(error.into()),
            exec_state: ExecState::Skipped,
        }
    }
}

/// One element of conversation memory: either a user turn or one
/// assistant action plus its execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub result: Option<ActionResult>,
    #[serde(default)]
    pub state_name: String,
    pub created_at: u64,
}

impl Step {
    pub fn user(content: impl Into<String>, ordinal: u64) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            action: None,
            result: None,
            state_name: String::new(),
            created_at: ordinal,
        }
    }

    pub fn assistant(action: Action, result: ActionResult, state_name: impl Into<String>, ordinal: u64) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            action: Some(action),
            result: Some(result),
            state_name: state_name.into(),
            created_at: ordinal,
        }
    }

    pub fn is_successful_reply(&self) -> bool {
        self.role == Role::Assistant
            && self
                .action
                .as_ref()
                .is_some_and(|a| a.name == crate::tool::SEND_MESSAGE_TOOL_NAME)
            && self
                .result
                .as_ref()
                .is_some_and(|r| r.exec_state == ExecState::Success)
    }

    /// The text of a successful `send_message_to_user` reply, if this step is one.
    pub fn reply_text(&self) -> Option<&str> {
        if self.is_successful_reply() {
            self.result.as_ref().map(|r| r.content.as_str())
        } else {
            None
        }
    }
}

/// An ordered sequence of `Step`s making up the conversation so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Memory {
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Memory {
    pub fn next_ordinal(&self) -> u64 {
        self.steps.last().map(|s| s.created_at + 1).unwrap_or(0)
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// The FSM state name of the most recent assistant step, or empty if none.
    pub fn current_state_name(&self) -> String {
        self.steps
            .iter()
            .rev()
            .find(|s| s.role == Role::Assistant)
            .map(|s| s.state_name.clone())
            .unwrap_or_default()
    }

    /// Strip the trailing user Step and every assistant Step that followed it.
    /// Used to implement `recall_last_user_message`.
    pub fn recall_last_user_message(&mut self) {
        if let Some(pos) = self.steps.iter().rposition(|s| s.role == Role::User) {
            self.steps.truncate(pos);
        }
    }

    /// Overwrite the content of the most recent successful `send_message_to_user`
    /// assistant step. Used to implement `edited_last_response`.
    pub fn edit_last_response(&mut self, new_content: &str) {
        if let Some(step) = self
            .steps
            .iter_mut()
            .rev()
            .find(|s| s.is_successful_reply())
        {
            if let Some(result) = step.result.as_mut() {
                result.content = new_content.to_string();
            }
        }
    }

    /// Collapse runs of consecutive identical `send_message_to_user` Steps,
    /// keeping only the last occurrence in each run.
    pub fn dedup_consecutive_replies(&mut self) {
        let mut kept: Vec<Step> = Vec::with_capacity(self.steps.len());
        for step in self.steps.drain(..) {
            let step_reply = step.reply_text().map(|s| s.to_string());
            if let Some(ref text) = step_reply {
                if let Some(last) = kept.last() {
                    if let Some(last_text) = last.reply_text() {
                        if last_text == text {
                            kept.pop();
                        }
                    }
                }
            }
            kept.push(step);
        }
        self.steps = kept;
    }

    pub fn last_n(&self, n: usize) -> &[Step] {
        let len = self.steps.len();
        if n >= len {
            &self.steps[..]
        } else {
            &self.steps[len - n..]
        }
    }
}

/// Per-session token accounting: `session_id -> totals`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub call_count: u64,
}

/// A ChatML-style message, used at the HTTP boundary to accept either a
/// plain string or a structured conversation as `user_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMlMessage {
    pub role: String,
    pub content: String,
}

/// Arbitrary string-keyed arguments as produced by tool-call parsing, kept
/// distinct from `serde_json::Map` call sites that expect owned `String` values.
pub type ArgMap = HashMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_step(content: &str, ordinal: u64) -> Step {
        Step::assistant(
            Action {
                name: crate::tool::SEND_MESSAGE_TOOL_NAME.to_string(),
                arguments: Map::new(),
                tool_call_id: "tc1".to_string(),
            },
            ActionResult::success(content),
            "greeting",
            ordinal,
        )
    }

    #[test]
    fn dedup_collapses_consecutive_identical_replies() {
        let mut memory = Memory::default();
        memory.push(Step::user("hi", 0));
        memory.push(reply_step("Hi!", 1));
        memory.push(reply_step("Hi!", 2));
        memory.dedup_consecutive_replies();
        assert_eq!(memory.steps.len(), 2);
        assert_eq!(memory.steps[1].created_at, 2);
    }

    #[test]
    fn dedup_keeps_non_adjacent_duplicates() {
        let mut memory = Memory::default();
        memory.push(reply_step("Hi!", 0));
        memory.push(reply_step("Bye!", 1));
        memory.push(reply_step("Hi!", 2));
        memory.dedup_consecutive_replies();
        assert_eq!(memory.steps.len(), 3);
    }

    #[test]
    fn recall_last_user_message_strips_trailing_turn() {
        let mut memory = Memory::default();
        memory.push(Step::user("first", 0));
        memory.push(reply_step("ok", 1));
        memory.push(Step::user("second", 2));
        memory.push(reply_step("ok2", 3));
        memory.recall_last_user_message();
        assert_eq!(memory.steps.len(), 2);
        assert_eq!(memory.steps[0].content, "first");
    }

    #[test]
    fn edit_last_response_overwrites_content() {
        let mut memory = Memory::default();
        memory.push(Step::user("hi", 0));
        memory.push(reply_step("Hi!", 1));
        memory.edit_last_response("Hello there!");
        assert_eq!(memory.steps[1].reply_text(), Some("Hello there!"));
    }

    #[test]
    fn current_state_name_uses_latest_assistant_step() {
        let mut memory = Memory::default();
        memory.push(Step::user("hi", 0));
        let mut step = reply_step("ok", 1);
        step.state_name = "S2".to_string();
        memory.push(step);
        assert_eq!(memory.current_state_name(), "S2");
    }
}
