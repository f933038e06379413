//! New-State Agent (§4.7): triggered only when the Setting has an empty
//! FSM. Synthesizes a transient state from history alone — it is never
//! added to the Setting's FSM; it lives only for the current turn.

use serde::Deserialize;
use serde_json::json;

use crate::error::ProviderError;
use crate::fsm::State;
use crate::llm::{ChatMessage, LlmGateway};
use crate::model::Step;

#[derive(Debug, Deserialize)]
struct NewStateChoice {
    name: String,
    scenario: String,
    instruction: String,
}

pub struct NewStateAgent<'a> {
    llm: &'a LlmGateway,
    global_prompt: &'a str,
    max_history_len: usize,
}

impl<'a> NewStateAgent<'a> {
    pub fn new(llm: &'a LlmGateway, global_prompt: &'a str, max_history_len: usize) -> Self {
        Self { llm, global_prompt, max_history_len }
    }

    pub async fn step(&self, history: &[Step]) -> Result<State, ProviderError> {
        let start = history.len().saturating_sub(self.max_history_len);
        let mut prompt = String::from(
            "No predefined state machine is configured for this agent. Based on the \
             conversation so far, synthesize a short label, a scenario describing when it \
             applies, and an instruction describing what the assistant should do right now.\n\n\
             Conversation so far:\n",
        );
        for step in &history[start..] {
            prompt.push_str(&format!("{}\n", describe_step(step)));
        }

        let messages = vec![ChatMessage::system(self.global_prompt), ChatMessage::user(prompt)];
        let schema = json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "scenario": { "type": "string" },
                "instruction": { "type": "string" }
            },
            "required": ["name", "scenario", "instruction"]
        });

        let choice = self.llm.ask_structured(&messages, &schema).await?;
        let parsed: NewStateChoice =
            serde_json::from_value(choice).map_err(|e| ProviderError::BadResponse(e.to_string()))?;

        Ok(State {
            name: parsed.name,
            scenario: parsed.scenario,
            instruction: parsed.instruction,
            next_states: Vec::new(),
        })
    }
}

fn describe_step(step: &Step) -> String {
    match step.role {
        crate::model::Role::User => format!("user: {}", step.content),
        crate::model::Role::Assistant => match &step.result {
            Some(result) => format!("assistant: {}", result.content),
            None => "assistant: (no result)".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_step_renders_user_content() {
        let step = Step::user("hi", 0);
        assert_eq!(describe_step(&step), "user: hi");
    }
}
