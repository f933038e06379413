//! State-Select Agent (§4.6): asks the LLM to choose the next FSM state
//! from the enumerated candidates, using history and retrieved feedback.

use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::error::ProviderError;
use crate::feedback::Feedback;
use crate::fsm::{State, StateMachine};
use crate::llm::{ChatMessage, LlmGateway};
use crate::model::Step;

#[derive(Debug, Deserialize)]
struct StateChoice {
    state_name: String,
    #[allow(dead_code)]
    #[serde(default)]
    reason: String,
}

pub struct StateSelectAgent<'a> {
    llm: &'a LlmGateway,
    global_prompt: &'a str,
    max_history_len: usize,
}

impl<'a> StateSelectAgent<'a> {
    pub fn new(llm: &'a LlmGateway, global_prompt: &'a str, max_history_len: usize) -> Self {
        Self { llm, global_prompt, max_history_len }
    }

    /// §4.6 algorithm. Returns `None` when the FSM yields no candidates
    /// for the current state — the caller should fall through to the
    /// New-State Agent (§4.7) in that case.
    pub async fn step(
        &self,
        fsm: &StateMachine,
        history: &[Step],
        feedbacks: &[Feedback],
    ) -> Result<Option<State>, ProviderError> {
        let current = current_state_name(history);
        let candidates = fsm.next_candidates(&current);
        if candidates.is_empty() {
            return Ok(None);
        }

        let prompt = render_prompt(history, self.max_history_len, feedbacks, &candidates, None);
        let messages = vec![ChatMessage::system(self.global_prompt), ChatMessage::user(prompt)];
        let schema = state_choice_schema(&candidates);

        let choice = self.llm.ask_structured(&messages, &schema).await?;
        let parsed: StateChoice = serde_json::from_value(choice)
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?;

        if let Some(state) = find_candidate(&candidates, &parsed.state_name) {
            return Ok(Some(state));
        }

        // One re-ask with an explicit "must be one of ..." constraint (§4.6 step 5).
        warn!(chosen = %parsed.state_name, "state selection outside candidates, re-asking");
        let retry_prompt = render_prompt(
            history,
            self.max_history_len,
            feedbacks,
            &candidates,
            Some(&parsed.state_name),
        );
        let retry_messages = vec![ChatMessage::system(self.global_prompt), ChatMessage::user(retry_prompt)];
        let retry_choice = self.llm.ask_structured(&retry_messages, &schema).await?;
        let retry_parsed: StateChoice = serde_json::from_value(retry_choice)
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?;

        if let Some(state) = find_candidate(&candidates, &retry_parsed.state_name) {
            return Ok(Some(state));
        }

        // Second failure: deterministic fallback to the first candidate (§4.6, §7 FSMViolation).
        warn!(
            chosen = %retry_parsed.state_name,
            "state selection outside candidates after re-ask, falling back to first candidate"
        );
        Ok(Some(candidates[0].clone()))
    }
}

fn current_state_name(history: &[Step]) -> String {
    history
        .iter()
        .rev()
        .find(|s| matches!(s.role, crate::model::Role::Assistant))
        .map(|s| s.state_name.clone())
        .unwrap_or_default()
}

fn find_candidate(candidates: &[State], name: &str) -> Option<State> {
    candidates.iter().find(|s| s.name == name).cloned()
}

fn state_choice_schema(candidates: &[State]) -> serde_json::Value {
    let names: Vec<&str> = candidates.iter().map(|s| s.name.as_str()).collect();
    json!({
        "type": "object",
        "properties": {
            "state_name": { "type": "string", "enum": names },
            "reason": { "type": "string" }
        },
        "required": ["state_name"]
    })
}

fn render_prompt(
    history: &[Step],
    max_history_len: usize,
    feedbacks: &[Feedback],
    candidates: &[State],
    invalid_previous_choice: Option<&str>,
) -> String {
    let start = history.len().saturating_sub(max_history_len);
    let mut prompt = String::new();

    prompt.push_str("Conversation so far:\n");
    for step in &history[start..] {
        prompt.push_str(&format!("{}\n", describe_step(step)));
    }

    if !feedbacks.is_empty() {
        prompt.push_str("\nRelevant past examples:\n");
        for feedback in feedbacks {
            prompt.push_str(&format!("- {}\n", feedback.canonical_text()));
        }
    }

    prompt.push_str("\nCandidate next states:\n");
    for candidate in candidates {
        prompt.push_str(&format!(
            "- {}: scenario={:?} instruction={:?}\n",
            candidate.name, candidate.scenario, candidate.instruction
        ));
    }

    if let Some(invalid) = invalid_previous_choice {
        prompt.push_str(&format!(
            "\nYour previous answer '{invalid}' is not one of the candidate names above. \
             You MUST reply with state_name set to exactly one of: {}.\n",
            candidates.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ")
        ));
    }

    prompt.push_str("\nChoose the next state.");
    prompt
}

fn describe_step(step: &Step) -> String {
    match step.role {
        crate::model::Role::User => format!("user: {}", step.content),
        crate::model::Role::Assistant => match (&step.action, &step.result) {
            (Some(action), Some(result)) => {
                format!("assistant[{}]: {} -> {}", step.state_name, action.name, result.content)
            }
            _ => "assistant: (no action)".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, ActionResult, ExecState};
    use serde_json::Map;

    fn sample_history() -> Vec<Step> {
        vec![Step::user("hello", 0)]
    }

    #[test]
    fn render_prompt_lists_candidates() {
        let candidates = vec![State {
            name: "greeting".into(),
            scenario: "start".into(),
            instruction: "say hi".into(),
            next_states: vec![],
        }];
        let prompt = render_prompt(&sample_history(), 128, &[], &candidates, None);
        assert!(prompt.contains("greeting"));
        assert!(prompt.contains("user: hello"));
    }

    #[test]
    fn render_prompt_includes_reask_constraint() {
        let candidates = vec![State {
            name: "greeting".into(),
            scenario: String::new(),
            instruction: String::new(),
            next_states: vec![],
        }];
        let prompt = render_prompt(&sample_history(), 128, &[], &candidates, Some("bogus"));
        assert!(prompt.contains("bogus"));
        assert!(prompt.contains("MUST reply"));
    }

    #[test]
    fn current_state_name_ignores_user_steps() {
        let mut history = sample_history();
        history.push(Step::assistant(
            Action { name: "reply".into(), arguments: Map::new(), tool_call_id: "1".into() },
            ActionResult { content: "hi".into(), error: None, exec_state: ExecState::Success },
            "greeting",
            1,
        ));
        assert_eq!(current_state_name(&history), "greeting");
    }
}
