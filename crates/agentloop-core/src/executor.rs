//! Action Executor (§4.9): given tool descriptors and a selected action,
//! invokes the correct tool and captures its result.

use futures::future::join_all;

use crate::model::{Action, ActionResult};
use crate::tool::{RequestTool, ToolDescriptor, SEND_MESSAGE_TOOL_NAME};

pub struct ActionExecutor {
    client: reqwest::Client,
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionExecutor {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    pub fn is_reply(action: &Action) -> bool {
        action.name == SEND_MESSAGE_TOOL_NAME
    }

    /// Execute one action against `tools`, stateless across turns (§4.9).
    pub async fn execute(&self, action: &Action, tools: &[ToolDescriptor]) -> ActionResult {
        if action.name == SEND_MESSAGE_TOOL_NAME {
            let content = action
                .arguments
                .get("agent_message")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            return ActionResult::success(content);
        }

        match find_request_tool(tools, &action.name) {
            Some(tool) => match tool.execute(&self.client, &action.arguments).await {
                Ok(outcome) => {
                    if outcome.success {
                        ActionResult::success(outcome.body)
                    } else {
                        ActionResult::failed(outcome.body, outcome.error.unwrap_or_default())
                    }
                }
                Err(err) => ActionResult::failed(String::new(), err.to_string()),
            },
            None => ActionResult::skipped("unknown tool"),
        }
    }

    /// Execute a batch of actions. Independent `RequestTool` calls are
    /// fanned out onto the runtime concurrently (§5: "gather-and-
    /// reorder"), but the returned results are in the same order as
    /// `actions` regardless of completion order, so the orchestrator can
    /// append Steps in emission order.
    pub async fn execute_batch(&self, actions: &[Action], tools: &[ToolDescriptor]) -> Vec<ActionResult> {
        let futures = actions.iter().map(|action| self.execute(action, tools));
        join_all(futures).await
    }
}

fn find_request_tool<'a>(tools: &'a [ToolDescriptor], name: &str) -> Option<&'a RequestTool> {
    tools.iter().find_map(|tool| match tool {
        ToolDescriptor::Request(request_tool) if request_tool.name == name => Some(request_tool),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExecState;
    use serde_json::{json, Map};

    fn action(name: &str, arguments: Map<String, serde_json::Value>) -> Action {
        Action { name: name.to_string(), arguments, tool_call_id: "tc".to_string() }
    }

    #[tokio::test]
    async fn send_message_to_user_succeeds_with_agent_message() {
        let executor = ActionExecutor::new();
        let mut args = Map::new();
        args.insert("agent_message".to_string(), json!("Hi!"));
        let result = executor.execute(&action(SEND_MESSAGE_TOOL_NAME, args), &[]).await;
        assert_eq!(result.exec_state, ExecState::Success);
        assert_eq!(result.content, "Hi!");
    }

    #[tokio::test]
    async fn unknown_tool_is_skipped() {
        let executor = ActionExecutor::new();
        let result = executor.execute(&action("mystery_tool", Map::new()), &[]).await;
        assert_eq!(result.exec_state, ExecState::Skipped);
        assert_eq!(result.error.as_deref(), Some("unknown tool"));
    }

    #[tokio::test]
    async fn batch_preserves_emission_order() {
        let executor = ActionExecutor::new();
        let mut first_args = Map::new();
        first_args.insert("agent_message".to_string(), json!("first"));
        let mut second_args = Map::new();
        second_args.insert("agent_message".to_string(), json!("second"));
        let actions = vec![
            action(SEND_MESSAGE_TOOL_NAME, first_args),
            action(SEND_MESSAGE_TOOL_NAME, second_args),
        ];
        let results = executor.execute_batch(&actions, &[]).await;
        assert_eq!(results[0].content, "first");
        assert_eq!(results[1].content, "second");
    }
}
