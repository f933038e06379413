//! Tool descriptors, as presented to `llm.ask_with_tools` (§4.8).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::request::RequestTool;

/// Name of the built-in "reply to the user" action. Fixed by §3.
pub const SEND_MESSAGE_TOOL_NAME: &str = "send_message_to_user";

/// A tool as the LLM gateway sees it: name, description, JSON-schema
/// parameters. Either the built-in reply action or a caller-supplied
/// `RequestTool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolDescriptor {
    SendMessageToUser,
    Request(RequestTool),
}

impl ToolDescriptor {
    pub fn name(&self) -> &str {
        match self {
            ToolDescriptor::SendMessageToUser => SEND_MESSAGE_TOOL_NAME,
            ToolDescriptor::Request(tool) => &tool.name,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            ToolDescriptor::SendMessageToUser => {
                "Send a message to the user. Use this to reply, ask a clarifying \
                 question, or deliver any user-visible text."
            }
            ToolDescriptor::Request(tool) => &tool.description,
        }
    }

    /// JSON-schema `parameters` object, in the shape an OpenAI-compatible
    /// `tools` array expects under `function.parameters`.
    pub fn parameter_schema(&self) -> Value {
        match self {
            ToolDescriptor::SendMessageToUser => json!({
                "type": "object",
                "properties": {
                    "agent_message": {
                        "type": "string",
                        "description": "The text to show the user."
                    }
                },
                "required": ["agent_message"]
            }),
            ToolDescriptor::Request(tool) => tool.parameter_schema.clone(),
        }
    }

    /// Render as one entry of an OpenAI-compatible `tools` array.
    pub fn to_openai_tool(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name(),
                "description": self.description(),
                "parameters": self.parameter_schema(),
            }
        })
    }

    pub fn default_tools(request_tools: &[RequestTool]) -> Vec<ToolDescriptor> {
        let mut tools = vec![ToolDescriptor::SendMessageToUser];
        tools.extend(request_tools.iter().cloned().map(ToolDescriptor::Request));
        tools
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_message_tool_requires_agent_message() {
        let desc = ToolDescriptor::SendMessageToUser;
        let schema = desc.parameter_schema();
        assert_eq!(schema["required"][0], "agent_message");
    }

    #[test]
    fn default_tools_always_includes_builtin_first() {
        let tools = ToolDescriptor::default_tools(&[]);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name(), SEND_MESSAGE_TOOL_NAME);
    }
}
