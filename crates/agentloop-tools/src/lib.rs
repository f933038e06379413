//! Tool descriptors and the HTTP request tool.
//!
//! This crate knows nothing about conversation memory or the FSM — it only
//! describes what a tool looks like to the LLM (name, description, JSON
//! schema) and how to execute the one kind of tool that isn't built in:
//! an HTTP request templated from the model's arguments.

pub mod descriptor;
pub mod request;

pub use descriptor::{ToolDescriptor, SEND_MESSAGE_TOOL_NAME};
pub use request::{HttpMethod, RequestTool, RequestToolError, RequestToolOutcome};
