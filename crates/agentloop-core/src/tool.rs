//! Re-exports of the tool descriptors from `agentloop_tools`, kept under
//! `crate::tool` so the rest of the core doesn't need to know the
//! descriptor types live in a separate crate.

pub use agentloop_tools::{
    HttpMethod, RequestTool, RequestToolError, RequestToolOutcome, ToolDescriptor, SEND_MESSAGE_TOOL_NAME,
};
