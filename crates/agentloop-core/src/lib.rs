//! agentloop-core: the per-turn chat loop, FSM model, feedback store,
//! and tool-call protocol driving a multi-turn LLM conversation.
//!
//! See `SPEC_FULL.md` at the workspace root for the full component
//! breakdown; this crate implements §3 through §8 of it.

pub mod config;
pub mod embedding;
pub mod error;
pub mod executor;
pub mod feedback;
pub mod fsm;
pub mod http;
pub mod llm;
pub mod model;
pub mod new_state;
pub mod orchestrator;
pub mod select_actions;
pub mod state_select;
pub mod token;
pub mod tool;
pub mod vector_store;

pub use config::Config;
pub use error::OrchestratorError;
pub use model::{Memory, Setting, Step};
pub use orchestrator::{ChatOrchestrator, ChatTurnRequest, ChatTurnResponse, ResultType};
