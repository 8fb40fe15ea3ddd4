//! Streaming support shared by LLM transports

mod tool_tracker;

pub use tool_tracker::ToolCallReducer;
