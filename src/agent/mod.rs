//! Agent core: the chat/tool loop and its orchestration

mod agent_loop;
mod cancel;
mod events;
mod orchestrator;
mod rate_limit;

pub use agent_loop::{
    AgentLoop, AgentLoopConfig, ChunkSender, CANCELLED_NOTICE, MAX_ROUNDS_NOTICE,
};
pub use cancel::CancellationFlag;
pub use events::{estimate_history_tokens, estimate_tokens, ChatEntry, StreamingChunk};
pub use orchestrator::{
    plan_score, AutoApprove, ConfirmationHandler, Orchestrator, OrchestratorConfig,
};
pub use rate_limit::{RequestPacer, DEFAULT_MIN_REQUEST_INTERVAL};
