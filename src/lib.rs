//! grok-core: autonomous agent core for a terminal AI coding assistant
//!
//! This library provides:
//! - An agent loop driving LLM chat/tool round-trips with streaming,
//!   bounded rounds, rate limiting, and cooperative cancellation
//! - Self-correction and fallback handling for recoverable tool failures
//! - Content-hash idempotency and loop detection over file operations
//! - A task planner/validator/executor with snapshots and auto-rollback
//! - An orchestrator façade exposing a streaming request surface

pub mod agent;
pub mod config;
pub mod llm;
pub mod mcp;
pub mod metrics;
pub mod planner;
pub mod storage;
pub mod tools;
pub mod tracking;

pub use agent::{CancellationFlag, Orchestrator, StreamingChunk};
pub use config::Settings;
