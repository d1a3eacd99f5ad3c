//! llmux - Uniform Calling Convention over Interchangeable LLM Backends
//!
//! This crate fronts multiple text-generation backends with one calling
//! convention and makes the redundancy useful: automatic backend selection,
//! retry with jittered backoff, permanent eviction of chronically failing
//! backends, a composable request/response hook protocol, and a multi-turn
//! tool-execution loop that gives streaming and non-streaming completion one
//! behavioral contract.
//!
//! # Architecture
//!
//! ```text
//! caller
//!   └─► HookedBackend (partition args, before/after hooks, stackable)
//!         └─► BackendPool (rate-limit-ordered selection, retry, eviction)
//!               └─► ChatBackend (tool loop, finish-reason policy)
//!                     └─► ChatTransport (vendor wire format, network I/O)
//! ```
//!
//! Every layer implements [`Queryable`], the same four operations, so the
//! layers compose in any order a deployment needs.
//!
//! # The four operations
//!
//! | Operation | Returns |
//! |-----------|---------|
//! | `query_text` | complete response text |
//! | `query_object` | JSON matching a supplied schema |
//! | `query_block` | the body of a named fenced block |
//! | `query_stream` | response text as incremental fragments |
//!
//! Argument keys written entirely in upper case are prompt arguments
//! (rendered into the user-facing message); everything else is forwarded to
//! the backend verbatim.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use llmux::{BackendPool, ChatBackend, QueryArgs, Queryable};
//! use llmux::providers::openai::OpenAiTransport;
//!
//! let backend = Arc::new(ChatBackend::new(Arc::new(OpenAiTransport::from_env()?)));
//! let pool = BackendPool::new(vec![backend]).with_max_retries(3);
//!
//! let answer = pool
//!     .query_text(QueryArgs::new().with("QUERY", "Why is the sky blue?"))
//!     .await?;
//! ```
//!
//! # See Also
//!
//! - [`crate::traits`] for the backend contract
//! - [`crate::pool`] for selection, retry, and eviction semantics
//! - [`crate::middleware`] for the hook protocol
//! - [`crate::chat`] for the tool loop and streaming normalization

pub mod aggregate;
pub mod args;
pub mod chat;
pub mod error;
pub mod middleware;
pub mod pool;
pub mod prompt;
pub mod providers;
pub mod rate_limit;
pub mod tools;
pub mod traits;

pub use aggregate::{AggregatedTurn, StreamAggregator};
pub use args::{is_prompt_key, merge_args, ArgMap, QueryArgs};
pub use chat::{ChatBackend, ChatRequest, ChatTransport, ChatTurn, UsageMeter};
pub use error::{LlmError, Result};
pub use middleware::{
    HookedBackend, IdentityHook, LogLevel, LoggingHook, MetricsHook, QueryHook, QueryOutcome,
};
pub use pool::BackendPool;
pub use providers::mock::MockTransport;
pub use providers::openai::{OpenAiConfig, OpenAiTransport};
pub use rate_limit::RateLimit;
pub use tools::{failure_payload, Tool, ToolRegistry};
pub use traits::{
    Backend, Capability, ChatMessage, ChatRole, ChunkStream, FinishReason, FunctionCall,
    FunctionDefinition, Queryable, QueryableExt, StreamChunk, TextStream, ToolCall, ToolChoice,
    ToolDefinition,
};
