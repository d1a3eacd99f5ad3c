//! Concrete chat transports.
//!
//! Each transport owns the mapping between the uniform [`crate::chat::ChatRequest`]
//! and one vendor wire format. Everything above the transport (pooling,
//! hooks, the tool loop) is vendor-agnostic.

pub mod mock;
pub mod openai;
