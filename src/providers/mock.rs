//! Scripted mock transport for testing.
//!
//! [`MockTransport`] replays queued turns and chunk scripts without any
//! network access, recording every request it receives so tests can assert
//! on conversation shape, forwarded arguments, and round-trip counts.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;

use crate::chat::{ChatRequest, ChatTransport, ChatTurn};
use crate::error::{LlmError, Result};
use crate::rate_limit::RateLimit;
use crate::traits::{Capability, ChunkStream, StreamChunk};

/// One scripted reply.
enum ScriptedReply {
    /// A completed turn (or failure) for `create`.
    Turn(Result<ChatTurn>),
    /// A chunk sequence for `create_stream`.
    Chunks(Vec<Result<StreamChunk>>),
}

/// Deterministic [`ChatTransport`] that replays scripted replies in order.
pub struct MockTransport {
    name: String,
    capabilities: Vec<Capability>,
    limit: RateLimit,
    script: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockTransport {
    /// New mock with an empty script.
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            capabilities: vec![Capability::ToolUse, Capability::Chat, Capability::Any],
            limit: RateLimit::unlimited(),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Rename the mock (useful when pooling several).
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::new()
        }
    }

    /// Queue a completed turn for the next `create` call.
    pub fn script_turn(&self, turn: ChatTurn) {
        self.script
            .lock()
            .expect("mock script lock")
            .push_back(ScriptedReply::Turn(Ok(turn)));
    }

    /// Queue a failure for the next `create` call.
    pub fn script_error(&self, error: LlmError) {
        self.script
            .lock()
            .expect("mock script lock")
            .push_back(ScriptedReply::Turn(Err(error)));
    }

    /// Queue a chunk sequence for the next `create_stream` call.
    pub fn script_chunks(&self, chunks: Vec<StreamChunk>) {
        self.script
            .lock()
            .expect("mock script lock")
            .push_back(ScriptedReply::Chunks(chunks.into_iter().map(Ok).collect()));
    }

    /// Queue a chunk sequence that may carry mid-stream errors.
    pub fn script_chunk_results(&self, chunks: Vec<Result<StreamChunk>>) {
        self.script
            .lock()
            .expect("mock script lock")
            .push_back(ScriptedReply::Chunks(chunks));
    }

    /// Every request this transport has received, in order.
    pub fn requests_seen(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("mock request lock").clone()
    }

    /// Number of round-trips made against this transport.
    pub fn round_trips(&self) -> usize {
        self.requests.lock().expect("mock request lock").len()
    }

    fn record(&self, request: &ChatRequest) {
        self.requests
            .lock()
            .expect("mock request lock")
            .push(request.clone());
    }

    fn next_reply(&self) -> Option<ScriptedReply> {
        self.script.lock().expect("mock script lock").pop_front()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn rate_limit(&self) -> &RateLimit {
        &self.limit
    }

    async fn create(&self, request: &ChatRequest) -> Result<ChatTurn> {
        self.record(request);
        match self.next_reply() {
            Some(ScriptedReply::Turn(result)) => result,
            Some(ScriptedReply::Chunks(_)) => Err(LlmError::NotSupported(
                "mock scripted a chunk stream but create() was called".to_string(),
            )),
            None => Ok(ChatTurn::text("mock response")),
        }
    }

    async fn create_stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        self.record(request);
        match self.next_reply() {
            Some(ScriptedReply::Chunks(chunks)) => Ok(futures::stream::iter(chunks).boxed()),
            Some(ScriptedReply::Turn(Err(error))) => Err(error),
            Some(ScriptedReply::Turn(Ok(_))) => Err(LlmError::NotSupported(
                "mock scripted a turn but create_stream() was called".to_string(),
            )),
            None => Ok(futures::stream::iter(vec![
                Ok(StreamChunk::Content("mock response".to_string())),
                Ok(StreamChunk::Finished {
                    reason: crate::traits::FinishReason::Stop,
                }),
            ])
            .boxed()),
        }
    }
}
