//! Chat orchestration: the tool-execution loop and stream normalization.
//!
//! A [`ChatBackend`] turns one logical request into the four uniform
//! operations over a vendor [`ChatTransport`]. One call may span many
//! round-trips: while the backend finishes a turn with `tool_calls`, the
//! orchestrator executes each requested tool, appends the assistant echo and
//! one tool-result message per call, and resends the whole conversation. An
//! optional `call_limit` api argument bounds the number of round-trips; each
//! round-trip consumes one unit.
//!
//! The streaming and non-streaming paths share one behavioral contract.
//! Without tools, `query_stream` stays token-incremental. With tools
//! registered, tool calls cannot execute from partial arguments, so the
//! stream is materialized internally and the final text is yielded once.
//!
//! Finish-reason policy, both paths: `stop`/`eos` succeed, `length` is
//! [`LlmError::ContextWindowExceeded`], `content_filter` is
//! [`LlmError::PolicyViolation`], anything else is
//! [`LlmError::UnexpectedFinishReason`], regardless of any content already
//! buffered for that turn.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

use crate::aggregate::{AggregatedTurn, StreamAggregator};
use crate::args::{ArgMap, QueryArgs};
use crate::error::{LlmError, Result};
use crate::prompt::{extract_block, render_prompt_args, value_to_text};
use crate::rate_limit::RateLimit;
use crate::tools::{failure_payload, Tool, ToolRegistry};
use crate::traits::{
    Backend, Capability, ChatMessage, ChunkStream, FinishReason, Queryable, StreamChunk,
    TextStream, ToolCall, ToolDefinition,
};

// ============================================================================
// Transport Boundary
// ============================================================================

/// One round-trip request to a vendor chat endpoint.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Conversation messages, in order.
    pub messages: Vec<ChatMessage>,

    /// Declared tools the model may call.
    pub tools: Vec<ToolDefinition>,

    /// Tool selection override; defaults to automatic when tools are present.
    pub tool_choice: Option<JsonValue>,

    /// Response format constraint (e.g. a JSON schema envelope).
    pub response_format: Option<JsonValue>,

    /// Remaining api arguments, forwarded to the vendor verbatim.
    pub extra: ArgMap,
}

/// Completed result of one round-trip.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    /// Generated text content.
    pub content: String,

    /// Tool calls requested by the model, if any.
    pub tool_calls: Vec<ToolCall>,

    /// Reported finish reason.
    pub finish_reason: Option<FinishReason>,

    /// Total tokens consumed by the turn.
    pub total_tokens: usize,
}

impl ChatTurn {
    /// A turn that answered directly with text.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            finish_reason: Some(FinishReason::Stop),
            total_tokens: 0,
        }
    }

    /// A turn that requested tool calls.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            content: String::new(),
            tool_calls: calls,
            finish_reason: Some(FinishReason::ToolCalls),
            total_tokens: 0,
        }
    }

    /// A turn that ended with the given finish reason.
    pub fn finished(content: impl Into<String>, reason: FinishReason) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            finish_reason: Some(reason),
            total_tokens: 0,
        }
    }

    /// Set the token total.
    pub fn with_tokens(mut self, total_tokens: usize) -> Self {
        self.total_tokens = total_tokens;
        self
    }
}

/// Vendor boundary: maps the uniform request onto one wire format.
///
/// Implementations own identity, capability declaration, and the rate-limit
/// hint; the orchestrator owns everything else.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Transport name, for logging and diagnostics.
    fn name(&self) -> &str;

    /// Declared capability chain, most specific first.
    fn capabilities(&self) -> &[Capability];

    /// Rate-limit hint for pool selection.
    fn rate_limit(&self) -> &RateLimit;

    /// Run one round-trip to completion.
    async fn create(&self, request: &ChatRequest) -> Result<ChatTurn>;

    /// Run one round-trip as an incremental chunk stream.
    async fn create_stream(&self, request: &ChatRequest) -> Result<ChunkStream>;
}

// ============================================================================
// Usage Metering
// ============================================================================

/// Running token total for one chat backend.
#[derive(Debug, Default)]
pub struct UsageMeter {
    tokens_consumed: AtomicU64,
}

impl UsageMeter {
    /// Add consumed tokens.
    pub fn add(&self, tokens: usize) {
        self.tokens_consumed
            .fetch_add(tokens as u64, Ordering::Relaxed);
    }

    /// Total tokens consumed so far.
    pub fn tokens_consumed(&self) -> u64 {
        self.tokens_consumed.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Arguments popped off the api side before a request is built.
struct PreparedCall {
    request: ChatRequest,
    call_limit: Option<i64>,
}

/// A [`Backend`] that drives the tool loop over a [`ChatTransport`].
pub struct ChatBackend {
    transport: Arc<dyn ChatTransport>,
    tools: ToolRegistry,
    meter: Arc<UsageMeter>,
}

impl ChatBackend {
    /// Wrap a transport with no tools registered.
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            transport,
            tools: ToolRegistry::new(),
            meter: Arc::new(UsageMeter::default()),
        }
    }

    /// Register a tool the model may call.
    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tools.register(tool);
        self
    }

    /// Token meter for this backend.
    pub fn meter(&self) -> Arc<UsageMeter> {
        self.meter.clone()
    }

    /// Split args into a request plus loop controls.
    fn prepare(&self, args: QueryArgs) -> Result<PreparedCall> {
        let (prompt_args, mut api_args) = args.partition();

        let call_limit = match api_args.remove("call_limit") {
            Some(value) => {
                let limit = value.as_i64().ok_or_else(|| {
                    LlmError::InvalidRequest("call_limit must be an integer".to_string())
                })?;
                if limit < 0 {
                    return Err(LlmError::InvalidRequest(
                        "call_limit must be non-negative".to_string(),
                    ));
                }
                Some(limit)
            }
            None => None,
        };

        let mut messages: Vec<ChatMessage> = match api_args.remove("messages") {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };
        if !prompt_args.is_empty() {
            messages.push(ChatMessage::user(render_prompt_args(&prompt_args)));
        }

        let tool_choice = api_args.remove("tool_choice");
        let response_format = api_args.remove("response_format");
        // The operation shape decides streaming; a stray flag is dropped.
        api_args.remove("stream");

        let tools = self.tools.definitions();
        let tool_choice = if tools.is_empty() {
            tool_choice
        } else {
            tool_choice.or_else(|| Some(json!("auto")))
        };

        Ok(PreparedCall {
            request: ChatRequest {
                messages,
                tools,
                tool_choice,
                response_format,
                extra: api_args,
            },
            call_limit,
        })
    }

    /// Charge one round-trip against the budget.
    fn charge_round(call_limit: &mut Option<i64>) -> Result<()> {
        if let Some(limit) = call_limit {
            if *limit <= 0 {
                return Err(LlmError::ToolCallLimitExceeded);
            }
            *limit -= 1;
        }
        Ok(())
    }

    /// Map a terminal finish reason onto the call outcome.
    fn settle(content: String, finish_reason: Option<FinishReason>) -> Result<String> {
        match finish_reason {
            Some(FinishReason::Stop) | Some(FinishReason::Eos) => Ok(content),
            Some(FinishReason::Length) => Err(LlmError::ContextWindowExceeded),
            Some(FinishReason::ContentFilter) => Err(LlmError::PolicyViolation),
            Some(other) => Err(LlmError::UnexpectedFinishReason(
                other.as_str().to_string(),
            )),
            None => Err(LlmError::UnexpectedFinishReason("missing".to_string())),
        }
    }

    /// Execute one round's tool calls and append the resulting messages.
    ///
    /// JSON argument parse errors are fatal; lookup misses and handler
    /// failures become model-visible payloads instead.
    async fn execute_tool_calls(
        &self,
        messages: &mut Vec<ChatMessage>,
        calls: &[ToolCall],
    ) -> Result<()> {
        messages.push(ChatMessage::assistant_with_tools("", calls.to_vec()));

        for call in calls {
            let arguments: JsonValue = serde_json::from_str(call.arguments())?;

            let content = match self.tools.get(call.name()) {
                Some(tool) => match tool.invoke(arguments.clone()).await {
                    Ok(value) => value_to_text(&value),
                    Err(error) => {
                        debug!(
                            tool = call.name(),
                            error = %error,
                            "tool invocation failed, reporting to model"
                        );
                        failure_payload(
                            "ToolExecutionFailure",
                            &error.to_string(),
                            call.name(),
                            &arguments,
                        )
                    }
                },
                None => failure_payload(
                    "UnknownTool",
                    &format!("no tool registered under '{}'", call.name()),
                    call.name(),
                    &arguments,
                ),
            };

            messages.push(ChatMessage::tool_result(&call.id, call.name(), content));
        }

        Ok(())
    }

    /// Drive the materialized loop until the model stops requesting tools.
    async fn run_to_completion(&self, prepared: PreparedCall) -> Result<ChatTurn> {
        let PreparedCall {
            mut request,
            mut call_limit,
        } = prepared;

        let mut turn = self.transport.create(&request).await?;
        self.meter.add(turn.total_tokens);

        while turn.finish_reason == Some(FinishReason::ToolCalls) {
            Self::charge_round(&mut call_limit)?;
            self.execute_tool_calls(&mut request.messages, &turn.tool_calls)
                .await?;
            turn = self.transport.create(&request).await?;
            self.meter.add(turn.total_tokens);
        }

        Ok(turn)
    }

    /// Run one streamed round-trip to full materialization.
    async fn collect_stream_turn(&self, request: &ChatRequest) -> Result<AggregatedTurn> {
        let mut stream = self.transport.create_stream(request).await?;
        let mut aggregator = StreamAggregator::new();
        while let Some(chunk) = stream.next().await {
            aggregator.feed(chunk?);
        }
        let turn = aggregator.finish();
        self.meter.add(turn.tokens_consumed);
        Ok(turn)
    }
}

#[async_trait]
impl Queryable for ChatBackend {
    async fn query_text(&self, args: QueryArgs) -> Result<String> {
        let prepared = self.prepare(args)?;
        let turn = self.run_to_completion(prepared).await?;
        Self::settle(turn.content, turn.finish_reason)
    }

    async fn query_object(&self, schema: &JsonValue, args: QueryArgs) -> Result<JsonValue> {
        let mut prepared = self.prepare(args)?;

        prepared.request.messages.extend(object_query_messages(schema));

        let (wire_schema, wrapped) = wrap_schema(schema);
        let mut strict_schema = wire_schema;
        if let Some(obj) = strict_schema.as_object_mut() {
            obj.insert("strict".to_string(), json!(true));
        }
        prepared.request.response_format = Some(json!({
            "type": "json_schema",
            "json_schema": {
                "name": "response",
                "schema": strict_schema,
            },
        }));

        let turn = self.run_to_completion(prepared).await?;
        let text = Self::settle(turn.content, turn.finish_reason)?;
        let mut value: JsonValue = serde_json::from_str(&text)?;

        if wrapped {
            value = value
                .get_mut("data")
                .map(JsonValue::take)
                .ok_or_else(|| {
                    LlmError::ApiError("structured response missing data envelope".to_string())
                })?;
        }
        Ok(value)
    }

    async fn query_block(&self, kind: &str, args: QueryArgs) -> Result<String> {
        let mut prepared = self.prepare(args)?;
        prepared.request.messages.push(ChatMessage::system(format!(
            "Respond with your answer inside a single fenced code block tagged `{}`. \
             Put nothing outside the block.",
            kind
        )));

        let turn = self.run_to_completion(prepared).await?;
        let text = Self::settle(turn.content, turn.finish_reason)?;
        extract_block(&text, kind).ok_or_else(|| LlmError::MissingBlock(kind.to_string()))
    }

    async fn query_stream(&self, args: QueryArgs) -> Result<TextStream> {
        let prepared = self.prepare(args)?;

        if self.tools.is_empty() {
            // Token-incremental: chunks flow straight through, fatal finish
            // reasons surface as a trailing stream error.
            let mut stream = self.transport.create_stream(&prepared.request).await?;
            let meter = self.meter.clone();

            let out = async_stream::stream! {
                let mut tally = 0usize;
                let mut finish_reason: Option<FinishReason> = None;

                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(StreamChunk::Content(text)) => {
                            tally += 1;
                            if !text.is_empty() {
                                yield Ok(text);
                            }
                        }
                        Ok(StreamChunk::Usage { total_tokens }) => {
                            tally = total_tokens;
                        }
                        Ok(StreamChunk::Finished { reason }) => {
                            tally += 1;
                            if finish_reason.is_none() {
                                finish_reason = Some(reason);
                            }
                        }
                        Ok(StreamChunk::ToolCallDelta { .. }) => {
                            tally += 1;
                        }
                        Err(error) => {
                            yield Err(error);
                            return;
                        }
                    }
                }
                meter.add(tally);

                match finish_reason {
                    Some(FinishReason::Length) => yield Err(LlmError::ContextWindowExceeded),
                    Some(FinishReason::ContentFilter) => yield Err(LlmError::PolicyViolation),
                    Some(FinishReason::Other(reason)) => {
                        yield Err(LlmError::UnexpectedFinishReason(reason))
                    }
                    _ => {}
                }
            };
            return Ok(Box::pin(out));
        }

        // With tools registered the call must materialize before any tool can
        // run, so the stream degrades to buffer-fully-then-yield-once.
        let PreparedCall {
            mut request,
            mut call_limit,
        } = prepared;

        let mut turn = self.collect_stream_turn(&request).await?;
        while turn.finish_reason == Some(FinishReason::ToolCalls) {
            Self::charge_round(&mut call_limit)?;
            self.execute_tool_calls(&mut request.messages, &turn.tool_calls)
                .await?;
            turn = self.collect_stream_turn(&request).await?;
        }

        let text = Self::settle(turn.text, turn.finish_reason)?;
        Ok(Box::pin(futures::stream::once(async move {
            Ok::<_, LlmError>(text)
        })))
    }
}

impl Backend for ChatBackend {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn capabilities(&self) -> &[Capability] {
        self.transport.capabilities()
    }

    fn rate_limit(&self) -> &RateLimit {
        self.transport.rate_limit()
    }
}

// ============================================================================
// Structured-Query Helpers
// ============================================================================

/// Instruction pair steering the model toward schema-conformant JSON.
fn object_query_messages(schema: &JsonValue) -> Vec<ChatMessage> {
    let rendered =
        serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    vec![
        ChatMessage::system(format!(
            "Your task is to understand the content and provide the parsed objects \
             in json that matches the following json_schema:\n\n{}\n\n\
             Make sure to return an instance of the JSON, not the schema itself.",
            rendered
        )),
        ChatMessage::user(
            "Return the correct JSON response, not the JSON_SCHEMA. Use only fields \
             specified by the JSON_SCHEMA and nothing else.",
        ),
    ]
}

/// Wrap non-object schemas in a `{data: …}` envelope; the wire format only
/// accepts top-level objects. Returns the wire schema and whether the
/// response must be unwrapped.
fn wrap_schema(schema: &JsonValue) -> (JsonValue, bool) {
    if schema.get("type") == Some(&json!("object")) {
        return (schema.clone(), false);
    }

    let mut data_schema = Map::new();
    data_schema.insert("title".to_string(), json!("Data"));
    if let Some(fields) = schema.as_object() {
        for (key, value) in fields {
            data_schema.insert(key.clone(), value.clone());
        }
    }

    (
        json!({
            "properties": { "data": JsonValue::Object(data_schema) },
            "required": ["data"],
            "title": "Wrapper",
            "type": "object",
        }),
        true,
    )
}
