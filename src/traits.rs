//! Backend traits and the shared request/response vocabulary.
//!
//! # WHY: Trait-Based Backend Abstraction
//!
//! Using traits instead of concrete types enables:
//! - **Testing**: scripted mock backends for unit tests (no API calls)
//! - **Flexibility**: swap vendors without code changes
//! - **Resilience**: pool redundant backends behind one calling convention
//!
//! # Key Traits
//!
//! - [`Queryable`]: the four uniform operations every calling layer exposes
//! - [`Backend`]: a queryable with identity, capabilities, and a rate-limit hint
//!
//! Every layer in the stack (hook chains, the backend pool, concrete
//! backends) implements [`Queryable`], so layers compose freely.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use futures::stream::BoxStream;

use crate::args::QueryArgs;
use crate::error::Result;
use crate::rate_limit::RateLimit;

/// A finite, single-pass stream of response text fragments.
pub type TextStream = BoxStream<'static, Result<String>>;

/// A finite, single-pass stream of raw completion chunks.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk>>;

// ============================================================================
// The Four Uniform Operations
// ============================================================================

/// The uniform calling convention: four operations, one argument bag.
///
/// Argument keys written entirely in upper case are prompt arguments; all
/// other keys are api arguments forwarded verbatim. See [`crate::args`].
#[async_trait]
pub trait Queryable: Send + Sync {
    /// Full-text query: run the request to completion and return the text.
    async fn query_text(&self, args: QueryArgs) -> Result<String>;

    /// Structured-object query: given a target JSON schema, return parsed
    /// JSON data matching it.
    async fn query_object(&self, schema: &JsonValue, args: QueryArgs) -> Result<JsonValue>;

    /// Named-block query: steer the response into a fenced block of the
    /// named content type and return the block body.
    async fn query_block(&self, kind: &str, args: QueryArgs) -> Result<String>;

    /// Incremental-chunk query: return response text as a finite stream of
    /// fragments in arrival order.
    async fn query_stream(&self, args: QueryArgs) -> Result<TextStream>;
}

/// Typed convenience layer over [`Queryable::query_object`].
#[async_trait]
pub trait QueryableExt: Queryable {
    /// Run a structured-object query and deserialize the result.
    async fn query_object_as<T: DeserializeOwned>(
        &self,
        schema: &JsonValue,
        args: QueryArgs,
    ) -> Result<T> {
        let value = self.query_object(schema, args).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl<Q: Queryable + ?Sized> QueryableExt for Q {}

/// A vendor backend: the four operations plus identity and bookkeeping.
pub trait Backend: Queryable {
    /// Name of this backend, for logging and diagnostics.
    fn name(&self) -> &str;

    /// Declared capability chain, most specific first, ending in
    /// [`Capability::Any`]. Fixed at construction time.
    fn capabilities(&self) -> &[Capability];

    /// Rate-limit hint read by pool selection. The backend records its own
    /// requests; the pool only reads the next-allowed ordering key.
    fn rate_limit(&self) -> &RateLimit;
}

/// Capability tags used to compute the most specific capability shared by a
/// pool of heterogeneous backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Speaks the OpenAI chat-completions wire format.
    OpenAiChat,
    /// Can request and execute tool calls.
    ToolUse,
    /// Multi-turn chat completion.
    Chat,
    /// Universal fallback shared by every backend.
    Any,
}

// ============================================================================
// Chat Messages
// ============================================================================

/// Role of a chat message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System message for setting context.
    System,
    /// User input message.
    User,
    /// Assistant response message.
    Assistant,
    /// Tool result message.
    Tool,
}

impl ChatRole {
    /// String form of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender.
    pub role: ChatRole,

    /// Content of the message.
    pub content: String,

    /// Optional name, used on tool-result messages to echo the tool name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Tool calls made by the assistant (assistant role only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// Tool call this message answers (tool role only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create an assistant message echoing tool-call requests.
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            name: None,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
        }
    }

    /// Create a tool-result message answering one tool call.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            name: Some(name.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

// ============================================================================
// Tool Calling Types
// ============================================================================

/// Declaration of a tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Type of tool (always "function").
    #[serde(rename = "type")]
    pub tool_type: String,

    /// Function declaration.
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    /// Create a function tool declaration.
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: JsonValue,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Declaration of a callable function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Name of the function.
    pub name: String,

    /// What the function does.
    pub description: String,

    /// JSON Schema for the function parameters.
    pub parameters: JsonValue,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this call.
    pub id: String,

    /// Type of call (always "function").
    #[serde(rename = "type")]
    pub call_type: String,

    /// Function call details.
    pub function: FunctionCall,
}

impl ToolCall {
    /// Create a function call with the given id, name, and JSON argument text.
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Function name.
    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Raw JSON argument text.
    pub fn arguments(&self) -> &str {
        &self.function.arguments
    }
}

/// Name and JSON-encoded arguments of a function call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Name of the function to call.
    pub name: String,

    /// JSON-encoded arguments.
    pub arguments: String,
}

/// How the model selects among declared tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// A mode keyword: "auto", "required", or "none".
    Mode(String),

    /// Force a specific function.
    Function {
        #[serde(rename = "type")]
        choice_type: String,
        function: ToolChoiceFunction,
    },
}

impl ToolChoice {
    /// Model decides when to use tools.
    pub fn auto() -> Self {
        ToolChoice::Mode("auto".to_string())
    }

    /// Model must use at least one tool.
    pub fn required() -> Self {
        ToolChoice::Mode("required".to_string())
    }

    /// Disable tool calling.
    pub fn none() -> Self {
        ToolChoice::Mode("none".to_string())
    }

    /// Force one specific function.
    pub fn function(name: impl Into<String>) -> Self {
        ToolChoice::Function {
            choice_type: "function".to_string(),
            function: ToolChoiceFunction { name: name.into() },
        }
    }
}

/// Named function forced by [`ToolChoice::function`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoiceFunction {
    /// Name of the function to call.
    pub name: String,
}

// ============================================================================
// Finish Reasons and Stream Chunks
// ============================================================================

/// Backend-reported outcome of a single completion turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural stop.
    Stop,
    /// End-of-sequence token (some vendors report this instead of stop).
    Eos,
    /// Output truncated by the context window.
    Length,
    /// Output withheld by a content filter.
    ContentFilter,
    /// The model requested tool calls.
    ToolCalls,
    /// Anything outside the known vocabulary; treated as fatal.
    Other(String),
}

impl FinishReason {
    /// Parse a vendor-reported finish reason string.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" => FinishReason::Stop,
            "eos" => FinishReason::Eos,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            "tool_calls" => FinishReason::ToolCalls,
            other => FinishReason::Other(other.to_string()),
        }
    }

    /// Whether this reason means the model answered directly.
    pub fn is_success(&self) -> bool {
        matches!(self, FinishReason::Stop | FinishReason::Eos)
    }

    /// String form of the reason.
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Eos => "eos",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Other(s) => s,
        }
    }
}

/// One incremental fragment of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Partial content text.
    Content(String),

    /// Incremental tool call data. A fragment with a fresh `id` starts a new
    /// call; id-less fragments extend the current one.
    ToolCallDelta {
        /// Tool call id (sent once at the start of each call).
        id: Option<String>,
        /// Function name (sent once at the start of each call).
        name: Option<String>,
        /// Incremental JSON argument text.
        arguments: Option<String>,
    },

    /// Authoritative usage totals; replaces any running per-chunk estimate.
    Usage {
        /// Total tokens consumed by the turn so far.
        total_tokens: usize,
    },

    /// Stream finished with the given reason.
    Finished {
        /// Reported finish reason.
        reason: FinishReason,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_message_constructors() {
        let system = ChatMessage::system("You are helpful");
        assert_eq!(system.role, ChatRole::System);

        let user = ChatMessage::user("Hello");
        assert_eq!(user.role, ChatRole::User);

        let assistant = ChatMessage::assistant("Hi there!");
        assert_eq!(assistant.role, ChatRole::Assistant);
    }

    #[test]
    fn test_chat_message_tool_result() {
        let msg = ChatMessage::tool_result("call_1", "get_weather", "sunny, 20C");
        assert_eq!(msg.role, ChatRole::Tool);
        assert_eq!(msg.tool_call_id, Some("call_1".to_string()));
        assert_eq!(msg.name, Some("get_weather".to_string()));
        assert_eq!(msg.content, "sunny, 20C");
    }

    #[test]
    fn test_assistant_with_empty_tools() {
        let msg = ChatMessage::assistant_with_tools("just text", vec![]);
        assert!(msg.tool_calls.is_none());
    }

    #[test]
    fn test_assistant_with_tools_serialization() {
        let msg = ChatMessage::assistant_with_tools(
            "",
            vec![ToolCall::function("c1", "search", "{}")],
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["tool_calls"][0]["id"], "c1");
        assert_eq!(json["tool_calls"][0]["type"], "function");
        assert_eq!(json["tool_calls"][0]["function"]["name"], "search");
        // Absent options are omitted entirely (skip_serializing_if)
        assert!(!json.as_object().unwrap().contains_key("tool_call_id"));
    }

    #[test]
    fn test_chat_role_serialization() {
        assert_eq!(serde_json::to_value(ChatRole::User).unwrap(), "user");
        assert_eq!(serde_json::to_value(ChatRole::Tool).unwrap(), "tool");
    }

    #[test]
    fn test_tool_definition_constructor() {
        let tool = ToolDefinition::function("my_func", "Does something", json!({"type": "object"}));
        assert_eq!(tool.tool_type, "function");
        assert_eq!(tool.function.name, "my_func");

        let json = serde_json::to_value(&tool).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "my_func");
    }

    #[test]
    fn test_tool_call_accessors() {
        let tc = ToolCall::function("call_1", "get_weather", r#"{"city": "Paris"}"#);
        assert_eq!(tc.name(), "get_weather");
        assert_eq!(tc.arguments(), r#"{"city": "Paris"}"#);
    }

    #[test]
    fn test_tool_choice_serialization() {
        assert_eq!(serde_json::to_value(ToolChoice::auto()).unwrap(), "auto");
        assert_eq!(
            serde_json::to_value(ToolChoice::required()).unwrap(),
            "required"
        );

        let forced = serde_json::to_value(ToolChoice::function("get_weather")).unwrap();
        assert_eq!(forced["type"], "function");
        assert_eq!(forced["function"]["name"], "get_weather");
    }

    #[test]
    fn test_finish_reason_parse() {
        assert_eq!(FinishReason::parse("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::parse("eos"), FinishReason::Eos);
        assert_eq!(FinishReason::parse("length"), FinishReason::Length);
        assert_eq!(
            FinishReason::parse("content_filter"),
            FinishReason::ContentFilter
        );
        assert_eq!(FinishReason::parse("tool_calls"), FinishReason::ToolCalls);
        assert_eq!(
            FinishReason::parse("function_call"),
            FinishReason::Other("function_call".to_string())
        );
    }

    #[test]
    fn test_finish_reason_success() {
        assert!(FinishReason::Stop.is_success());
        assert!(FinishReason::Eos.is_success());
        assert!(!FinishReason::Length.is_success());
        assert!(!FinishReason::ToolCalls.is_success());
    }

    #[test]
    fn test_finish_reason_round_trip() {
        for raw in ["stop", "eos", "length", "content_filter", "tool_calls", "odd"] {
            assert_eq!(FinishReason::parse(raw).as_str(), raw);
        }
    }
}
