//! OpenAI-compatible chat transport.
//!
//! Speaks the OpenAI chat-completions format and therefore works against any
//! compatible endpoint (OpenAI itself, or local and hosted services that
//! implement the same API). The transport maps the uniform [`ChatRequest`]
//! onto the wire body, forwards extra api arguments verbatim, and parses
//! both completed responses and SSE chunk streams.
//!
//! # Configuration
//!
//! ```ignore
//! use llmux::providers::openai::{OpenAiConfig, OpenAiTransport};
//!
//! let transport = OpenAiTransport::new(
//!     OpenAiConfig::new("gpt-4o-mini").with_api_key("sk-...")
//! )?;
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::chat::{ChatRequest, ChatTransport, ChatTurn};
use crate::error::{LlmError, Result};
use crate::rate_limit::RateLimit;
use crate::traits::{Capability, ChunkStream, FinishReason, StreamChunk, ToolCall};

/// Default public endpoint.
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

// ============================================================================
// Configuration
// ============================================================================

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Provider label used in logs.
    pub name: String,
    /// API base URL (without the `/chat/completions` suffix).
    pub base_url: String,
    /// Bearer token; empty for unauthenticated local servers.
    pub api_key: String,
    /// Model name sent with every request.
    pub model: String,
    /// Request-rate hint used by pool selection; `None` means unlimited.
    pub requests_per_minute: Option<usize>,
    /// Request timeout.
    pub timeout: Duration,
}

impl OpenAiConfig {
    /// Settings for the given model against the public endpoint.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            name: "openai".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            model: model.into(),
            requests_per_minute: None,
            timeout: Duration::from_secs(120),
        }
    }

    /// Set the provider label.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Point at a different OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the bearer token.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Declare the request-rate budget for pool ordering.
    pub fn with_requests_per_minute(mut self, rpm: usize) -> Self {
        self.requests_per_minute = Some(rpm);
        self
    }

    /// Read settings from `OPENAI_API_KEY`, `OPENAI_BASE_URL`, and
    /// `OPENAI_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            LlmError::ConfigError(
                "OPENAI_API_KEY not set. Export it with: export OPENAI_API_KEY=your-api-key"
                    .to_string(),
            )
        })?;
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model =
            std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        Ok(Self::new(model)
            .with_api_key(api_key)
            .with_base_url(base_url))
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: Option<WireMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    total_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    error: WireErrorDetail,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    delta: Option<WireDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    id: Option<String>,
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

// ============================================================================
// Transport
// ============================================================================

/// [`ChatTransport`] for OpenAI-compatible endpoints.
pub struct OpenAiTransport {
    client: Client,
    config: OpenAiConfig,
    limit: RateLimit,
    capabilities: Vec<Capability>,
}

impl OpenAiTransport {
    /// Build a transport from explicit settings.
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::ConfigError(format!("failed to build HTTP client: {}", e)))?;

        let limit = match config.requests_per_minute {
            Some(rpm) => RateLimit::per_minute(rpm),
            None => RateLimit::unlimited(),
        };

        debug!(
            provider = config.name,
            model = config.model,
            base_url = config.base_url,
            "created OpenAI-compatible transport"
        );

        Ok(Self {
            client,
            config,
            limit,
            capabilities: vec![
                Capability::OpenAiChat,
                Capability::ToolUse,
                Capability::Chat,
                Capability::Any,
            ],
        })
    }

    /// Build a transport from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(OpenAiConfig::from_env()?)
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    /// Assemble the wire body: extra api arguments first, then the fields the
    /// orchestrator owns, so the model and conversation cannot be clobbered.
    fn build_body(&self, request: &ChatRequest, stream: bool) -> Result<JsonValue> {
        let mut body: Map<String, JsonValue> = request.extra.clone();

        body.insert("model".to_string(), json!(self.config.model));
        body.insert(
            "messages".to_string(),
            serde_json::to_value(&request.messages)?,
        );
        if !request.tools.is_empty() {
            body.insert("tools".to_string(), serde_json::to_value(&request.tools)?);
        }
        if let Some(tool_choice) = &request.tool_choice {
            body.insert("tool_choice".to_string(), tool_choice.clone());
        }
        if let Some(response_format) = &request.response_format {
            body.insert("response_format".to_string(), response_format.clone());
        }
        if stream {
            body.insert("stream".to_string(), json!(true));
            body.insert("stream_options".to_string(), json!({"include_usage": true}));
        }

        Ok(JsonValue::Object(body))
    }

    fn request_builder(&self, body: &JsonValue) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(self.chat_completions_url());
        if !self.config.api_key.is_empty() {
            builder = builder.header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.config.api_key),
            );
        }
        builder.json(body)
    }
}

/// Convert a parsed wire response into a [`ChatTurn`].
fn turn_from_wire(wire: WireResponse) -> Result<ChatTurn> {
    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::ApiError("response contained no choices".to_string()))?;

    let (content, tool_calls) = match choice.message {
        Some(message) => (
            message.content.unwrap_or_default(),
            message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| ToolCall::function(tc.id, tc.function.name, tc.function.arguments))
                .collect(),
        ),
        None => (String::new(), Vec::new()),
    };

    Ok(ChatTurn {
        content,
        tool_calls,
        finish_reason: choice.finish_reason.as_deref().map(FinishReason::parse),
        total_tokens: wire.usage.and_then(|u| u.total_tokens).unwrap_or(0),
    })
}

/// Convert one SSE payload into zero or more stream chunks.
fn chunks_from_wire(wire: WireChunk) -> Vec<Result<StreamChunk>> {
    let mut out = Vec::new();

    if let Some(choice) = wire.choices.into_iter().next() {
        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content {
                if !content.is_empty() {
                    out.push(Ok(StreamChunk::Content(content)));
                }
            }
            for tool_call in delta.tool_calls.unwrap_or_default() {
                let (name, arguments) = match tool_call.function {
                    Some(function) => (function.name, function.arguments),
                    None => (None, None),
                };
                out.push(Ok(StreamChunk::ToolCallDelta {
                    id: tool_call.id,
                    name,
                    arguments,
                }));
            }
        }
        if let Some(reason) = choice.finish_reason {
            out.push(Ok(StreamChunk::Finished {
                reason: FinishReason::parse(&reason),
            }));
        }
    }

    if let Some(total_tokens) = wire.usage.and_then(|u| u.total_tokens) {
        out.push(Ok(StreamChunk::Usage { total_tokens }));
    }

    out
}

#[async_trait]
impl ChatTransport for OpenAiTransport {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn rate_limit(&self) -> &RateLimit {
        &self.limit
    }

    async fn create(&self, request: &ChatRequest) -> Result<ChatTurn> {
        self.limit.record_request();

        let body = self.build_body(request, false)?;
        debug!(
            provider = self.config.name,
            model = self.config.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "sending chat completion request"
        );

        let response = self.request_builder(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<WireErrorBody>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(LlmError::from_status(status, message));
        }

        let wire: WireResponse = serde_json::from_str(&text)?;
        turn_from_wire(wire)
    }

    async fn create_stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        use reqwest_eventsource::{Error as SseError, Event, EventSource};

        self.limit.record_request();

        let body = self.build_body(request, true)?;
        debug!(
            provider = self.config.name,
            model = self.config.model,
            "starting chat completion stream"
        );

        let event_source = EventSource::new(self.request_builder(&body)).map_err(|e| {
            LlmError::ApiError(format!("failed to open event stream: {}", e))
        })?;

        let buffer: VecDeque<Result<StreamChunk>> = VecDeque::new();
        let stream = stream::unfold((event_source, buffer), |(mut es, mut buffer)| async move {
            loop {
                if let Some(chunk) = buffer.pop_front() {
                    return Some((chunk, (es, buffer)));
                }

                match es.next().await {
                    Some(Ok(Event::Open)) => continue,
                    Some(Ok(Event::Message(msg))) => {
                        if msg.data == "[DONE]" {
                            es.close();
                            return None;
                        }
                        match serde_json::from_str::<WireChunk>(&msg.data) {
                            Ok(wire) => buffer.extend(chunks_from_wire(wire)),
                            Err(e) => {
                                warn!("failed to parse stream chunk: {} | data: {}", e, msg.data);
                                es.close();
                                return Some((
                                    Err(LlmError::ApiError(format!(
                                        "failed to parse stream chunk: {}",
                                        e
                                    ))),
                                    (es, buffer),
                                ));
                            }
                        }
                    }
                    Some(Err(SseError::StreamEnded)) | None => return None,
                    Some(Err(e)) => {
                        es.close();
                        return Some((
                            Err(LlmError::NetworkError(format!("stream error: {}", e))),
                            (es, buffer),
                        ));
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}
