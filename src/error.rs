//! Error types for backend calls, pooling, and the tool loop.
//!
//! # Error Handling Philosophy
//!
//! Errors should be:
//! 1. **Actionable**: Tell the caller what happened, not just that it failed
//! 2. **Specific**: Carry the finish reason, block kind, or provider message
//! 3. **Identity-preserving**: A pool that exhausts its retry budget surfaces
//!    the last underlying error unchanged, never re-wrapped, so the original
//!    failure stays diagnosable
//!
//! # Fatal vs. absorbed
//!
//! | Condition | Surface |
//! |-----------|---------|
//! | Empty pool at selection | `NoBackendsAvailable`, zero attempts |
//! | Retry budget spent | last underlying error, verbatim |
//! | Turn finished with `length` | `ContextWindowExceeded` |
//! | Turn finished with `content_filter` | `PolicyViolation` |
//! | Turn finished with anything unknown | `UnexpectedFinishReason` |
//! | Tool round-trip budget spent | `ToolCallLimitExceeded` |
//! | Tool handler failed | never an error; serialized into the conversation |

use thiserror::Error;

/// Result type for all backend operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Errors that can occur across the backend pool, hooks, and orchestrator.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The pool had no backends left at selection time.
    #[error("no backends available")]
    NoBackendsAvailable,

    /// The conversation no longer fits the model's context window.
    #[error("the conversation was too long for the context window")]
    ContextWindowExceeded,

    /// The model's output was filtered for policy reasons.
    #[error("content was filtered due to policy violations")]
    PolicyViolation,

    /// The backend reported a finish reason outside the known vocabulary.
    #[error("unexpected finish reason: {0}")]
    UnexpectedFinishReason(String),

    /// The tool round-trip budget was spent before the model stopped.
    #[error("tool call limit exceeded")]
    ToolCallLimitExceeded,

    /// The response did not contain the requested fenced block.
    #[error("no '{0}' block found in response")]
    MissingBlock(String),

    /// API error from the provider.
    #[error("API error: {0}")]
    ApiError(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    /// Invalid request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication error.
    #[error("authentication error: {0}")]
    AuthError(String),

    /// Network error.
    #[error("network error: {0}")]
    NetworkError(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Request timed out.
    #[error("request timed out")]
    Timeout,

    /// Feature not supported by this backend.
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else if err.is_connect() {
            LlmError::NetworkError(format!("connection failed: {}", err))
        } else {
            LlmError::NetworkError(err.to_string())
        }
    }
}

impl LlmError {
    /// Map an HTTP status and provider message to the right variant.
    pub fn from_status(status: reqwest::StatusCode, message: String) -> Self {
        match status.as_u16() {
            401 | 403 => LlmError::AuthError(message),
            429 => LlmError::RateLimited(message),
            400 | 404 | 422 => LlmError::InvalidRequest(message),
            _ => LlmError::ApiError(message),
        }
    }
}
