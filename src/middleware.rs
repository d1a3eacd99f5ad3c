//! Two-phase query hooks and the composable hook chain.
//!
//! A [`QueryHook`] sees every call twice: `before_call` receives the
//! partitioned prompt/api arguments and returns one merged argument set for
//! the wrapped layer, and `after_call` observes the completed result. A
//! [`HookedBackend`] binds one hook around any inner [`Queryable`] (a
//! concrete backend, a pool, or another hooked layer), so N stacked layers
//! run N before/after phases around exactly one underlying call.
//!
//! For the incremental-chunk operation the caller still receives chunks as
//! they arrive; `after_call` fires once with the fully joined text after the
//! stream drains, never per chunk.
//!
//! # Example
//! ```ignore
//! use llmux::middleware::{HookedBackend, LoggingHook};
//!
//! let layered = HookedBackend::new(backend, Arc::new(LoggingHook::new()))
//!     .layer(Arc::new(metrics.clone()));
//! let text = layered.query_text(args).await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use tracing::{debug, info, trace};

use crate::args::{merge_args, ArgMap, QueryArgs};
use crate::error::Result;
use crate::traits::{Queryable, TextStream};

// ============================================================================
// Hook Protocol
// ============================================================================

/// The completed result of a call, as seen by `after_call`.
///
/// Text, block, and stream operations complete to text (streams to their
/// joined chunks); structured-object operations complete to JSON.
#[derive(Debug, Clone, Copy)]
pub enum QueryOutcome<'a> {
    /// Full response text.
    Text(&'a str),
    /// Parsed structured response.
    Object(&'a JsonValue),
}

/// Two-phase hook around a query: rewrite arguments before, observe after.
#[async_trait]
pub trait QueryHook: Send + Sync {
    /// Called with the partitioned arguments before the inner call. Must
    /// return the merged argument set to pass down. The default merges the
    /// union with api arguments applied after prompt arguments.
    async fn before_call(&self, prompt_args: ArgMap, api_args: ArgMap) -> Result<QueryArgs> {
        merge_args(prompt_args, api_args)
    }

    /// Called once with the completed result. Declining to act is the normal
    /// case; an error here propagates to the caller unmodified.
    async fn after_call(&self, outcome: QueryOutcome<'_>) -> Result<()> {
        let _ = outcome;
        Ok(())
    }
}

/// Hook that merges unchanged and observes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityHook;

impl QueryHook for IdentityHook {}

// ============================================================================
// Hook Chain
// ============================================================================

/// One hook layered over an inner queryable surface.
pub struct HookedBackend {
    inner: Arc<dyn Queryable>,
    hook: Arc<dyn QueryHook>,
}

impl HookedBackend {
    /// Wrap `inner` with `hook`.
    pub fn new(inner: Arc<dyn Queryable>, hook: Arc<dyn QueryHook>) -> Self {
        Self { inner, hook }
    }

    /// Stack another hook outside this one.
    pub fn layer(self, hook: Arc<dyn QueryHook>) -> Self {
        Self::new(Arc::new(self), hook)
    }

    async fn prepare(&self, args: QueryArgs) -> Result<QueryArgs> {
        let (prompt_args, api_args) = args.partition();
        self.hook.before_call(prompt_args, api_args).await
    }
}

#[async_trait]
impl Queryable for HookedBackend {
    async fn query_text(&self, args: QueryArgs) -> Result<String> {
        let merged = self.prepare(args).await?;
        let result = self.inner.query_text(merged).await?;
        self.hook.after_call(QueryOutcome::Text(&result)).await?;
        Ok(result)
    }

    async fn query_object(&self, schema: &JsonValue, args: QueryArgs) -> Result<JsonValue> {
        let merged = self.prepare(args).await?;
        let result = self.inner.query_object(schema, merged).await?;
        self.hook.after_call(QueryOutcome::Object(&result)).await?;
        Ok(result)
    }

    async fn query_block(&self, kind: &str, args: QueryArgs) -> Result<String> {
        let merged = self.prepare(args).await?;
        let result = self.inner.query_block(kind, merged).await?;
        self.hook.after_call(QueryOutcome::Text(&result)).await?;
        Ok(result)
    }

    async fn query_stream(&self, args: QueryArgs) -> Result<TextStream> {
        let merged = self.prepare(args).await?;
        let mut inner_stream = self.inner.query_stream(merged).await?;
        let hook = self.hook.clone();

        let stream = async_stream::try_stream! {
            let mut parts: Vec<String> = Vec::new();
            while let Some(chunk) = inner_stream.next().await {
                let chunk = chunk?;
                parts.push(chunk.clone());
                yield chunk;
            }
            hook.after_call(QueryOutcome::Text(&parts.concat())).await?;
        };
        Ok(Box::pin(stream))
    }
}

// ============================================================================
// Built-in Hooks
// ============================================================================

/// Log level for [`LoggingHook`].
#[derive(Debug, Clone, Copy, Default)]
pub enum LogLevel {
    /// Request/response summary.
    #[default]
    Info,
    /// Summary plus argument keys.
    Debug,
    /// Full arguments and response text.
    Trace,
}

/// Hook that logs each call through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingHook {
    level: LogLevel,
}

impl LoggingHook {
    /// Logging hook at the default info level.
    pub fn new() -> Self {
        Self::default()
    }

    /// Logging hook at a specific level.
    pub fn with_level(level: LogLevel) -> Self {
        Self { level }
    }
}

#[async_trait]
impl QueryHook for LoggingHook {
    async fn before_call(&self, prompt_args: ArgMap, api_args: ArgMap) -> Result<QueryArgs> {
        match self.level {
            LogLevel::Info => {
                info!(
                    prompt_args = prompt_args.len(),
                    api_args = api_args.len(),
                    "[llm] request"
                );
            }
            LogLevel::Debug => {
                let keys: Vec<&String> = prompt_args.keys().chain(api_args.keys()).collect();
                debug!(?keys, "[llm] request");
            }
            LogLevel::Trace => {
                trace!(?prompt_args, ?api_args, "[llm] full request");
            }
        }
        merge_args(prompt_args, api_args)
    }

    async fn after_call(&self, outcome: QueryOutcome<'_>) -> Result<()> {
        match (self.level, outcome) {
            (LogLevel::Trace, QueryOutcome::Text(text)) => {
                trace!(response = text, "[llm] full response");
            }
            (LogLevel::Trace, QueryOutcome::Object(value)) => {
                trace!(response = %value, "[llm] full response");
            }
            (_, QueryOutcome::Text(text)) => {
                info!(chars = text.len(), "[llm] response");
            }
            (_, QueryOutcome::Object(_)) => {
                info!("[llm] structured response");
            }
        }
        Ok(())
    }
}

/// Hook that counts calls and response sizes.
#[derive(Debug, Default)]
pub struct MetricsHook {
    calls: AtomicU64,
    response_chars: AtomicU64,
}

impl MetricsHook {
    /// New metrics hook with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls that reached the after phase.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Total characters observed across text responses.
    pub fn response_chars(&self) -> u64 {
        self.response_chars.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl QueryHook for MetricsHook {
    async fn after_call(&self, outcome: QueryOutcome<'_>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let QueryOutcome::Text(text) = outcome {
            self.response_chars
                .fetch_add(text.chars().count() as u64, Ordering::Relaxed);
        }
        Ok(())
    }
}
