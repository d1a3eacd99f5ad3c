//! Backend pool with rate-limit-ordered selection, retry, and eviction.
//!
//! The pool fronts a set of interchangeable backends behind the same four
//! operations the backends themselves expose. Each external call runs a
//! bounded retry loop:
//!
//! 1. Select the backend whose rate limit allows a request soonest (ties go
//!    to pool order).
//! 2. If that backend has pending failures, sleep a jittered exponential
//!    backoff first, randomized so concurrent callers hitting the same
//!    degraded backend do not retry in lockstep.
//! 3. On success, reset the backend's failure count and return immediately.
//! 4. On failure, record it; a backend whose consecutive failures reach
//!    `max_retries` is evicted for the life of the pool.
//!
//! At most `max_retries + 1` attempts are made per external call. If none
//! succeed, the last underlying error is returned unchanged.
//!
//! All suspension points are cooperative: dropping the returned future aborts
//! whatever backoff sleep or backend call is in flight and makes no further
//! attempts.
//!
//! # Example
//! ```ignore
//! use llmux::{BackendPool, QueryArgs};
//!
//! let pool = BackendPool::new(vec![primary, fallback]).with_max_retries(3);
//! let text = pool.query_text(QueryArgs::new().with("QUERY", "hello")).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::args::QueryArgs;
use crate::error::{LlmError, Result};
use crate::traits::{Backend, Capability, Queryable, TextStream};

/// One pooled backend and its consecutive-failure count.
///
/// A count of `-1` means healthy (no pending backoff). Keeping the count
/// inline with the backend lets eviction drop both in a single mutation.
struct PoolEntry {
    backend: Arc<dyn Backend>,
    failures: i32,
}

/// A pool of redundant backends exposing the uniform calling convention.
pub struct BackendPool {
    state: Mutex<Vec<PoolEntry>>,
    max_retries: u32,
    backoff_exp: f64,
    backoff_multiplier: f64,
    name: String,
}

impl BackendPool {
    /// Create a pool over the given backends with default retry settings
    /// (three retries, exponent 2, multiplier 1).
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Self {
        let entries = backends
            .into_iter()
            .map(|backend| PoolEntry {
                backend,
                failures: -1,
            })
            .collect();
        Self {
            state: Mutex::new(entries),
            max_retries: 3,
            backoff_exp: 2.0,
            backoff_multiplier: 1.0,
            name: "pool".to_string(),
        }
    }

    /// Set the retry budget: total attempts per call are `max_retries + 1`.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff exponent.
    pub fn with_backoff_exp(mut self, exp: f64) -> Self {
        self.backoff_exp = exp;
        self
    }

    /// Set the backoff multiplier. Zero disables backoff sleeps.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Name the pool for logging.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of backends currently pooled (evicted backends excluded).
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    /// Whether every backend has been evicted (or none were supplied).
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.is_empty()
    }

    /// The most specific capability shared by all currently pooled backends.
    ///
    /// Intersects the declared capability chains and returns the first entry
    /// of the first backend's chain present in every other chain. An empty
    /// intersection yields [`Capability::Any`].
    pub async fn common_capability(&self) -> Result<Capability> {
        let state = self.state.lock().await;
        let mut entries = state.iter();
        let first = entries.next().ok_or(LlmError::NoBackendsAvailable)?;

        let mut common: Vec<Capability> = first.backend.capabilities().to_vec();
        for entry in entries {
            let chain = entry.backend.capabilities();
            common.retain(|cap| chain.contains(cap));
        }

        Ok(first
            .backend
            .capabilities()
            .iter()
            .find(|cap| common.contains(cap))
            .copied()
            .unwrap_or(Capability::Any))
    }

    /// Select the backend with the smallest next-allowed delay, ties broken
    /// by pool order. Returns the backend and its current failure count.
    async fn select(&self) -> Result<(Arc<dyn Backend>, i32)> {
        let state = self.state.lock().await;
        let mut best: Option<(usize, Duration)> = None;
        for (index, entry) in state.iter().enumerate() {
            let wait = entry.backend.rate_limit().next_allowed();
            let better = match best {
                Some((_, best_wait)) => wait < best_wait,
                None => true,
            };
            if better {
                best = Some((index, wait));
            }
        }
        let (index, _) = best.ok_or(LlmError::NoBackendsAvailable)?;
        let entry = &state[index];
        Ok((entry.backend.clone(), entry.failures))
    }

    /// Reset a backend's failure count after a successful call.
    async fn mark_success(&self, backend: &Arc<dyn Backend>) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state
            .iter_mut()
            .find(|e| Arc::ptr_eq(&e.backend, backend))
        {
            entry.failures = -1;
        }
    }

    /// Record a failure; evict the backend once its streak reaches the
    /// retry budget. Eviction is permanent for the pool's lifetime.
    async fn mark_failure(&self, backend: &Arc<dyn Backend>) {
        let mut state = self.state.lock().await;
        if let Some(index) = state.iter().position(|e| Arc::ptr_eq(&e.backend, backend)) {
            state[index].failures += 1;
            if state[index].failures == self.max_retries as i32 {
                warn!(
                    pool = %self.name,
                    backend = state[index].backend.name(),
                    "backend failed too many times, evicting"
                );
                state.remove(index);
            }
        }
    }

    /// Run one operation through the retry loop.
    async fn run_with_retry<T, F>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn Backend>) -> BoxFuture<'static, Result<T>>,
    {
        let mut last_error: Option<LlmError> = None;

        for attempt in 0..=self.max_retries {
            let (backend, failures) = self.select().await?;

            if failures >= 0 {
                let delay = fastrand::f64()
                    * self.backoff_multiplier
                    * self.backoff_exp.powi(failures);
                if delay > 0.0 {
                    debug!(
                        pool = %self.name,
                        backend = backend.name(),
                        delay_s = delay,
                        "backing off before retry"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
            }

            match op(backend.clone()).await {
                Ok(value) => {
                    self.mark_success(&backend).await;
                    return Ok(value);
                }
                Err(error) => {
                    debug!(
                        pool = %self.name,
                        backend = backend.name(),
                        attempt = attempt + 1,
                        error = %error,
                        "backend call failed"
                    );
                    self.mark_failure(&backend).await;
                    last_error = Some(error);
                }
            }
        }

        warn!(pool = %self.name, "retry budget exhausted, surfacing last error");
        Err(last_error.unwrap_or(LlmError::NoBackendsAvailable))
    }
}

#[async_trait]
impl Queryable for BackendPool {
    async fn query_text(&self, args: QueryArgs) -> Result<String> {
        self.run_with_retry(move |backend| {
            let args = args.clone();
            async move { backend.query_text(args).await }.boxed()
        })
        .await
    }

    async fn query_object(&self, schema: &JsonValue, args: QueryArgs) -> Result<JsonValue> {
        let schema = schema.clone();
        self.run_with_retry(move |backend| {
            let schema = schema.clone();
            let args = args.clone();
            async move { backend.query_object(&schema, args).await }.boxed()
        })
        .await
    }

    async fn query_block(&self, kind: &str, args: QueryArgs) -> Result<String> {
        let kind = kind.to_string();
        self.run_with_retry(move |backend| {
            let kind = kind.clone();
            let args = args.clone();
            async move { backend.query_block(&kind, args).await }.boxed()
        })
        .await
    }

    /// Retries cover acquiring the stream; once the first chunk has been
    /// handed to the caller, mid-stream errors are theirs to observe.
    async fn query_stream(&self, args: QueryArgs) -> Result<TextStream> {
        self.run_with_retry(move |backend| {
            let args = args.clone();
            async move { backend.query_stream(args).await }.boxed()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimit;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Backend that replays a scripted sequence of text results.
    struct ScriptedBackend {
        name: String,
        caps: Vec<Capability>,
        limit: RateLimit,
        script: StdMutex<VecDeque<Result<String>>>,
        calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn new(name: &str, script: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                caps: vec![Capability::Chat, Capability::Any],
                limit: RateLimit::unlimited(),
                script: StdMutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn with_caps(name: &str, caps: Vec<Capability>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                caps,
                limit: RateLimit::unlimited(),
                script: StdMutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
            })
        }

        fn with_limit(name: &str, limit: RateLimit, script: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                caps: vec![Capability::Chat, Capability::Any],
                limit,
                script: StdMutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn next(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("default".to_string()))
        }
    }

    #[async_trait]
    impl Queryable for ScriptedBackend {
        async fn query_text(&self, _args: QueryArgs) -> Result<String> {
            self.next()
        }

        async fn query_object(&self, _schema: &JsonValue, _args: QueryArgs) -> Result<JsonValue> {
            self.next().map(JsonValue::String)
        }

        async fn query_block(&self, _kind: &str, _args: QueryArgs) -> Result<String> {
            self.next()
        }

        async fn query_stream(&self, _args: QueryArgs) -> Result<TextStream> {
            use futures::StreamExt;
            let text = self.next()?;
            Ok(futures::stream::iter(vec![Ok(text)]).boxed())
        }
    }

    impl Backend for ScriptedBackend {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> &[Capability] {
            &self.caps
        }

        fn rate_limit(&self) -> &RateLimit {
            &self.limit
        }
    }

    fn pool_of(backends: Vec<Arc<ScriptedBackend>>) -> BackendPool {
        BackendPool::new(
            backends
                .into_iter()
                .map(|b| b as Arc<dyn Backend>)
                .collect(),
        )
        .with_backoff_multiplier(0.0)
    }

    #[tokio::test]
    async fn test_selects_soonest_allowed_backend() {
        let busy = RateLimit::per_minute(1);
        busy.record_request();

        let a = ScriptedBackend::with_limit("a", busy, vec![Ok("from a".into())]);
        let b = ScriptedBackend::with_limit("b", RateLimit::unlimited(), vec![Ok("from b".into())]);
        let pool = pool_of(vec![a.clone(), b.clone()]);

        let result = pool.query_text(QueryArgs::new()).await.unwrap();
        assert_eq!(result, "from b");
        assert_eq!(a.calls(), 0);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn test_tie_breaks_by_pool_order() {
        let a = ScriptedBackend::new("a", vec![Ok("from a".into())]);
        let b = ScriptedBackend::new("b", vec![Ok("from b".into())]);
        let pool = pool_of(vec![a.clone(), b.clone()]);

        let result = pool.query_text(QueryArgs::new()).await.unwrap();
        assert_eq!(result, "from a");
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        // One failure, recovery, another failure, recovery. With a budget of
        // one retry, the second failure would evict if the reset never
        // happened (the streak would reach the maximum).
        let a = ScriptedBackend::new(
            "a",
            vec![
                Err(LlmError::Timeout),
                Ok("first".into()),
                Err(LlmError::Timeout),
                Ok("second".into()),
            ],
        );
        let pool = pool_of(vec![a.clone()]).with_max_retries(1);

        assert_eq!(pool.query_text(QueryArgs::new()).await.unwrap(), "first");
        assert_eq!(pool.query_text(QueryArgs::new()).await.unwrap(), "second");
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_eviction_is_permanent() {
        let a = ScriptedBackend::new(
            "a",
            vec![
                Err(LlmError::ApiError("boom 1".into())),
                Err(LlmError::ApiError("boom 2".into())),
            ],
        );
        let pool = pool_of(vec![a.clone()]).with_max_retries(1);

        let err = pool.query_text(QueryArgs::new()).await.unwrap_err();
        assert!(matches!(err, LlmError::ApiError(msg) if msg == "boom 2"));
        assert_eq!(a.calls(), 2);
        assert!(pool.is_empty().await);

        // The evicted backend is never selected again.
        let err = pool.query_text(QueryArgs::new()).await.unwrap_err();
        assert!(matches!(err, LlmError::NoBackendsAvailable));
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test]
    async fn test_attempt_budget_caps_total_calls() {
        let a = ScriptedBackend::new(
            "a",
            vec![
                Err(LlmError::Timeout),
                Err(LlmError::Timeout),
                Err(LlmError::Timeout),
                Err(LlmError::Timeout),
            ],
        );
        let pool = pool_of(vec![a.clone()]).with_max_retries(2);

        let result = pool.query_text(QueryArgs::new()).await;
        assert!(result.is_err());
        assert_eq!(a.calls(), 3); // max_retries + 1
    }

    #[tokio::test]
    async fn test_last_error_surfaces_verbatim() {
        let a = ScriptedBackend::new(
            "a",
            vec![
                Err(LlmError::NetworkError("e1".into())),
                Err(LlmError::NetworkError("e2".into())),
                Err(LlmError::RateLimited("e3".into())),
            ],
        );
        let pool = pool_of(vec![a.clone()]).with_max_retries(2);

        let err = pool.query_text(QueryArgs::new()).await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimited(msg) if msg == "e3"));
    }

    #[tokio::test]
    async fn test_failover_to_second_backend() {
        // A zero-retry budget evicts the first backend on its first failure;
        // the follow-up call lands on the survivor.
        let a = ScriptedBackend::new("a", vec![Err(LlmError::Timeout)]);
        let b = ScriptedBackend::new("b", vec![Ok("rescued".into())]);
        let pool = pool_of(vec![a.clone(), b.clone()]).with_max_retries(0);

        let err = pool.query_text(QueryArgs::new()).await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout));
        assert_eq!(pool.len().await, 1);

        let result = pool.query_text(QueryArgs::new()).await.unwrap();
        assert_eq!(result, "rescued");
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_pool_is_distinct_error() {
        let pool = BackendPool::new(vec![]);
        let err = pool.query_text(QueryArgs::new()).await.unwrap_err();
        assert!(matches!(err, LlmError::NoBackendsAvailable));
    }

    #[tokio::test]
    async fn test_common_capability_shared_prefix() {
        let openai = ScriptedBackend::with_caps(
            "openai",
            vec![
                Capability::OpenAiChat,
                Capability::ToolUse,
                Capability::Chat,
                Capability::Any,
            ],
        );
        let plain = ScriptedBackend::with_caps("plain", vec![Capability::Chat, Capability::Any]);
        let pool = pool_of(vec![openai, plain]);

        assert_eq!(pool.common_capability().await.unwrap(), Capability::Chat);
    }

    #[tokio::test]
    async fn test_common_capability_homogeneous() {
        let caps = vec![
            Capability::OpenAiChat,
            Capability::ToolUse,
            Capability::Chat,
            Capability::Any,
        ];
        let a = ScriptedBackend::with_caps("a", caps.clone());
        let b = ScriptedBackend::with_caps("b", caps);
        let pool = pool_of(vec![a, b]);

        assert_eq!(
            pool.common_capability().await.unwrap(),
            Capability::OpenAiChat
        );
    }

    #[tokio::test]
    async fn test_common_capability_disjoint_falls_back_to_any() {
        let a = ScriptedBackend::with_caps("a", vec![Capability::OpenAiChat]);
        let b = ScriptedBackend::with_caps("b", vec![Capability::Chat]);
        let pool = pool_of(vec![a, b]);

        assert_eq!(pool.common_capability().await.unwrap(), Capability::Any);
    }

    #[tokio::test]
    async fn test_common_capability_empty_pool() {
        let pool = BackendPool::new(vec![]);
        assert!(matches!(
            pool.common_capability().await,
            Err(LlmError::NoBackendsAvailable)
        ));
    }

    #[tokio::test]
    async fn test_stream_acquisition_retries() {
        let a = ScriptedBackend::new(
            "a",
            vec![Err(LlmError::Timeout), Ok("streamed".into())],
        );
        let pool = pool_of(vec![a.clone()]).with_max_retries(1);

        use futures::StreamExt;
        let mut stream = pool.query_stream(QueryArgs::new()).await.unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk, "streamed");
        assert_eq!(a.calls(), 2);
    }
}
