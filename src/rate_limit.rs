//! Per-backend rate-limit hints.
//!
//! Each backend owns a [`RateLimit`] and records its own requests against it.
//! The pool never computes limits; it only reads [`RateLimit::next_allowed`]
//! to order selection: the backend that may fire soonest wins.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token bucket tracking request budget over time.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn consume(&mut self, tokens: f64) {
        self.refill();
        self.tokens = (self.tokens - tokens).max(0.0);
    }

    fn time_to_acquire(&mut self, tokens: f64) -> Duration {
        self.refill();
        if self.tokens >= tokens {
            Duration::ZERO
        } else {
            let needed = tokens - self.tokens;
            Duration::from_secs_f64(needed / self.refill_rate)
        }
    }
}

/// Request-rate hint for one backend.
///
/// `None` bucket means unlimited: the backend is always immediately allowed.
#[derive(Debug)]
pub struct RateLimit {
    bucket: Option<Mutex<TokenBucket>>,
}

impl RateLimit {
    /// A limit of `requests_per_minute` requests, refilled continuously.
    pub fn per_minute(requests_per_minute: usize) -> Self {
        let rpm = requests_per_minute.max(1) as f64;
        Self {
            bucket: Some(Mutex::new(TokenBucket::new(rpm, rpm / 60.0))),
        }
    }

    /// No limit; `next_allowed` is always zero.
    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    /// Time from now until the next request is allowed. Zero when a request
    /// slot is currently available. This is the pool's selection key.
    pub fn next_allowed(&self) -> Duration {
        match &self.bucket {
            Some(bucket) => bucket.lock().expect("rate limit lock").time_to_acquire(1.0),
            None => Duration::ZERO,
        }
    }

    /// Record one request against the budget.
    pub fn record_request(&self) {
        if let Some(bucket) = &self.bucket {
            bucket.lock().expect("rate limit lock").consume(1.0);
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::unlimited()
    }
}
