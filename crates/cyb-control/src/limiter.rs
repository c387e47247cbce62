//! Priority-weighted token buckets.
//!
//! One bucket per `scope:key` pair, created on first use from the scope's
//! configuration. Refill interpolates elapsed time on every access, capped
//! at capacity; a failed consume never mutates the balance. Per-key state
//! sits behind its own mutex, so concurrent consumers of one key observe a
//! total order and distinct keys never interact.

use dashmap::DashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

use cyb_core::Priority;

/// Capacity and refill rate for a bucket scope.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    /// Maximum (and initial) token balance.
    pub capacity: u32,
    /// Tokens replenished per second.
    pub refill_rate: f64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            refill_rate: 1.0,
        }
    }
}

/// Outcome of a consume attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitDecision {
    /// Tokens were consumed.
    Allowed {
        /// Balance left after consumption.
        remaining: f64,
    },
    /// The balance could not cover the cost; state unchanged.
    Limited {
        /// Time until the balance covers the cost at the refill rate.
        retry_after: Duration,
    },
}

impl RateLimitDecision {
    /// Whether the request may proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// The retry hint when limited.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Allowed { .. } => None,
            Self::Limited { retry_after } => Some(*retry_after),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(config: TokenBucketConfig) -> Self {
        Self {
            tokens: f64::from(config.capacity),
            last_refill: Instant::now(),
        }
    }

    #[allow(clippy::arithmetic_side_effects)]
    fn refill(&mut self, config: TokenBucketConfig) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_rate).min(f64::from(config.capacity));
        self.last_refill = now;
    }
}

/// Per-key token buckets with scope-level configuration.
#[derive(Debug)]
pub struct RateLimiter {
    default_config: TokenBucketConfig,
    scope_configs: DashMap<String, TokenBucketConfig>,
    buckets: DashMap<String, Mutex<Bucket>>,
}

impl RateLimiter {
    /// Create a limiter whose unconfigured scopes use `default_config`.
    #[must_use]
    pub fn new(default_config: TokenBucketConfig) -> Self {
        Self {
            default_config,
            scope_configs: DashMap::new(),
            buckets: DashMap::new(),
        }
    }

    /// Configure a scope (e.g. `api_gateway`, `s4_llm`). Existing buckets in
    /// the scope keep their balance but adopt the new capacity on refill.
    pub fn set_scope_config(&self, scope: impl Into<String>, config: TokenBucketConfig) {
        self.scope_configs.insert(scope.into(), config);
    }

    /// Consume priority-weighted tokens for `key` within `scope`.
    pub fn consume(&self, scope: &str, key: &str, priority: Priority) -> RateLimitDecision {
        self.consume_cost(scope, key, f64::from(priority.token_cost()))
    }

    /// Consume an explicit token cost.
    #[allow(clippy::arithmetic_side_effects)]
    pub fn consume_cost(&self, scope: &str, key: &str, cost: f64) -> RateLimitDecision {
        let config = self.config_for(scope);
        let entry = self.entry(scope, key, config);
        let mut bucket = lock(&entry);
        bucket.refill(config);

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            trace!(scope, key, cost, remaining = bucket.tokens, "tokens consumed");
            RateLimitDecision::Allowed {
                remaining: bucket.tokens,
            }
        } else {
            let deficit = cost - bucket.tokens;
            let retry_after = if config.refill_rate > 0.0 {
                Duration::from_secs_f64(deficit / config.refill_rate)
            } else {
                Duration::MAX
            };
            trace!(scope, key, cost, remaining = bucket.tokens, "rate limited");
            RateLimitDecision::Limited { retry_after }
        }
    }

    /// Remaining balance without consuming (refill still applies).
    pub fn check(&self, scope: &str, key: &str) -> f64 {
        let config = self.config_for(scope);
        let entry = self.entry(scope, key, config);
        let mut bucket = lock(&entry);
        bucket.refill(config);
        bucket.tokens
    }

    /// Restore a bucket to full capacity.
    pub fn reset(&self, scope: &str, key: &str) {
        let config = self.config_for(scope);
        if let Some(entry) = self.buckets.get(&bucket_key(scope, key)) {
            let mut bucket = lock(&entry);
            *bucket = Bucket::new(config);
        }
    }

    /// Best-effort refund after a cancelled request, capped at capacity.
    #[allow(clippy::arithmetic_side_effects)]
    pub fn refund(&self, scope: &str, key: &str, cost: f64) {
        let config = self.config_for(scope);
        if let Some(entry) = self.buckets.get(&bucket_key(scope, key)) {
            let mut bucket = lock(&entry);
            bucket.tokens = (bucket.tokens + cost).min(f64::from(config.capacity));
        }
    }

    fn config_for(&self, scope: &str) -> TokenBucketConfig {
        self.scope_configs
            .get(scope)
            .map_or(self.default_config, |c| *c)
    }

    fn entry<'a>(
        &'a self,
        scope: &str,
        key: &str,
        config: TokenBucketConfig,
    ) -> dashmap::mapref::one::Ref<'a, String, Mutex<Bucket>> {
        let full_key = bucket_key(scope, key);
        if let Some(entry) = self.buckets.get(&full_key) {
            return entry;
        }
        self.buckets
            .entry(full_key)
            .or_insert_with(|| Mutex::new(Bucket::new(config)))
            .downgrade()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(TokenBucketConfig::default())
    }
}

fn bucket_key(scope: &str, key: &str) -> String {
    format!("{scope}:{key}")
}

fn lock(entry: &Mutex<Bucket>) -> std::sync::MutexGuard<'_, Bucket> {
    entry.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
