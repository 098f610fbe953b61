//! Rate limiter: token-bucket per key with a sliding-window
//! variant, failing open on store errors.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kv::KvStore;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RateLimitDecision {
    Allowed { remaining: u64, reset_ms: u64 },
    Denied { retry_after_ms: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Per-tier token-bucket configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierConfig {
    pub window_ms: u64,
    pub max_tokens: f64,
    pub refill_rate_per_sec: f64,
}

impl TierConfig {
    /// Hardwired lower limit for unauthenticated callers.
    pub fn anonymous() -> Self {
        Self {
            window_ms: 60_000,
            max_tokens: 10.0,
            refill_rate_per_sec: 10.0 / 60.0,
        }
    }

    pub fn standard() -> Self {
        Self {
            window_ms: 60_000,
            max_tokens: 60.0,
            refill_rate_per_sec: 1.0,
        }
    }

    pub fn premium() -> Self {
        Self {
            window_ms: 60_000,
            max_tokens: 300.0,
            refill_rate_per_sec: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    last_refill_epoch_ms: i64,
}

/// Token-bucket rate limiter backed by a [`KvStore`].
///
/// On store error the limiter fails **open** (allows the request) and the
/// caller is expected to emit an audit event — availability-critical
/// components fail open, safety-critical ones fail closed.
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(scope: &str, key: &str) -> String {
        format!("ratelimit:bucket:{scope}:{key}")
    }

    /// Check and consume one token for `(scope, key)` under `tier`.
    pub async fn check(&self, scope: &str, key: &str, tier: &TierConfig) -> RateLimitDecision {
        match self.check_inner(scope, key, tier).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(error = %err, scope, key, "rate limiter store error, failing open");
                RateLimitDecision::Allowed {
                    remaining: tier.max_tokens as u64,
                    reset_ms: 0,
                }
            }
        }
    }

    async fn check_inner(
        &self,
        scope: &str,
        key: &str,
        tier: &TierConfig,
    ) -> Result<RateLimitDecision> {
        let storage_key = Self::key(scope, key);
        let now_ms = chrono::Utc::now().timestamp_millis();

        let mut state = match self.kv.get(&storage_key).await? {
            Some(raw) => serde_json::from_str::<BucketState>(&raw).unwrap_or(BucketState {
                tokens: tier.max_tokens,
                last_refill_epoch_ms: now_ms,
            }),
            None => BucketState {
                tokens: tier.max_tokens,
                last_refill_epoch_ms: now_ms,
            },
        };

        let elapsed_secs = ((now_ms - state.last_refill_epoch_ms).max(0) as f64) / 1000.0;
        state.tokens = (state.tokens + elapsed_secs * tier.refill_rate_per_sec).min(tier.max_tokens);
        state.last_refill_epoch_ms = now_ms;

        let decision = if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            let reset_ms = ((tier.max_tokens - state.tokens) / tier.refill_rate_per_sec * 1000.0)
                .max(0.0) as u64;
            RateLimitDecision::Allowed {
                remaining: state.tokens.floor() as u64,
                reset_ms,
            }
        } else {
            let retry_after_ms =
                ((1.0 - state.tokens) / tier.refill_rate_per_sec * 1000.0).max(0.0) as u64;
            RateLimitDecision::Denied { retry_after_ms }
        };

        let ttl = (tier.window_ms / 1000).max(1);
        self.kv
            .set(&storage_key, &serde_json::to_string(&state)?, Some(ttl))
            .await?;

        Ok(decision)
    }

    /// Sliding-window counter variant: deny once the count within the
    /// current window exceeds `max_count`.
    pub async fn check_sliding_window(
        &self,
        scope: &str,
        key: &str,
        window_seconds: u64,
        max_count: i64,
    ) -> RateLimitDecision {
        match self
            .check_sliding_window_inner(scope, key, window_seconds, max_count)
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(error = %err, scope, key, "sliding window store error, failing open");
                RateLimitDecision::Allowed {
                    remaining: max_count as u64,
                    reset_ms: 0,
                }
            }
        }
    }

    async fn check_sliding_window_inner(
        &self,
        scope: &str,
        key: &str,
        window_seconds: u64,
        max_count: i64,
    ) -> Result<RateLimitDecision> {
        let window_idx = chrono::Utc::now().timestamp() as u64 / window_seconds.max(1);
        let storage_key = format!("ratelimit:window:{scope}:{key}:{window_idx}");

        let count = self.kv.incr(&storage_key).await?;
        if count == 1 {
            self.kv.expire(&storage_key, window_seconds).await?;
        }

        if count > max_count {
            let retry_after_ms = window_seconds * 1000;
            Ok(RateLimitDecision::Denied { retry_after_ms })
        } else {
            Ok(RateLimitDecision::Allowed {
                remaining: (max_count - count).max(0) as u64,
                reset_ms: window_seconds * 1000,
            })
        }
    }
}
