//! Token-bucket rate limiter shared by all processors.
//!
//! Buckets are keyed by a logical resource name (usually the completion
//! provider). Each key holds `capacity` tokens at most and refills at
//! `fill_rate` tokens per second. Refill and take happen under the DashMap
//! shard lock for the key, so concurrent callers never double-spend a token.

use std::time::Instant;

use dashmap::DashMap;

/// Bucket parameters for one resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimits {
    /// Maximum burst size.
    pub capacity: f64,
    /// Tokens added per second.
    pub fill_rate: f64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared non-blocking token-bucket limiter.
#[derive(Debug)]
pub struct RateLimiter {
    defaults: BucketLimits,
    overrides: DashMap<String, BucketLimits>,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(capacity: f64, fill_rate: f64) -> Self {
        RateLimiter {
            defaults: BucketLimits {
                capacity,
                fill_rate,
            },
            overrides: DashMap::new(),
            buckets: DashMap::new(),
        }
    }

    /// Overrides the limits for one key. An existing bucket keeps its
    /// current tokens, capped to the new capacity on the next refill.
    pub fn set_limits(&self, key: &str, limits: BucketLimits) {
        self.overrides.insert(key.to_string(), limits);
    }

    fn limits(&self, key: &str) -> BucketLimits {
        self.overrides
            .get(key)
            .map(|l| *l)
            .unwrap_or(self.defaults)
    }

    /// Takes one token for `key` if available. Never blocks.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_at(key, Instant::now())
    }

    /// [`try_acquire`](Self::try_acquire) against an explicit clock reading.
    pub fn try_acquire_at(&self, key: &str, now: Instant) -> bool {
        let limits = self.limits(key);
        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: limits.capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * limits.fill_rate).min(limits.capacity);
        bucket.last_refill = bucket.last_refill.max(now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available for `key`, without refilling.
    pub fn available(&self, key: &str) -> f64 {
        self.buckets
            .get(key)
            .map(|b| b.tokens)
            .unwrap_or_else(|| self.limits(key).capacity)
    }
}
