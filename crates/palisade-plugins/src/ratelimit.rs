//! Token-bucket throttling of cross-boundary calls
//!
//! One bucket per (plugin, operation), created on first use. Tokens are whole
//! numbers and refill is computed in integer nanoseconds against the tokio
//! monotonic clock, so the number of calls allowed in any window `T` is at
//! most `capacity + floor(T * refill_per_sec)`.

use std::time::Duration;

use dashmap::DashMap;
use palisade_core::config::{BucketConfig, RateConfig};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct TokenBucket {
    capacity: u64,
    /// Time to mint one token, rounded up; `None` never refills
    per_token: Option<u64>,
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: BucketConfig, now: Instant) -> Self {
        let capacity = u64::from(config.capacity);
        let per_token = if config.refill_per_sec > 0.0 && config.refill_per_sec.is_finite() {
            let nanos = (1_000_000_000f64 / config.refill_per_sec).ceil();
            Some((nanos as u64).max(1))
        } else {
            None
        };

        Self {
            capacity,
            per_token,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let Some(per_token) = self.per_token else {
            self.last_refill = now;
            return;
        };
        if self.tokens >= self.capacity {
            // A full bucket does not bank time.
            self.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill).as_nanos();
        let minted = elapsed / u128::from(per_token);
        if minted == 0 {
            return;
        }

        let room = self.capacity - self.tokens;
        if minted >= u128::from(room) {
            self.tokens = self.capacity;
            self.last_refill = now;
        } else {
            // minted < room <= u64::MAX
            let minted = minted as u64;
            self.tokens += minted;
            self.last_refill += Duration::from_nanos(minted.saturating_mul(per_token));
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateConfig,
    buckets: DashMap<(String, String), Mutex<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Take one token for `operation`; `false` means throttled
    pub fn try_acquire(&self, plugin_id: &str, operation: &str) -> bool {
        let now = Instant::now();
        let key = (plugin_id.to_string(), operation.to_string());

        let allowed = if let Some(bucket) = self.buckets.get(&key) {
            bucket.lock().try_take(now)
        } else {
            let config = self.config.bucket_for(operation);
            let bucket = self
                .buckets
                .entry(key)
                .or_insert_with(|| Mutex::new(TokenBucket::new(config, now)));
            bucket.lock().try_take(now)
        };

        if !allowed {
            debug!(plugin_id = %plugin_id, operation = %operation, "Throttled");
        }
        allowed
    }

    /// Tokens currently available, if the bucket exists
    pub fn available(&self, plugin_id: &str, operation: &str) -> Option<u64> {
        let key = (plugin_id.to_string(), operation.to_string());
        self.buckets.get(&key).map(|bucket| {
            let mut bucket = bucket.lock();
            bucket.refill(Instant::now());
            bucket.tokens
        })
    }

    /// Drop every bucket belonging to one plugin
    pub fn reset(&self, plugin_id: &str) {
        self.buckets.retain(|(plugin, _), _| plugin != plugin_id);
    }

    /// Drop every bucket; administrative recovery only
    pub fn reset_all(&self) {
        self.buckets.clear();
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
