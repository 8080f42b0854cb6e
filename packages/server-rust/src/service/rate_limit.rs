//! Token-bucket [`RateGate`] keyed per provider.
//!
//! Each provider/limit pair gets a bucket of `max_requests` tokens refilled
//! evenly over `window_secs`. `acquire` sleeps until a token is available.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use opflow_core::{ProviderId, SrRateLimit};
use tokio::time::Instant;
use tracing::trace;

use crate::traits::RateGate;

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    /// Tokens per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(limit: SrRateLimit) -> Self {
        let max_tokens = f64::from(limit.max_requests.max(1));
        #[allow(clippy::cast_precision_loss)]
        let window = limit.window_secs.max(1) as f64;
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate: max_tokens / window,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Takes a token, or returns how long to wait for one.
    fn try_acquire(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate))
        }
    }
}

/// Per-provider token buckets. Calls without an Sr limit use the default
/// limit, or pass straight through when there is none.
#[derive(Default)]
pub struct TokenBucketGate {
    default_limit: Option<SrRateLimit>,
    buckets: DashMap<(ProviderId, u32, u64), TokenBucket>,
}

impl TokenBucketGate {
    #[must_use]
    pub fn new(default_limit: Option<SrRateLimit>) -> Self {
        Self {
            default_limit,
            buckets: DashMap::new(),
        }
    }

    fn try_acquire(&self, provider_id: ProviderId, limit: SrRateLimit) -> Result<(), Duration> {
        let key = (provider_id, limit.max_requests, limit.window_secs);
        self.buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(limit))
            .try_acquire()
    }
}

#[async_trait]
impl RateGate for TokenBucketGate {
    async fn acquire(&self, provider_id: ProviderId, limit: Option<SrRateLimit>) {
        let Some(limit) = limit.or(self.default_limit) else {
            return;
        };
        loop {
            match self.try_acquire(provider_id, limit) {
                Ok(()) => return,
                Err(wait) => {
                    trace!(provider_id = %provider_id, wait_ms = wait.as_millis(), "rate limited");
                    metrics::counter!("opflow_rate_limited_total").increment(1);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
