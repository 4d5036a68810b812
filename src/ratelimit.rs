use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// How often idle sender buckets are dropped.
const SENDER_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    pub global_rps: f64,
    pub global_burst: u32,
    pub per_sender_rps: f64,
    pub per_sender_burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig {
            global_rps: 100.0,
            global_burst: 100,
            per_sender_rps: 10.0,
            per_sender_burst: 10,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32, now: Instant) -> Self {
        TokenBucket {
            rate,
            burst: burst as f64,
            tokens: burst as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    fn has_token(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.tokens >= 1.0
    }

    fn is_full(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.tokens >= self.burst
    }

    fn take(&mut self) {
        self.tokens -= 1.0;
    }
}

#[derive(Debug)]
struct Buckets {
    global: TokenBucket,
    per_sender: HashMap<String, TokenBucket>,
    last_prune: Instant,
}

impl Buckets {
    /// A full bucket behaves exactly like a fresh one, so it can be dropped.
    fn prune(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_prune) < SENDER_PRUNE_INTERVAL {
            return;
        }
        self.per_sender.retain(|_, bucket| !bucket.is_full(now));
        self.last_prune = now;
    }
}

/// Token bucket limiter with one global bucket and one bucket per sender.
///
/// A request is only allowed when both the global and the sender bucket have a token, and
/// only then are tokens taken from both.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<Buckets>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        if config.global_rps <= 0.0 || config.per_sender_rps <= 0.0 {
            return Err(Error::InvalidConfig(String::from(
                "rate limiter RPS values must be positive",
            )));
        }
        if config.global_burst == 0 || config.per_sender_burst == 0 {
            return Err(Error::InvalidConfig(String::from(
                "rate limiter burst values must be positive",
            )));
        }
        let now = Instant::now();
        Ok(RateLimiter {
            buckets: Mutex::new(Buckets {
                global: TokenBucket::new(config.global_rps, config.global_burst, now),
                per_sender: HashMap::new(),
                last_prune: now,
            }),
            config,
        })
    }

    pub fn allow(&self, sender: &str) -> bool {
        self.allow_at(sender, Instant::now())
    }

    pub fn allow_at(&self, sender: &str, now: Instant) -> bool {
        let mut buckets = self.lock();
        buckets.prune(now);
        let config = &self.config;
        let Buckets {
            global, per_sender, ..
        } = &mut *buckets;
        let sender_bucket = per_sender.entry(sender.to_string()).or_insert_with(|| {
            TokenBucket::new(config.per_sender_rps, config.per_sender_burst, now)
        });
        if !global.has_token(now) || !sender_bucket.has_token(now) {
            return false;
        }
        global.take();
        sender_bucket.take();
        true
    }

    /// Number of senders currently tracked.
    pub fn sender_count(&self) -> usize {
        self.lock().per_sender.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Buckets> {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
