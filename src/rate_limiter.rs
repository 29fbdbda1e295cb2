use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::token_bucket::TokenBucket;

/// Process-wide admission gate shared by every in-flight request.
///
/// The refill and the decrement happen under one lock, so a token can only
/// ever be handed to a single caller. Callers never wait for a token: a denied
/// request is rejected on the spot.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(capacity, refill_rate)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.rate_limit_capacity, config.rate_limit_refill_per_sec)
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, now: Instant) -> bool {
        self.lock().consume_at(1, now)
    }

    /// Time until the next token, or `None` if the bucket never refills.
    pub fn retry_after(&self) -> Option<Duration> {
        self.lock().time_until_available(1)
    }

    pub fn capacity(&self) -> u32 {
        self.lock().capacity()
    }

    pub fn refill_rate(&self) -> f64 {
        self.lock().refill_rate()
    }

    // Bucket updates are single assignments, so a panicking holder cannot
    // leave it half-written.
    fn lock(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
