use std::time::{Duration, Instant};

/// Continuously refilling token bucket.
///
/// Tokens are kept as `f64` so fractional refill between calls is not lost.
/// `tokens` stays within `0.0..=capacity` after every operation.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket. Negative or non-finite refill rates are treated as zero.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self::new_at(capacity, refill_rate, Instant::now())
    }

    pub(crate) fn new_at(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        let refill_rate = if refill_rate.is_finite() && refill_rate > 0.0 {
            refill_rate
        } else {
            0.0
        };

        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate,
            last_refill: now,
        }
    }

    pub(crate) fn consume_at(&mut self, tokens: u32, now: Instant) -> bool {
        self.refill_at(now);

        if self.tokens >= tokens as f64 {
            self.tokens -= tokens as f64;
            true
        } else {
            false
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn refill_at(&mut self, now: Instant) {
        // A clock reading older than the last refill adds nothing.
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let tokens_to_add = self.refill_rate * elapsed.as_secs_f64();
        self.tokens = (self.tokens + tokens_to_add).min(self.capacity as f64);
        self.last_refill = now;
    }

    /// How long until `required_tokens` are available.
    ///
    /// `Some(Duration::ZERO)` if they are available now, `None` if they never
    /// will be (zero refill rate, more than `capacity` requested, or a wait
    /// too long to represent).
    pub fn time_until_available(&mut self, required_tokens: u32) -> Option<Duration> {
        self.time_until_available_at(required_tokens, Instant::now())
    }

    pub(crate) fn time_until_available_at(
        &mut self,
        required_tokens: u32,
        now: Instant,
    ) -> Option<Duration> {
        self.refill_at(now);

        if self.tokens >= required_tokens as f64 {
            return Some(Duration::ZERO);
        }
        if self.refill_rate == 0.0 || required_tokens > self.capacity {
            return None;
        }

        let tokens_needed = required_tokens as f64 - self.tokens;
        Duration::try_from_secs_f64(tokens_needed / self.refill_rate).ok()
    }
}
