use std::{
    sync::Arc,
    time::Instant,
};

use snafu::{ensure, Snafu};

#[derive(Debug, Snafu)]
pub enum ThrottleConfigError {
    #[snafu(display("{name} must be strictly between 0 and 1, got {value}"))]
    FactorOutOfRange { name: &'static str, value: f64 },

    #[snafu(display("token bucket size and rate must be greater than zero"))]
    EmptyBucket,
}

/// Millisecond clock seam so tests can drive time by hand.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall clock, measured from process-local monotonic time.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// A token bucket of capacity `size` refilled at `rate` tokens per
/// second.
///
/// `delay_ms` always debits the requested tokens, so the balance can go
/// negative; the caller is expected to wait out the returned delay before
/// issuing the work it just paid for.
pub struct TokenBucket {
    size: i64,
    rate: u64,
    tokens: i64,
    last_update: u64,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    pub fn new(size: u64, rate: u64, clock: Arc<dyn Clock>) -> Result<Self, ThrottleConfigError> {
        ensure!(size > 0 && rate > 0, EmptyBucketSnafu);
        let last_update = clock.now_millis();
        Ok(Self {
            size: size as i64,
            rate,
            tokens: size as i64,
            last_update,
            clock,
        })
    }

    /// Debit `tokens_needed` and return how long the caller must wait, in
    /// milliseconds: zero when the bucket held enough, otherwise exactly
    /// `ceil((needed - tokens) * 1000 / (rate * rate_factor))`.
    pub fn delay_ms(&mut self, tokens_needed: u64, rate_factor: f64) -> u64 {
        self.refill();

        let needed = tokens_needed as i64;
        let delay = if self.tokens >= needed {
            0
        } else {
            let deficit = (needed - self.tokens) as f64;
            let effective_rate = self.rate as f64 * rate_factor;
            (deficit * 1000.0 / effective_rate).ceil() as u64
        };

        self.tokens -= needed;
        delay
    }

    fn refill(&mut self) {
        let now = self.clock.now_millis();
        let elapsed = now.saturating_sub(self.last_update);
        let refilled = (elapsed * self.rate) / 1000;
        if refilled > 0 {
            self.tokens = self.size.min(self.tokens + refilled as i64);
        }
        self.last_update = now;
    }
}

/// Validated knobs for adaptive rate adjustment: multiplicative decrease
/// on sink errors, proportional recovery while throttled but healthy.
#[derive(Debug, Clone, Copy)]
pub struct AdaptivePolicy {
    backoff: f64,
    recovery: f64,
    min_rate_factor: f64,
}

impl AdaptivePolicy {
    pub fn new(
        backoff: f64,
        recovery: f64,
        min_rate_factor: f64,
    ) -> Result<Self, ThrottleConfigError> {
        for (name, value) in [
            ("backoff", backoff),
            ("recovery", recovery),
            ("min_rate_factor", min_rate_factor),
        ] {
            ensure!(
                value > 0.0 && value < 1.0,
                FactorOutOfRangeSnafu { name, value }
            );
        }
        Ok(Self {
            backoff,
            recovery,
            min_rate_factor,
        })
    }
}

/// N token buckets over parallel dimensions (records per second, bytes
/// per second, ...). A demand is paid into every bucket and the longest
/// delay wins.
///
/// With an [`AdaptivePolicy`] attached, sink errors shrink the effective
/// rate multiplicatively and sustained throttling without errors walks it
/// back toward full speed.
pub struct Throttle {
    buckets: Vec<TokenBucket>,
    rate_adjustment_factor: f64,
    consecutive_errors: u64,
    policy: Option<AdaptivePolicy>,
}

impl Throttle {
    pub fn new(buckets: Vec<TokenBucket>) -> Self {
        Self {
            buckets,
            rate_adjustment_factor: 1.0,
            consecutive_errors: 0,
            policy: None,
        }
    }

    pub fn adaptive(buckets: Vec<TokenBucket>, policy: AdaptivePolicy) -> Self {
        Self {
            policy: Some(policy),
            ..Self::new(buckets)
        }
    }

    pub fn rate_adjustment_factor(&self) -> f64 {
        self.rate_adjustment_factor
    }

    pub fn consecutive_error_count(&self) -> u64 {
        self.consecutive_errors
    }

    /// Debit `demands` (one entry per bucket) and return the wait before
    /// the work may proceed.
    pub fn delay_ms(&mut self, demands: &[u64]) -> u64 {
        debug_assert_eq!(demands.len(), self.buckets.len());

        let factor = self.rate_adjustment_factor;
        let delay = self
            .buckets
            .iter_mut()
            .zip(demands)
            .map(|(bucket, demand)| bucket.delay_ms(*demand, factor))
            .max()
            .unwrap_or(0);

        if delay > 0 {
            self.on_throttled();
        }
        delay
    }

    /// A sink reported a failed send.
    pub fn on_error(&mut self) {
        self.consecutive_errors += 1;
        if let Some(policy) = self.policy {
            self.rate_adjustment_factor =
                policy.min_rate_factor.max(self.rate_adjustment_factor * policy.backoff);
        }
    }

    /// A sink reported a successful send.
    pub fn on_success(&mut self) {
        self.consecutive_errors = 0;
    }

    fn on_throttled(&mut self) {
        if let Some(policy) = self.policy {
            if self.consecutive_errors == 0 {
                self.rate_adjustment_factor +=
                    (1.0 - self.rate_adjustment_factor) * policy.recovery;
            }
        }
    }
}
