//! Token-bucket rate limiter with 429-feedback and backoff introspection.
//!
//! Hand-rolled rather than built on a crate like `governor`: the provider pool's
//! retry loop needs to drain the bucket and suspend refill for an exact
//! `retry_after` on a 429, and needs to report live utilisation and
//! cumulative wait for status reporting, none of which a generic limiter
//! exposes as a first-class operation.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::RateLimiterError;

/// Window over which `status().utilisation` is averaged.
const UTILISATION_WINDOW: Duration = Duration::from_secs(60);

/// Point-in-time view of a [`RateLimiter`]'s internal state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterStatus {
    /// Tokens currently available (fractional, since refill is continuous).
    pub tokens_available: f64,
    /// Configured bucket capacity.
    pub capacity: f64,
    /// Mean of `1 - tokens_available / capacity` observed over the trailing
    /// [`UTILISATION_WINDOW`], in `[0, 1]`.
    pub utilisation: f64,
    /// Total tokens consumed since construction.
    pub cumulative_consumed: u64,
    /// Total time callers have spent waiting for a token, since construction.
    pub cumulative_wait: Duration,
    /// Number of 429s recorded since construction.
    pub throttle_count: u64,
    /// Estimated time until the next token is available (zero if one is free now).
    pub time_until_next_token: Duration,
}

struct Inner {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
    cumulative_consumed: u64,
    cumulative_wait: Duration,
    throttle_count: u64,
    refill_suspended_until: Option<Instant>,
    /// `(observed_at, instantaneous utilisation)` samples within `UTILISATION_WINDOW`,
    /// oldest first; averaged in `status()` rather than reporting a point-in-time read.
    utilisation_samples: VecDeque<(Instant, f64)>,
}

/// A continuous token bucket shared by a provider pool's dispatcher and workers.
///
/// `acquire` blocks until a token is available, refilling continuously at
/// `rate` tokens/sec (capped at `capacity`). `record_429` drains the bucket and
/// suspends refill for `retry_after`, mirroring the cooldown a provider's own
/// 429 response demands.
pub struct RateLimiter {
    inner: Mutex<Inner>,
}

impl RateLimiter {
    /// Build a limiter with the given bucket `capacity` and steady-state `rate`
    /// (tokens refilled per second). Per §4.2, capacity is conventionally
    /// `1 burst + 1` so bursts above steady rate stay bounded.
    pub fn new(capacity: f64, rate: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tokens: capacity,
                capacity,
                rate,
                last_refill: Instant::now(),
                cumulative_consumed: 0,
                cumulative_wait: Duration::ZERO,
                throttle_count: 0,
                refill_suspended_until: None,
                utilisation_samples: VecDeque::new(),
            }),
        }
    }

    fn refill(inner: &mut Inner) {
        let now = Instant::now();
        if let Some(until) = inner.refill_suspended_until {
            if now < until {
                inner.last_refill = now;
                Self::sample_utilisation(inner, now);
                return;
            }
            inner.refill_suspended_until = None;
        }
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * inner.rate).min(inner.capacity);
        inner.last_refill = now;
        Self::sample_utilisation(inner, now);
    }

    /// Record the instantaneous utilisation at `now` and drop samples that
    /// have aged out of `UTILISATION_WINDOW`.
    fn sample_utilisation(inner: &mut Inner, now: Instant) {
        let instantaneous = 1.0 - (inner.tokens / inner.capacity);
        inner.utilisation_samples.push_back((now, instantaneous));
        while let Some((observed_at, _)) = inner.utilisation_samples.front() {
            if now.duration_since(*observed_at) > UTILISATION_WINDOW {
                inner.utilisation_samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Mean utilisation over the samples still within `UTILISATION_WINDOW`.
    fn mean_utilisation(inner: &Inner) -> f64 {
        if inner.utilisation_samples.is_empty() {
            return 1.0 - (inner.tokens / inner.capacity);
        }
        let sum: f64 = inner.utilisation_samples.iter().map(|(_, u)| u).sum();
        sum / inner.utilisation_samples.len() as f64
    }

    /// Acquire one token, waiting if the bucket is currently empty.
    ///
    /// Returns [`RateLimiterError::Cancelled`] if `token` fires before a token
    /// becomes available.
    pub async fn acquire(&self, token: &CancellationToken) -> Result<(), RateLimiterError> {
        let wait_start = Instant::now();
        loop {
            let wait = {
                let mut inner = self.inner.lock().expect("rate limiter mutex poisoned");
                Self::refill(&mut inner);
                if inner.tokens >= 1.0 {
                    inner.tokens -= 1.0;
                    inner.cumulative_consumed += 1;
                    inner.cumulative_wait += wait_start.elapsed();
                    Self::sample_utilisation(&mut inner, Instant::now());
                    return Ok(());
                }
                if let Some(until) = inner.refill_suspended_until {
                    until.saturating_duration_since(Instant::now()).max(Duration::from_millis(1))
                } else {
                    let deficit = 1.0 - inner.tokens;
                    Duration::from_secs_f64((deficit / inner.rate).max(0.001))
                }
            };
            tokio::select! {
                _ = sleep(wait) => continue,
                _ = token.cancelled() => return Err(RateLimiterError::Cancelled),
            }
        }
    }

    /// Record a 429 response from the provider: drains the bucket and
    /// suspends refill for `retry_after`.
    pub fn record_429(&self, retry_after: Duration) {
        let mut inner = self.inner.lock().expect("rate limiter mutex poisoned");
        Self::refill(&mut inner);
        inner.throttle_count += 1;
        inner.tokens = 0.0;
        inner.refill_suspended_until = Some(Instant::now() + retry_after);
        Self::sample_utilisation(&mut inner, Instant::now());
    }

    /// Snapshot current limiter state.
    pub fn status(&self) -> RateLimiterStatus {
        let mut inner = self.inner.lock().expect("rate limiter mutex poisoned");
        Self::refill(&mut inner);
        let time_until_next_token = if inner.tokens >= 1.0 {
            Duration::ZERO
        } else if let Some(until) = inner.refill_suspended_until {
            until.saturating_duration_since(Instant::now())
        } else {
            Duration::from_secs_f64(((1.0 - inner.tokens) / inner.rate).max(0.0))
        };
        RateLimiterStatus {
            tokens_available: inner.tokens,
            capacity: inner.capacity,
            utilisation: Self::mean_utilisation(&inner),
            cumulative_consumed: inner.cumulative_consumed,
            cumulative_wait: inner.cumulative_wait,
            throttle_count: inner.throttle_count,
            time_until_next_token,
        }
    }
}
