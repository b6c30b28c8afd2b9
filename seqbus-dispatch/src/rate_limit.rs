//! Per-lane rate limiting.
//!
//! A processor lane may be gated by a [`RateLimiter`]: before each handler call the
//! lane waits for admission, which suspends that lane and no other.

// Token counts are tracked as f64 for fractional refill.
#![allow(clippy::cast_precision_loss)]

use crate::error::{DispatchError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use seqbus_core::config::RateLimitConfig;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Waits longer than this are logged.
const SLOW_WAIT_THRESHOLD: Duration = Duration::from_millis(100);

/// Floor applied to misconfigured rates.
const MIN_RATE: f64 = 0.001;

/// Why a limiter refused to admit a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// The token passed to `wait` was cancelled first
    #[error("rate limit wait cancelled")]
    Cancelled,
}

/// Admission gate consulted before each handler invocation.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait until one request may proceed or `ctx` is cancelled.
    async fn wait(&self, ctx: &CancellationToken) -> std::result::Result<(), RateLimitError>;

    /// Take a token if one is available right now.
    fn try_acquire(&self) -> bool;
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    rate: f64,
    burst: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    /// Take a token, or report how long until one accrues.
    fn take(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::try_from_secs_f64((1.0 - self.tokens) / self.rate)
                .unwrap_or(Duration::MAX))
        }
    }
}

/// Limiter snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    /// Sustained admissions per second
    pub rate_per_second: f64,
    /// Bucket size
    pub burst: u32,
    /// Tokens available now
    pub available_tokens: f64,
    /// Requests admitted
    pub admitted: u64,
    /// Admissions that had to wait
    pub delayed: u64,
    /// Waits abandoned through cancellation
    pub cancelled: u64,
}

/// Token bucket: `rate_per_second` tokens accrue continuously up to `burst`.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    state: Mutex<BucketState>,
    admitted: AtomicU64,
    delayed: AtomicU64,
    cancelled: AtomicU64,
}

impl TokenBucketLimiter {
    /// Create a full bucket.
    pub fn new(rate_per_second: f64, burst: u32) -> Result<Self> {
        Self::check(rate_per_second, burst)?;
        Ok(Self {
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                rate: rate_per_second,
                burst: f64::from(burst),
                last_refill: Instant::now(),
            }),
            admitted: AtomicU64::new(0),
            delayed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        })
    }

    /// Create from a validated configuration section.
    ///
    /// Out-of-range values are clamped to the smallest legal bucket.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let rate = if config.rate_per_second.is_finite() && config.rate_per_second > 0.0 {
            config.rate_per_second
        } else {
            MIN_RATE
        };
        let burst = config.burst.max(1);
        Self {
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                rate,
                burst: f64::from(burst),
                last_refill: Instant::now(),
            }),
            admitted: AtomicU64::new(0),
            delayed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    fn check(rate_per_second: f64, burst: u32) -> Result<()> {
        if !(rate_per_second.is_finite() && rate_per_second > 0.0) {
            return Err(DispatchError::config("rate_per_second must be a positive number"));
        }
        if burst == 0 {
            return Err(DispatchError::config("burst must be at least 1"));
        }
        Ok(())
    }

    /// Change the sustained rate. Tokens already accrued are kept.
    pub fn set_rate(&self, rate_per_second: f64) -> Result<()> {
        Self::check(rate_per_second, 1)?;
        let mut state = self.state.lock();
        state.refill(Instant::now());
        let old = state.rate;
        state.rate = rate_per_second;
        drop(state);
        info!(old_rate = old, new_rate = rate_per_second, "Rate limit updated");
        Ok(())
    }

    /// Change the bucket size. Excess tokens are discarded.
    pub fn set_burst(&self, burst: u32) -> Result<()> {
        if burst == 0 {
            return Err(DispatchError::config("burst must be at least 1"));
        }
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.burst = f64::from(burst);
        state.tokens = state.tokens.min(state.burst);
        drop(state);
        info!(new_burst = burst, "Burst size updated");
        Ok(())
    }

    /// Current snapshot.
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        RateLimiterStats {
            rate_per_second: state.rate,
            burst: state.burst as u32,
            available_tokens: state.tokens,
            admitted: self.admitted.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn wait(&self, ctx: &CancellationToken) -> std::result::Result<(), RateLimitError> {
        let started = Instant::now();
        let mut waited = false;

        loop {
            let next = self.state.lock().take(Instant::now());
            let delay = match next {
                Ok(()) => break,
                Err(delay) => delay,
            };
            waited = true;

            tokio::select! {
                biased;
                () = ctx.cancelled() => {
                    self.cancelled.fetch_add(1, Ordering::Relaxed);
                    return Err(RateLimitError::Cancelled);
                },
                () = tokio::time::sleep(delay) => {},
            }
        }

        self.admitted.fetch_add(1, Ordering::Relaxed);
        if waited {
            self.delayed.fetch_add(1, Ordering::Relaxed);
            let elapsed = started.elapsed();
            if elapsed > SLOW_WAIT_THRESHOLD {
                warn!(wait_ms = elapsed.as_millis() as u64, "Rate limiter wait exceeded 100ms");
            }
        }
        Ok(())
    }

    fn try_acquire(&self) -> bool {
        let admitted = self.state.lock().take(Instant::now()).is_ok();
        if admitted {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }
}

/// Shared limiter reference that may be switched off.
#[derive(Clone, Default)]
pub struct RateLimiterHandle {
    inner: Option<Arc<dyn RateLimiter>>,
}

impl RateLimiterHandle {
    /// Handle that admits everything immediately.
    #[must_use]
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Handle backed by `limiter`.
    #[must_use]
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self { inner: Some(limiter) }
    }

    /// Token bucket when the section is enabled, otherwise a disabled handle.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        if config.enabled {
            Self::new(Arc::new(TokenBucketLimiter::from_config(config)))
        } else {
            Self::disabled()
        }
    }

    /// Whether a limiter is installed.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// The installed limiter, if any.
    #[must_use]
    pub fn limiter(&self) -> Option<Arc<dyn RateLimiter>> {
        self.inner.clone()
    }
}

#[async_trait]
impl RateLimiter for RateLimiterHandle {
    async fn wait(&self, ctx: &CancellationToken) -> std::result::Result<(), RateLimitError> {
        match &self.inner {
            Some(limiter) => limiter.wait(ctx).await,
            None => Ok(()),
        }
    }

    fn try_acquire(&self) -> bool {
        self.inner.as_ref().map_or(true, |limiter| limiter.try_acquire())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(TokenBucketLimiter::new(0.0, 1).is_err());
        assert!(TokenBucketLimiter::new(f64::NAN, 1).is_err());
        assert!(TokenBucketLimiter::new(10.0, 0).is_err());
    }

    #[test]
    fn test_burst_then_refusal() {
        let limiter = TokenBucketLimiter::new(0.5, 2).unwrap();
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.stats().admitted, 2);
    }

    #[tokio::test]
    async fn test_wait_paces_requests() {
        let limiter = TokenBucketLimiter::new(50.0, 1).unwrap();
        let ctx = CancellationToken::new();

        let started = Instant::now();
        for _ in 0..3 {
            limiter.wait(&ctx).await.unwrap();
        }
        // One token up front, two more at 20ms each.
        assert!(started.elapsed() >= Duration::from_millis(35));
        assert_eq!(limiter.stats().delayed, 2);
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let limiter = TokenBucketLimiter::new(0.01, 1).unwrap();
        assert!(limiter.try_acquire());

        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        assert_eq!(limiter.wait(&ctx).await, Err(RateLimitError::Cancelled));
        assert_eq!(limiter.stats().cancelled, 1);
    }

    #[test]
    fn test_runtime_adjustments() {
        let limiter = TokenBucketLimiter::new(10.0, 10).unwrap();
        limiter.set_burst(3).unwrap();
        assert!(limiter.stats().available_tokens <= 3.0);
        limiter.set_rate(100.0).unwrap();
        assert_eq!(limiter.stats().rate_per_second, 100.0);
        assert!(limiter.set_rate(-1.0).is_err());
        assert!(limiter.set_burst(0).is_err());
    }

    #[tokio::test]
    async fn test_disabled_handle_always_admits() {
        let handle = RateLimiterHandle::disabled();
        assert!(!handle.is_enabled());
        let ctx = CancellationToken::new();
        ctx.cancel();
        for _ in 0..1000 {
            assert!(handle.try_acquire());
        }
        assert_eq!(handle.wait(&ctx).await, Ok(()));
    }

    #[test]
    fn test_handle_from_config() {
        let mut config = RateLimitConfig::default();
        assert!(!RateLimiterHandle::from_config(&config).is_enabled());

        config.enabled = true;
        config.burst = 1;
        let handle = RateLimiterHandle::from_config(&config);
        assert!(handle.is_enabled());
        assert!(handle.try_acquire());
    }
}
