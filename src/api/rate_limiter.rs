//! Token-bucket throttle for outbound exchange calls.
//!
//! Two layers:
//! - local throttling: a bucket of `capacity` weight units refilled at a
//!   fixed rate; callers wait for tokens up to a ceiling, then fail
//! - exchange-side cooldown: each rate-limit rejection from the exchange
//!   doubles a cooldown window (up to a maximum) during which nothing is
//!   granted; a streak of successes clears it

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TradingError};
use crate::trading::RateLimitConfig;

/// Anything that gates outbound calls.
#[async_trait]
pub trait Throttle: Send + Sync {
    /// Wait for `weight` units or fail with `RateLimitExceeded`.
    async fn acquire(&self, weight: u32) -> Result<()>;

    /// Record an exchange-side rate-limit rejection. Returns the new cooldown.
    fn on_rate_limited(&self) -> Duration;

    /// Record a successful exchange call.
    fn on_success(&self);
}

/// Point-in-time view of the limiter.
#[derive(Debug, Clone)]
pub struct LimiterStatus {
    pub available_tokens: f64,
    pub capacity: f64,
    pub cooldown_remaining: Option<Duration>,
    pub violations: u64,
    pub granted_weight: u64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
    cooldown: ExponentialBackoff,
    in_cooldown_regime: bool,
    success_streak: u32,
    violations: u64,
    granted_weight: u64,
}

impl BucketState {
    fn refill(&mut self, now: Instant, capacity: f64, refill_per_sec: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_refill = now;
    }

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

/// Shared, internally synchronized rate limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<BucketState>,
    shutdown: CancellationToken,
}

impl RateLimiter {
    /// Create a limiter with a full bucket.
    pub fn new(config: &RateLimitConfig, shutdown: CancellationToken) -> Self {
        let cooldown = ExponentialBackoff {
            initial_interval: config.initial_cooldown(),
            current_interval: config.initial_cooldown(),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_interval: config.max_cooldown(),
            max_elapsed_time: None,
            ..Default::default()
        };

        Self {
            config: config.clone(),
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
                cooldown_until: None,
                cooldown,
                in_cooldown_regime: false,
                success_streak: 0,
                violations: 0,
                granted_weight: 0,
            }),
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // A panic while holding the lock cannot leave the bucket inconsistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Try to take `weight` now. Returns the wait needed otherwise.
    fn try_take(&self, weight: f64) -> std::result::Result<(), Duration> {
        let now = Instant::now();
        let mut state = self.lock();
        state.refill(now, self.config.capacity, self.config.refill_per_sec);

        if let Some(remaining) = state.cooldown_remaining(now) {
            return Err(remaining);
        }

        if state.tokens >= weight {
            state.tokens -= weight;
            state.granted_weight += weight as u64;
            return Ok(());
        }

        let deficit = weight - state.tokens;
        Err(Duration::from_secs_f64(deficit / self.config.refill_per_sec))
    }

    pub fn status(&self) -> LimiterStatus {
        let now = Instant::now();
        let mut state = self.lock();
        state.refill(now, self.config.capacity, self.config.refill_per_sec);
        LimiterStatus {
            available_tokens: state.tokens,
            capacity: self.config.capacity,
            cooldown_remaining: state.cooldown_remaining(now),
            violations: state.violations,
            granted_weight: state.granted_weight,
        }
    }
}

#[async_trait]
impl Throttle for RateLimiter {
    async fn acquire(&self, weight: u32) -> Result<()> {
        let weight = weight as f64;
        if weight > self.config.capacity {
            return Err(TradingError::RateLimitExceeded {
                reason: format!(
                    "weight {} exceeds bucket capacity {}",
                    weight, self.config.capacity
                ),
                retry_after: Duration::ZERO,
            });
        }

        let deadline = Instant::now() + self.config.max_wait();

        loop {
            let wait = match self.try_take(weight) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            if Instant::now() + wait > deadline {
                warn!(
                    weight,
                    wait_ms = wait.as_millis() as u64,
                    max_wait_ms = self.config.max_wait_ms,
                    "Rate limiter wait would exceed ceiling"
                );
                return Err(TradingError::RateLimitExceeded {
                    reason: "local throttle wait exceeds ceiling".to_string(),
                    retry_after: wait,
                });
            }

            debug!(weight, wait_ms = wait.as_millis() as u64, "Waiting for rate limit tokens");

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(TradingError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn on_rate_limited(&self) -> Duration {
        let now = Instant::now();
        let mut state = self.lock();
        let cooldown = state
            .cooldown
            .next_backoff()
            .unwrap_or(self.config.max_cooldown());

        state.violations += 1;
        state.success_streak = 0;
        state.in_cooldown_regime = true;
        state.cooldown_until = Some(now + cooldown);

        warn!(
            violations = state.violations,
            cooldown_ms = cooldown.as_millis() as u64,
            "Exchange rate limit hit, cooling down"
        );
        cooldown
    }

    fn on_success(&self) {
        let mut state = self.lock();
        state.success_streak += 1;

        if state.in_cooldown_regime && state.success_streak >= self.config.reset_after_successes {
            state.cooldown.reset();
            state.in_cooldown_regime = false;
            info!(
                streak = state.success_streak,
                "Rate limit cooldown reset after success streak"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: f64, refill_per_sec: f64, max_wait_ms: u64) -> RateLimitConfig {
        RateLimitConfig {
            capacity,
            refill_per_sec,
            max_wait_ms,
            initial_cooldown_ms: 1_000,
            max_cooldown_ms: 8_000,
            reset_after_successes: 3,
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_grants_more_than_capacity_at_once() {
        let limiter = RateLimiter::new(&config(10.0, 1.0, 0), CancellationToken::new());

        for _ in 0..10 {
            limiter.acquire(1).await.unwrap();
        }
        let err = limiter.acquire(1).await.unwrap_err();
        assert!(matches!(err, TradingError::RateLimitExceeded { .. }));
        assert_eq!(limiter.status().granted_weight, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_refill_within_ceiling() {
        let limiter = RateLimiter::new(&config(10.0, 2.0, 10_000), CancellationToken::new());
        limiter.acquire(10).await.unwrap();

        let start = Instant::now();
        limiter.acquire(4).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(2));
        assert!(waited < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_weight_above_capacity() {
        let limiter = RateLimiter::new(&config(5.0, 1.0, 60_000), CancellationToken::new());
        assert!(limiter.acquire(6).await.is_err());
        // Nothing was consumed.
        assert_eq!(limiter.status().granted_weight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_strictly_increases_to_max() {
        let limiter = RateLimiter::new(&config(10.0, 1.0, 0), CancellationToken::new());

        let cooldowns: Vec<Duration> = (0..5).map(|_| limiter.on_rate_limited()).collect();
        assert!(cooldowns[0] < cooldowns[1]);
        assert!(cooldowns[1] < cooldowns[2]);
        assert!(cooldowns[2] < cooldowns[3]);
        assert_eq!(cooldowns[3], Duration::from_secs(8));
        assert_eq!(cooldowns[4], Duration::from_secs(8));
        assert_eq!(limiter.status().violations, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_then_success_streak_resets() {
        let limiter = RateLimiter::new(&config(10.0, 1.0, 500), CancellationToken::new());
        limiter.on_rate_limited();
        limiter.on_rate_limited();

        // 2s cooldown is longer than the 500ms ceiling.
        assert!(limiter.acquire(1).await.is_err());

        tokio::time::advance(Duration::from_secs(3)).await;
        limiter.acquire(1).await.unwrap();

        for _ in 0..3 {
            limiter.on_success();
        }
        assert_eq!(limiter.on_rate_limited(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_cancelled_by_shutdown() {
        let token = CancellationToken::new();
        let limiter = RateLimiter::new(&config(1.0, 0.01, 600_000), token.clone());
        limiter.acquire(1).await.unwrap();

        token.cancel();
        let err = limiter.acquire(1).await.unwrap_err();
        assert!(matches!(err, TradingError::Cancelled));
    }
}
