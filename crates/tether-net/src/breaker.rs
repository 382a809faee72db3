//! Three-state circuit breaker.
//!
//! ```text
//!   Closed --(threshold crossed / force_open)--> Open
//!   Open   --(cooldown elapsed, on next query)--> HalfOpen
//!   HalfOpen --(probe succeeds)--> Closed
//!   HalfOpen --(probe fails)-----> Open
//! ```
//!
//! The breaker trips when either the consecutive-failure count reaches
//! `failure_threshold` or, once `minimum_calls` outcomes are in the rolling
//! window, the failure ratio reaches `failure_rate_threshold`. The Open to
//! HalfOpen move happens lazily when the breaker is next queried; no timer
//! task is involved. While half-open exactly one probe is admitted.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tether_config::BreakerConfig;
use tokio::time::Instant;

use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Returned when the breaker refuses a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker open, retry in {retry_in:?}")]
pub struct BreakerOpen {
    /// Remaining cooldown. Zero while a half-open probe is in flight.
    pub retry_in: Duration,
}

/// Point-in-time view of the breaker for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_ratio: f64,
    pub window_len: usize,
    pub trips: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
    /// Rolling outcomes, `true` for failure.
    window: VecDeque<bool>,
    probe_in_flight: bool,
    trips: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                opened_at: None,
                consecutive_failures: 0,
                window: VecDeque::with_capacity(config.window_size),
                probe_in_flight: false,
                trips: 0,
            }),
            config,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, applying the lazy Open to HalfOpen transition.
    pub fn state(&self) -> BreakerState {
        let mut inner = lock(&self.inner);
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Ask permission for one call. In half-open state only the first caller
    /// gets through; it must report back with `record_success` or
    /// `record_failure`.
    pub fn try_acquire(&self) -> Result<(), BreakerOpen> {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        self.refresh(&mut inner, now);
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(BreakerOpen {
                retry_in: self.remaining(&inner, now),
            }),
            BreakerState::HalfOpen if inner.probe_in_flight => Err(BreakerOpen {
                retry_in: Duration::ZERO,
            }),
            BreakerState::HalfOpen => {
                inner.probe_in_flight = true;
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = lock(&self.inner);
        match inner.state {
            BreakerState::HalfOpen => {
                tracing::info!("Circuit breaker closed after successful probe");
                inner.state = BreakerState::Closed;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                inner.consecutive_failures = 0;
                inner.window.clear();
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                self.push_outcome(&mut inner, false);
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        match inner.state {
            BreakerState::HalfOpen => {
                tracing::warn!("Half-open probe failed, reopening circuit breaker");
                self.trip(&mut inner, now);
            }
            BreakerState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                self.push_outcome(&mut inner, true);
                if self.should_trip(&inner) {
                    tracing::warn!(
                        consecutive = inner.consecutive_failures,
                        ratio = failure_ratio(&inner.window),
                        "Circuit breaker opened"
                    );
                    self.trip(&mut inner, now);
                }
            }
            BreakerState::Open => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            }
        }
    }

    /// Open immediately regardless of counters (used for escalation).
    pub fn force_open(&self) {
        let mut inner = lock(&self.inner);
        tracing::warn!("Circuit breaker forced open");
        self.trip(&mut inner, Instant::now());
    }

    /// Return to Closed and forget all history.
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
        inner.consecutive_failures = 0;
        inner.window.clear();
        inner.probe_in_flight = false;
    }

    /// Time left before a probe is allowed, if currently open.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        self.refresh(&mut inner, now);
        (inner.state == BreakerState::Open).then(|| self.remaining(&inner, now))
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = lock(&self.inner);
        self.refresh(&mut inner, Instant::now());
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_ratio: failure_ratio(&inner.window),
            window_len: inner.window.len(),
            trips: inner.trips,
        }
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.state == BreakerState::Open
            && let Some(opened_at) = inner.opened_at
            && now.duration_since(opened_at) >= self.config.cooldown()
        {
            tracing::debug!("Circuit breaker cooldown elapsed, half-open");
            inner.state = BreakerState::HalfOpen;
            inner.probe_in_flight = false;
        }
    }

    fn remaining(&self, inner: &Inner, now: Instant) -> Duration {
        inner
            .opened_at
            .map(|at| self.config.cooldown().saturating_sub(now.duration_since(at)))
            .unwrap_or_default()
    }

    fn push_outcome(&self, inner: &mut Inner, failed: bool) {
        if inner.window.len() >= self.config.window_size.max(1) {
            inner.window.pop_front();
        }
        inner.window.push_back(failed);
    }

    fn should_trip(&self, inner: &Inner) -> bool {
        if inner.consecutive_failures >= self.config.failure_threshold {
            return true;
        }
        inner.window.len() >= self.config.minimum_calls
            && failure_ratio(&inner.window) >= self.config.failure_rate_threshold
    }

    fn trip(&self, inner: &mut Inner, now: Instant) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        inner.probe_in_flight = false;
        inner.trips += 1;
    }
}

fn failure_ratio(window: &VecDeque<bool>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    window.iter().filter(|failed| **failed).count() as f64 / window.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            window_size: 10,
            minimum_calls: 10,
            cooldown_ms: 30_000,
        }
    }

    fn fail_n(breaker: &CircuitBreaker, n: usize) {
        for _ in 0..n {
            breaker.try_acquire().unwrap();
            breaker.record_failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(config());
        fail_n(&breaker, 4);
        assert_eq!(breaker.state(), BreakerState::Closed);

        fail_n(&breaker, 1);
        assert_eq!(breaker.state(), BreakerState::Open);

        let err = breaker.try_acquire().unwrap_err();
        assert_eq!(err.retry_in, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new(config());
        fail_n(&breaker, 4);
        breaker.record_success();
        fail_n(&breaker, 4);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_on_failure_ratio() {
        let breaker = CircuitBreaker::new(config());
        // Alternate outcomes: never more than one failure in a row
        for _ in 0..4 {
            breaker.record_failure();
            breaker.record_success();
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed, "below minimum calls");

        breaker.record_failure();
        assert_eq!(breaker.snapshot().window_len, 10);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown_admits_single_probe() {
        let breaker = CircuitBreaker::new(config());
        breaker.force_open();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            breaker.remaining_cooldown(),
            Some(Duration::from_secs(20))
        );

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        assert!(breaker.try_acquire().is_ok());
        assert_eq!(
            breaker.try_acquire(),
            Err(BreakerOpen {
                retry_in: Duration::ZERO
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes() {
        let breaker = CircuitBreaker::new(config());
        fail_n(&breaker, 5);
        tokio::time::advance(Duration::from_secs(30)).await;

        breaker.try_acquire().unwrap();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_with_fresh_cooldown() {
        let breaker = CircuitBreaker::new(config());
        fail_n(&breaker, 5);
        tokio::time::advance(Duration::from_secs(30)).await;

        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.remaining_cooldown(), Some(Duration::from_secs(30)));
        assert_eq!(breaker.snapshot().trips, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes() {
        let breaker = CircuitBreaker::new(config());
        breaker.force_open();
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.remaining_cooldown(), None);
    }
}
