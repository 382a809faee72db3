//! Backoff delay computation and reconnection attempt bookkeeping.
//!
//! [`BackoffPolicy::delay_for`] is a pure function of the 1-based attempt
//! number (plus randomness for the jittered strategy). [`ReconnectState`]
//! counts attempts within one reconnection cycle and applies the temporary
//! escalation multiplier used when abnormal error patterns are detected.

use std::time::Duration;

use rand::Rng;
use tether_config::{BackoffStrategy, ReconnectConfig};

/// How long to wait before each retry or reconnection attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    /// Growth factor for the exponential strategies.
    pub factor: f64,
    pub max_delay: Duration,
    /// Jitter multiplier bounds for [`BackoffStrategy::ExponentialJitter`].
    pub jitter_min: f64,
    pub jitter_max: f64,
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            factor: 1.0,
            max_delay: delay,
            jitter_min: 1.0,
            jitter_max: 1.0,
        }
    }

    pub fn linear(base: Duration, max: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            factor: 1.0,
            max_delay: max,
            ..Self::fixed(base)
        }
    }

    pub fn exponential(base: Duration, factor: f64, max: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            factor,
            max_delay: max,
            ..Self::fixed(base)
        }
    }

    /// Switch to the jittered exponential strategy with the given bounds.
    pub fn with_jitter(mut self, min: f64, max: f64) -> Self {
        self.strategy = BackoffStrategy::ExponentialJitter;
        self.jitter_min = min;
        self.jitter_max = max;
        self
    }

    /// Delay before `attempt` (1-based; 0 is treated as 1), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let multiplier = match self.strategy {
            BackoffStrategy::Fixed => 1.0,
            BackoffStrategy::Linear => f64::from(attempt),
            BackoffStrategy::Exponential => self.factor.powi(exponent(attempt)),
            BackoffStrategy::ExponentialJitter => {
                let jitter = if self.jitter_max > self.jitter_min {
                    rand::rng().random_range(self.jitter_min..=self.jitter_max)
                } else {
                    self.jitter_min
                };
                self.factor.powi(exponent(attempt)) * jitter
            }
        };
        scale(self.base_delay, multiplier, self.max_delay)
    }
}

impl From<&ReconnectConfig> for BackoffPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            strategy: config.strategy,
            base_delay: config.base_delay(),
            factor: config.backoff_factor,
            max_delay: config.max_delay(),
            jitter_min: config.jitter_min,
            jitter_max: config.jitter_max,
        }
    }
}

fn exponent(attempt: u32) -> i32 {
    i32::try_from(attempt - 1).unwrap_or(i32::MAX)
}

/// `base * multiplier`, clamped to `max`. Saturates instead of overflowing.
fn scale(base: Duration, multiplier: f64, max: Duration) -> Duration {
    let nanos = base.as_nanos() as f64 * multiplier;
    let capped = nanos.min(max.as_nanos() as f64).max(0.0);
    Duration::from_nanos(capped as u64)
}

/// Attempt counter for one reconnection cycle.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: BackoffPolicy,
    max_attempts: u32,
    attempts: u32,
    escalation: Option<(f64, Duration)>,
}

impl ReconnectState {
    pub fn new(policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            policy,
            max_attempts,
            attempts: 0,
            escalation: None,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(BackoffPolicy::from(config), config.max_attempts)
    }

    /// Advance the attempt counter and return the delay before that attempt.
    /// Returns `None` once `max_attempts` have been used.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;

        let delay = self.policy.delay_for(self.attempts);
        Some(match self.escalation {
            Some((factor, cap)) => scale(delay, factor, cap.max(self.policy.max_delay)),
            None => delay,
        })
    }

    /// Stretch subsequent delays by `factor`, allowing them to reach `cap`.
    /// Cleared by [`reset`](Self::reset).
    pub fn escalate(&mut self, factor: f64, cap: Duration) {
        self.escalation = Some((factor, cap));
    }

    pub fn is_escalated(&self) -> bool {
        self.escalation.is_some()
    }

    /// Start a fresh cycle (after a successful connection or an explicit connect).
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.escalation = None;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential() -> BackoffPolicy {
        BackoffPolicy::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(30))
    }

    #[test]
    fn test_backoff_sequence_is_exponential() {
        let policy = exponential();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = exponential();
        let delays: Vec<u128> = (1..=7).map(|n| policy.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn test_max_backoff_is_capped() {
        let policy = exponential();
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_attempt_zero_behaves_like_first() {
        assert_eq!(exponential().delay_for(0), Duration::from_secs(1));
    }

    #[test]
    fn test_fixed_and_linear() {
        let fixed = BackoffPolicy::fixed(Duration::from_millis(250));
        assert_eq!(fixed.delay_for(1), Duration::from_millis(250));
        assert_eq!(fixed.delay_for(9), Duration::from_millis(250));

        let linear = BackoffPolicy::linear(Duration::from_millis(500), Duration::from_secs(2));
        assert_eq!(linear.delay_for(1), Duration::from_millis(500));
        assert_eq!(linear.delay_for(3), Duration::from_millis(1500));
        assert_eq!(linear.delay_for(10), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = exponential().with_jitter(0.8, 1.2);
        for attempt in 1..=12 {
            let nominal = exponential().delay_for(attempt);
            let delay = policy.delay_for(attempt);
            assert!(delay >= nominal.mul_f64(0.8) - Duration::from_micros(1));
            assert!(delay <= nominal.mul_f64(1.2).min(Duration::from_secs(30)));
        }
    }

    #[test]
    fn test_jitter_varies_delay() {
        let policy = exponential().with_jitter(0.8, 1.2);
        let delays: Vec<_> = (0..20).map(|_| policy.delay_for(2)).collect();
        assert!(
            delays.windows(2).any(|w| w[0] != w[1]),
            "Jitter should cause variation in delays: {delays:?}"
        );
    }

    #[test]
    fn test_default_config_delays_stay_in_range() {
        let policy = BackoffPolicy::from(&ReconnectConfig::default());
        for attempt in 1..=10 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= Duration::from_millis(800), "{attempt}: {delay:?}");
            assert!(delay <= Duration::from_secs(30), "{attempt}: {delay:?}");
        }
    }

    #[test]
    fn test_max_attempts_exhausted() {
        let mut state = ReconnectState::new(exponential(), 3);
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_none());
        assert_eq!(state.attempts(), 3);
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut state = ReconnectState::new(exponential(), 10);
        state.next_delay();
        state.next_delay();
        assert_eq!(state.attempts(), 2);

        state.reset();
        assert_eq!(state.attempts(), 0);
        assert_eq!(state.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_escalation_stretches_delays_until_reset() {
        let mut state = ReconnectState::new(exponential(), 10);
        state.escalate(2.0, Duration::from_secs(120));
        assert!(state.is_escalated());

        assert_eq!(state.next_delay(), Some(Duration::from_secs(2)));
        for _ in 0..8 {
            state.next_delay();
        }
        // 30s nominal cap doubled, still under the escalated cap
        assert_eq!(state.next_delay(), Some(Duration::from_secs(60)));

        state.reset();
        assert!(!state.is_escalated());
        assert_eq!(state.next_delay(), Some(Duration::from_secs(1)));
    }
}
