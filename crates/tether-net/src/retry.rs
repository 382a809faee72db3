//! Retry policies and the executor that runs fallible async operations
//! under them.
//!
//! A [`RetryPolicy`] pairs a [`BackoffPolicy`] with an attempt budget and a
//! predicate deciding whether a classified failure is worth retrying. The
//! [`PolicyRegistry`] maps names and error kinds to policies. The
//! [`RetryExecutor`] drives an operation: it consults the per-scope circuit
//! breaker, classifies each failure, sleeps between attempts (cancellable) and
//! folds every finished run into aggregate [`RetryStats`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tether_config::BreakerConfig;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::breaker::{BreakerOpen, CircuitBreaker};
use crate::classifier::{ErrorClassifier, ErrorContext, ErrorKind, ErrorRecord, Fault};
use crate::lock;

/// Decides whether a failed attempt should be retried.
pub type RetryCondition = Arc<dyn Fn(&ErrorRecord, &RetryContext) -> bool + Send + Sync>;

/// Name of the fallback policy.
pub const DEFAULT_POLICY: &str = "default";
pub const NETWORK_POLICY: &str = "network";
pub const AUTHENTICATION_POLICY: &str = "authentication";

const HISTORY_CAPACITY: usize = 32;

#[derive(Clone)]
pub struct RetryPolicy {
    pub name: String,
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    condition: RetryCondition,
}

impl RetryPolicy {
    /// A policy that retries recoverable failures.
    pub fn new(name: impl Into<String>, max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            name: name.into(),
            max_attempts: max_attempts.max(1),
            backoff,
            condition: Arc::new(|record, _| record.recoverable),
        }
    }

    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&ErrorRecord, &RetryContext) -> bool + Send + Sync + 'static,
    {
        self.condition = Arc::new(condition);
        self
    }

    pub fn should_retry(&self, record: &ErrorRecord, context: &RetryContext) -> bool {
        (self.condition)(record, context)
    }

    /// Three attempts, 500ms doubling up to 10s.
    pub fn default_policy() -> Self {
        Self::new(
            DEFAULT_POLICY,
            3,
            BackoffPolicy::exponential(Duration::from_millis(500), 2.0, Duration::from_secs(10)),
        )
    }

    /// Five attempts with jittered exponential backoff up to 30s.
    pub fn network() -> Self {
        Self::new(
            NETWORK_POLICY,
            5,
            BackoffPolicy::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(30))
                .with_jitter(0.8, 1.2),
        )
    }

    /// Credentials do not fix themselves: a single attempt, never retried.
    pub fn authentication() -> Self {
        Self::new(
            AUTHENTICATION_POLICY,
            1,
            BackoffPolicy::fixed(Duration::ZERO),
        )
        .with_condition(|_, _| false)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// Named policies plus an error-kind to policy mapping.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, RetryPolicy>,
    by_kind: HashMap<ErrorKind, String>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the default, network and authentication policies.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(RetryPolicy::default_policy());
        registry.register(RetryPolicy::network());
        registry.register(RetryPolicy::authentication());

        for kind in [ErrorKind::AuthenticationFailed, ErrorKind::AuthorizationFailed] {
            registry.map_kind(kind, AUTHENTICATION_POLICY);
        }
        for kind in [
            ErrorKind::ConnectionFailed,
            ErrorKind::Timeout,
            ErrorKind::SocketError,
            ErrorKind::DnsResolutionFailed,
            ErrorKind::NetworkUnreachable,
            ErrorKind::HostUnreachable,
            ErrorKind::ConnectionRefused,
            ErrorKind::TemporaryUnavailable,
        ] {
            registry.map_kind(kind, NETWORK_POLICY);
        }
        registry
    }

    /// Add or replace a policy under its own name.
    pub fn register(&mut self, policy: RetryPolicy) {
        self.policies.insert(policy.name.clone(), policy);
    }

    pub fn map_kind(&mut self, kind: ErrorKind, policy: impl Into<String>) {
        self.by_kind.insert(kind, policy.into());
    }

    pub fn get(&self, name: &str) -> Option<&RetryPolicy> {
        self.policies.get(name)
    }

    /// Named policy, falling back to the default one.
    pub fn get_or_default(&self, name: &str) -> RetryPolicy {
        self.get(name)
            .or_else(|| self.get(DEFAULT_POLICY))
            .cloned()
            .unwrap_or_else(RetryPolicy::default_policy)
    }

    /// Policy mapped to `kind`, falling back to the default one.
    pub fn for_kind(&self, kind: ErrorKind) -> Option<&RetryPolicy> {
        self.by_kind
            .get(&kind)
            .and_then(|name| self.get(name))
            .or_else(|| self.get(DEFAULT_POLICY))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Succeeded,
    Exhausted,
    NotRetryable,
    Cancelled,
    Rejected,
}

/// Per-run bookkeeping, created when a run starts and archived when it ends.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub operation_id: String,
    pub policy: String,
    /// Attempts made so far (1-based once the first attempt starts).
    pub attempt: u32,
    pub errors: Vec<Arc<ErrorRecord>>,
    pub delays: Vec<Duration>,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
    pub outcome: Option<RetryOutcome>,
}

impl RetryContext {
    fn new(operation_id: &str, policy: &str) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            policy: policy.to_string(),
            attempt: 0,
            errors: Vec::new(),
            delays: Vec::new(),
            started_at: Instant::now(),
            finished_at: None,
            outcome: None,
        }
    }

    pub fn last_error(&self) -> Option<&Arc<ErrorRecord>> {
        self.errors.last()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempt(s): {}", .last.technical)]
    Exhausted {
        attempts: u32,
        last: Arc<ErrorRecord>,
    },

    #[error("not retryable: {}", .last.technical)]
    NotRetryable { last: Arc<ErrorRecord> },

    #[error("operation cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    #[error(transparent)]
    BreakerOpen(#[from] BreakerOpen),

    #[error("too many concurrent retry operations (limit {limit})")]
    TooManyConcurrent { limit: usize },
}

impl RetryError {
    pub fn last_error(&self) -> Option<&ErrorRecord> {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::NotRetryable { last } => Some(last),
            _ => None,
        }
    }
}

/// Aggregate counters over finished runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryStats {
    pub operations: u64,
    pub succeeded: u64,
    pub exhausted: u64,
    pub not_retryable: u64,
    pub cancelled: u64,
    pub rejected: u64,
    /// Failed attempts across all runs.
    pub failed_attempts: u64,
    pub total_delay: Duration,
}

pub struct RetryExecutor {
    classifier: Arc<ErrorClassifier>,
    breaker_config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    stats: Mutex<RetryStats>,
    history: Mutex<VecDeque<RetryContext>>,
}

impl RetryExecutor {
    pub const DEFAULT_MAX_CONCURRENT: usize = 16;

    pub fn new(classifier: Arc<ErrorClassifier>, breaker_config: BreakerConfig) -> Self {
        Self::with_max_concurrent(classifier, breaker_config, Self::DEFAULT_MAX_CONCURRENT)
    }

    pub fn with_max_concurrent(
        classifier: Arc<ErrorClassifier>,
        breaker_config: BreakerConfig,
        max_concurrent: usize,
    ) -> Self {
        Self {
            classifier,
            breaker_config,
            breakers: DashMap::new(),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            stats: Mutex::new(RetryStats::default()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    /// Share an existing breaker for a scope instead of creating one lazily.
    pub fn register_breaker(&self, scope: impl Into<String>, breaker: Arc<CircuitBreaker>) {
        self.breakers.insert(scope.into(), breaker);
    }

    /// Breaker guarding `scope`, created on first use.
    pub fn breaker_for(&self, scope: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.breaker_config.clone())))
            .clone()
    }

    /// Run `operation` under `policy`. The policy name is the breaker scope.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation_id: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        self.execute_observed(operation_id, policy, cancel, operation, |_| {})
            .await
    }

    /// Like [`execute_with_retry`](Self::execute_with_retry), reporting every
    /// classified failure to `on_error` before deciding whether to retry.
    pub async fn execute_observed<T, F, Fut, O>(
        &self,
        operation_id: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut operation: F,
        mut on_error: O,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
        O: FnMut(&Arc<ErrorRecord>),
    {
        let mut ctx = RetryContext::new(operation_id, &policy.name);

        let Ok(_permit) = self.permits.clone().try_acquire_owned() else {
            tracing::warn!(operation_id, limit = self.max_concurrent, "Retry concurrency cap reached");
            self.finish(ctx, RetryOutcome::Rejected);
            return Err(RetryError::TooManyConcurrent {
                limit: self.max_concurrent,
            });
        };
        let breaker = self.breaker_for(&policy.name);

        loop {
            if cancel.is_cancelled() {
                let attempts = ctx.attempt;
                self.finish(ctx, RetryOutcome::Cancelled);
                return Err(RetryError::Cancelled { attempts });
            }
            if let Err(open) = breaker.try_acquire() {
                tracing::debug!(operation_id, retry_in = ?open.retry_in, "Breaker rejected attempt");
                self.finish(ctx, RetryOutcome::Rejected);
                return Err(RetryError::BreakerOpen(open));
            }

            ctx.attempt += 1;
            let attempt = ctx.attempt;
            let result = tokio::select! {
                _ = cancel.cancelled() => None,
                result = operation(attempt) => Some(result),
            };

            let fault = match result {
                None => {
                    // The admitted call never reported back; do not leave a probe hanging.
                    breaker.record_failure();
                    self.finish(ctx, RetryOutcome::Cancelled);
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                Some(Ok(value)) => {
                    breaker.record_success();
                    if attempt > 1 {
                        tracing::info!(operation_id, attempt, "Operation succeeded after retry");
                    }
                    self.finish(ctx, RetryOutcome::Succeeded);
                    return Ok(value);
                }
                Some(Err(fault)) => fault,
            };

            breaker.record_failure();
            let record = Arc::new(self.classifier.classify(
                &fault,
                ErrorContext::new(operation_id)
                    .with_attempt(attempt)
                    .with_detail("policy", policy.name.as_str()),
            ));
            on_error(&record);
            ctx.errors.push(Arc::clone(&record));

            if !policy.should_retry(&record, &ctx) {
                tracing::debug!(operation_id, kind = %record.kind, "Failure is not retryable");
                self.finish(ctx, RetryOutcome::NotRetryable);
                return Err(RetryError::NotRetryable { last: record });
            }
            if attempt >= policy.max_attempts {
                tracing::warn!(operation_id, attempts = attempt, "Retry budget exhausted");
                self.finish(ctx, RetryOutcome::Exhausted);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: record,
                });
            }

            let delay = policy.backoff.delay_for(attempt);
            ctx.delays.push(delay);
            tracing::debug!(operation_id, attempt, ?delay, kind = %record.kind, "Retrying after failure");

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.finish(ctx, RetryOutcome::Cancelled);
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn finish(&self, mut ctx: RetryContext, outcome: RetryOutcome) {
        ctx.finished_at = Some(Instant::now());
        ctx.outcome = Some(outcome);

        {
            let mut stats = lock(&self.stats);
            stats.operations += 1;
            stats.failed_attempts += ctx.errors.len() as u64;
            stats.total_delay += ctx.delays.iter().sum::<Duration>();
            match outcome {
                RetryOutcome::Succeeded => stats.succeeded += 1,
                RetryOutcome::Exhausted => stats.exhausted += 1,
                RetryOutcome::NotRetryable => stats.not_retryable += 1,
                RetryOutcome::Cancelled => stats.cancelled += 1,
                RetryOutcome::Rejected => stats.rejected += 1,
            }
        }

        let mut history = lock(&self.history);
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(ctx);
    }

    pub fn stats(&self) -> RetryStats {
        lock(&self.stats).clone()
    }

    pub fn reset_stats(&self) {
        *lock(&self.stats) = RetryStats::default();
        lock(&self.history).clear();
    }

    /// Most recently finished runs, oldest first.
    pub fn recent_runs(&self) -> Vec<RetryContext> {
        lock(&self.history).iter().cloned().collect()
    }
}
