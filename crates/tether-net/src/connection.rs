//! Connection manager: owns the lifecycle of one logical server connection.
//!
//! [`ConnectionManager`] is a cheap, cloneable handle. It drives the
//! [`Transport`], enforces the status state machine, reconnects with backoff
//! after unexpected closures, probes liveness with heartbeats, buffers
//! outbound messages while offline and routes inbound messages through the
//! [`MessageDispatcher`]. Every failure is classified, logged and published
//! before any recovery action is taken.
//!
//! Background work runs on tokio tasks that only hold weak references, so
//! dropping the last handle tears everything down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tether_config::{Config, ConfigError, ReconnectConfig};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backoff::ReconnectState;
use crate::breaker::{BreakerOpen, BreakerSnapshot, BreakerState, CircuitBreaker};
use crate::classifier::{ErrorClassifier, ErrorContext, ErrorKind, ErrorRecord, Fault};
use crate::dispatch::{MessageDispatcher, MessageHandler, TypeStats};
use crate::error_log::{
    AbnormalPattern, ErrorLog, FaultScope, NoticeThrottle, PatternDetector, PatternThresholds,
};
use crate::events::{ConnectionEvent, EventSender, event_channel};
use crate::heartbeat::{LatencySnapshot, LatencyTracker, ping_message, pong_for, pong_sequence};
use crate::lock;
use crate::message::{CodecError, Message, next_message_id, now_ms};
use crate::queue::{InboundReceiver, InboundSender, MessageQueue, QueueError, inbound_channel};
use crate::retry::{
    DEFAULT_POLICY, PolicyRegistry, RetryError, RetryExecutor, RetryPolicy, RetryStats,
};
use crate::state::{ConnectionStatus, InvalidTransition, StatusWatch};
use crate::stats::{Statistics, StatsRecorder};
use crate::transport::{
    CLOSE_ABNORMAL, CLOSE_NORMAL, RawFrame, SignalReceiver, Transport, TransportOptions,
    TransportSignal,
};

/// Shortest pause while waiting for an open breaker to admit a probe.
const BREAKER_POLL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why [`ConnectionManager::connect`] did not establish a connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    #[error("a connection attempt is already in progress")]
    InFlight,

    #[error(transparent)]
    BreakerOpen(#[from] BreakerOpen),

    #[error("connection failed: {}", .0.technical)]
    Failed(Arc<ErrorRecord>),

    /// A disconnect or shutdown overtook the attempt.
    #[error("connection attempt aborted")]
    Aborted,

    #[error("connection manager has shut down")]
    ShutDown,
}

/// Why [`ConnectionManager::send`] could neither send nor queue a message.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("not connected and message queueing is disabled")]
    NotConnected,

    #[error("outbound queue full ({max} messages)")]
    QueueFull { max: usize },

    #[error(transparent)]
    Encode(#[from] CodecError),

    #[error("send failed: {}", .0.technical)]
    Transport(Arc<ErrorRecord>),
}

/// What happened to a message handed to [`ConnectionManager::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Buffered until the next successful connection.
    Queued,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Marks the single in-flight connection attempt (explicit or reconnect cycle).
struct ConnectGuard(Arc<AtomicBool>);

impl ConnectGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One established link. Stale signals from older sessions are ignored by epoch.
struct Session {
    epoch: u64,
    cancel: CancellationToken,
}

struct ReconnectTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct ReconnectControl {
    enabled: bool,
    state: ReconnectState,
}

struct HeartbeatControl {
    enabled: bool,
    interval: Duration,
    task: Option<CancellationToken>,
}

struct FaultState {
    log: ErrorLog,
    detector: PatternDetector,
    throttle: NoticeThrottle,
    escalated: bool,
}

struct Inner {
    config: Config,
    options: TransportOptions,
    transport: Arc<dyn Transport>,
    status: StatusWatch,
    events: EventSender,
    dispatcher: Arc<MessageDispatcher>,
    classifier: Arc<ErrorClassifier>,
    faults: Mutex<FaultState>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
    policies: Mutex<PolicyRegistry>,
    reconnect: Mutex<ReconnectControl>,
    heartbeat: Mutex<HeartbeatControl>,
    outbound: tokio::sync::Mutex<MessageQueue>,
    latency: Mutex<LatencyTracker>,
    stats: StatsRecorder,
    connecting: Arc<AtomicBool>,
    closing: AtomicBool,
    epoch: AtomicU64,
    session: Mutex<Option<Session>>,
    reconnect_task: Mutex<Option<ReconnectTask>>,
    /// Cancelled and replaced by every disconnect.
    lifecycle: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    inbound_tx: InboundSender,
    inbound_rx: Mutex<Option<InboundReceiver>>,
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// Handle to a managed connection. Clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Validate `config` and build a manager around `transport`.
    ///
    /// Nothing is opened or spawned until [`connect`](Self::connect).
    pub fn initialize(config: Config, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        config.validate()?;

        let events = event_channel();
        let classifier = Arc::new(ErrorClassifier::new(config.errors.verbose));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let (inbound_tx, inbound_rx) = inbound_channel(config.connection.inbound_buffer);
        let shutdown = CancellationToken::new();

        let inner = Inner {
            options: TransportOptions::from_config(&config.connection),
            transport,
            status: StatusWatch::new(),
            dispatcher: Arc::new(MessageDispatcher::new(events.clone())),
            events,
            retry: RetryExecutor::new(Arc::clone(&classifier), config.breaker.clone()),
            classifier,
            faults: Mutex::new(FaultState {
                log: ErrorLog::new(config.errors.log_capacity),
                detector: PatternDetector::new(PatternThresholds::from(&config.errors)),
                throttle: NoticeThrottle::new(config.errors.notification_cooldown()),
                escalated: false,
            }),
            breaker,
            policies: Mutex::new(PolicyRegistry::with_defaults()),
            reconnect: Mutex::new(ReconnectControl {
                enabled: config.reconnect.enabled,
                state: ReconnectState::from_config(&config.reconnect),
            }),
            heartbeat: Mutex::new(HeartbeatControl {
                enabled: config.heartbeat.enabled,
                interval: config.heartbeat.interval(),
                task: None,
            }),
            outbound: tokio::sync::Mutex::new(MessageQueue::new(
                config.queue.max_size,
                config.queue.enabled,
            )),
            latency: Mutex::new(LatencyTracker::default()),
            stats: StatsRecorder::default(),
            connecting: Arc::new(AtomicBool::new(false)),
            closing: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            session: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            lifecycle: Mutex::new(shutdown.child_token()),
            shutdown,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    // --- Lifecycle ---

    /// Connect to the configured server.
    ///
    /// Returns immediately if already connected. A recoverable failure hands
    /// off to the reconnection cycle when auto-reconnect is enabled; the
    /// error is still returned to the caller.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(ConnectError::ShutDown);
        }
        if inner.status.current() == ConnectionStatus::Connected {
            return Ok(());
        }
        let guard = ConnectGuard::acquire(&inner.connecting).ok_or(ConnectError::InFlight)?;
        inner.breaker.try_acquire()?;

        inner.closing.store(false, Ordering::SeqCst);
        lock(&inner.reconnect).state.reset();

        match inner.attempt_connect(None).await {
            Ok(()) => Ok(()),
            Err(ConnectError::Failed(record)) => {
                if record.recoverable && inner.auto_reconnect_enabled() {
                    inner.spawn_reconnect(guard);
                }
                Err(ConnectError::Failed(record))
            }
            Err(e) => {
                inner.release_probe();
                Err(e)
            }
        }
    }

    /// Close the connection and stay disconnected.
    ///
    /// Idempotent. Cancels any pending reconnection, backoff sleep or
    /// heartbeat, and the resulting closure never triggers a reconnect.
    pub async fn disconnect(&self, reason: &str) {
        let inner = &self.inner;
        inner.closing.store(true, Ordering::SeqCst);
        let stale = std::mem::replace(&mut *lock(&inner.lifecycle), inner.shutdown.child_token());
        stale.cancel();

        inner.cancel_reconnect().await;
        let session = lock(&inner.session).take();
        if let Some(session) = session {
            session.cancel.cancel();
        }
        lock(&inner.latency).clear_pending();

        // Already disconnected, or another disconnect is finishing the job.
        if inner.transition(ConnectionStatus::Closing).is_err() {
            return;
        }
        inner.transport.close(CLOSE_NORMAL, reason).await;
        let _ = inner.transition(ConnectionStatus::Disconnected);
        inner.stats.record_disconnected();

        tracing::info!(reason, "Disconnected");
        inner.emit(ConnectionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Drop the current link and start a fresh reconnection cycle.
    pub async fn reconnect(&self) -> Result<(), ConnectError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(ConnectError::ShutDown);
        }
        let status = inner.status.current();
        if status == ConnectionStatus::Disconnected {
            return self.connect().await;
        }
        let guard = ConnectGuard::acquire(&inner.connecting).ok_or(ConnectError::InFlight)?;
        inner.closing.store(false, Ordering::SeqCst);
        lock(&inner.reconnect).state.reset();

        match status {
            ConnectionStatus::Connected => {
                let session = lock(&inner.session).take();
                if let Some(session) = session {
                    session.cancel.cancel();
                }
                inner
                    .transition_from(&[ConnectionStatus::Connected], ConnectionStatus::Reconnecting)
                    .map_err(|_| ConnectError::Aborted)?;
                inner.transport.close(CLOSE_NORMAL, "reconnect requested").await;
                lock(&inner.latency).clear_pending();
                inner.stats.record_disconnected();
                inner.emit(ConnectionEvent::Disconnected {
                    reason: "reconnect requested".to_string(),
                });
            }
            ConnectionStatus::Error => {}
            _ => return Err(ConnectError::Aborted),
        }

        tracing::info!(from = %status, "Reconnection requested");
        inner.spawn_reconnect(guard);
        Ok(())
    }

    /// Disconnect and stop every background task. The manager cannot be
    /// reconnected afterwards.
    pub async fn shutdown(&self) {
        self.disconnect("shutdown").await;
        self.inner.shutdown.cancel();
    }

    // --- Messaging ---

    /// Send a message, or buffer it while not connected.
    ///
    /// Messages still queued from an earlier outage are transmitted first.
    pub async fn send(&self, mut message: Message) -> Result<SendOutcome, SendError> {
        let inner = &self.inner;
        if message.id.is_none() {
            message.id = Some(next_message_id());
        }
        if message.timestamp.is_none() {
            message.timestamp = Some(now_ms());
        }

        let mut queue = inner.outbound.lock().await;
        if inner.status.current() == ConnectionStatus::Connected {
            let text = message.encode()?;
            let result = match inner.drain(&mut queue).await {
                Ok(_) => inner.write_text(text).await.map_err(|fault| {
                    inner.record_error(
                        &fault,
                        ErrorContext::new("send").with_detail("type", message.msg_type.as_str()),
                    )
                }),
                Err(record) => Err(record),
            };
            let record = match result {
                Ok(()) => return Ok(SendOutcome::Sent),
                Err(record) => record,
            };
            return match queue.enqueue(message) {
                Ok(_) => {
                    inner.stats.record_queued();
                    Ok(SendOutcome::Queued)
                }
                Err(_) => {
                    inner.stats.record_dropped(1);
                    Err(SendError::Transport(record))
                }
            };
        }

        match queue.enqueue(message) {
            Ok(len) => {
                tracing::debug!(queued = len, "Message queued while offline");
                inner.stats.record_queued();
                Ok(SendOutcome::Queued)
            }
            Err(QueueError::Disabled) => {
                inner.stats.record_dropped(1);
                Err(SendError::NotConnected)
            }
            Err(QueueError::Full { max }) => {
                tracing::warn!(max, "Outbound queue full, dropping message");
                inner.stats.record_dropped(1);
                Err(SendError::QueueFull { max })
            }
        }
    }

    /// Buffer messages while offline, holding at most `max_size`. Anything
    /// already queued beyond the new bound is dropped, newest first.
    pub async fn enable_message_queue(&self, max_size: usize) {
        self.inner.outbound.lock().await.enable(max_size);
    }

    /// Stop buffering and discard what is queued. Returns the number discarded.
    pub async fn disable_message_queue(&self) -> usize {
        let dropped = self.inner.outbound.lock().await.disable();
        self.inner.stats.record_dropped(dropped as u64);
        dropped
    }

    /// Discard queued messages but keep queueing enabled. Returns the number discarded.
    pub async fn clear_message_queue(&self) -> usize {
        let dropped = self.inner.outbound.lock().await.clear();
        self.inner.stats.record_dropped(dropped as u64);
        dropped
    }

    /// Messages waiting for the next successful connection.
    pub async fn queued_message_count(&self) -> usize {
        self.inner.outbound.lock().await.len()
    }

    // --- Handlers ---

    /// Route inbound messages of `msg_type` to `handler`. Returns `true` if
    /// an earlier handler was replaced.
    pub fn register_handler<H: MessageHandler + 'static>(
        &self,
        msg_type: impl Into<String>,
        handler: H,
    ) -> bool {
        self.inner.dispatcher.register_handler(msg_type, handler)
    }

    /// Returns `true` if a handler was registered for `msg_type`.
    pub fn unregister_handler(&self, msg_type: &str) -> bool {
        self.inner.dispatcher.unregister_handler(msg_type)
    }

    pub fn clear_handlers(&self) {
        self.inner.dispatcher.clear_handlers();
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.inner.dispatcher
    }

    /// Dispatch counters for one message type.
    pub fn dispatch_stats(&self, msg_type: &str) -> Option<TypeStats> {
        self.inner.dispatcher.type_stats(msg_type)
    }

    // --- Heartbeat ---

    /// Probe liveness every `interval` while connected. A zero interval stops
    /// the heartbeat.
    pub fn start_heartbeat(&self, interval: Duration) {
        if interval.is_zero() {
            tracing::warn!("Zero heartbeat interval, stopping heartbeat");
            self.stop_heartbeat();
            return;
        }
        {
            let mut heartbeat = lock(&self.inner.heartbeat);
            heartbeat.enabled = true;
            heartbeat.interval = interval;
        }
        self.inner.resume_heartbeat();
    }

    /// Stop probing. Takes effect immediately, even mid-interval.
    pub fn stop_heartbeat(&self) {
        let mut heartbeat = lock(&self.inner.heartbeat);
        heartbeat.enabled = false;
        if let Some(task) = heartbeat.task.take() {
            task.cancel();
        }
    }

    /// Send one ping and wait for its pong. `None` if not connected or the
    /// reply did not arrive within the message timeout.
    pub async fn ping(&self) -> Option<Duration> {
        if self.inner.status.current() != ConnectionStatus::Connected {
            return None;
        }
        match self.inner.probe().await {
            Ok(rtt) => Some(rtt),
            Err(fault) => {
                tracing::debug!(%fault, "Ping failed");
                None
            }
        }
    }

    /// Round-trip times measured by pings and heartbeats.
    pub fn latency(&self) -> LatencySnapshot {
        lock(&self.inner.latency).snapshot()
    }

    // --- Reconnection ---

    /// Reconnect automatically after recoverable failures, using `config`
    /// for the backoff schedule and attempt cap.
    pub fn enable_auto_reconnect(&self, config: ReconnectConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let mut control = lock(&self.inner.reconnect);
        control.enabled = true;
        control.state = ReconnectState::from_config(&config);
        Ok(())
    }

    /// Turn automatic reconnection off. A running cycle is cancelled and the
    /// connection rests in the error state.
    pub fn disable_auto_reconnect(&self) {
        lock(&self.inner.reconnect).enabled = false;
        let task = lock(&self.inner.reconnect_task).take();
        if let Some(task) = task {
            task.cancel.cancel();
        }
        let _ = self
            .inner
            .transition_from(&[ConnectionStatus::Reconnecting], ConnectionStatus::Error);
    }

    pub fn auto_reconnect_enabled(&self) -> bool {
        self.inner.auto_reconnect_enabled()
    }

    /// Attempts used in the current reconnection cycle.
    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.inner.reconnect).state.attempts()
    }

    // --- Retry ---

    /// Run `operation` under the named retry policy (unknown names fall back
    /// to the default policy). Failures are logged and published like
    /// connection errors, and a disconnect cancels the run.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation_id: &str,
        policy: &str,
        operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        let policy = lock(&self.inner.policies).get_or_default(policy);
        self.run_with_policy(operation_id, &policy, operation).await
    }

    /// Run `operation` under the policy mapped to the kind of error it is
    /// expected to hit, e.g. [`ErrorKind::AuthenticationFailed`] for a login.
    pub async fn execute_for_kind<T, F, Fut>(
        &self,
        operation_id: &str,
        kind: ErrorKind,
        operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        let policy = {
            let policies = lock(&self.inner.policies);
            policies
                .for_kind(kind)
                .cloned()
                .unwrap_or_else(|| policies.get_or_default(DEFAULT_POLICY))
        };
        self.run_with_policy(operation_id, &policy, operation).await
    }

    async fn run_with_policy<T, F, Fut>(
        &self,
        operation_id: &str,
        policy: &RetryPolicy,
        operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        let inner = &self.inner;
        let cancel = inner.lifecycle_token();
        inner
            .retry
            .execute_observed(operation_id, policy, &cancel, operation, |record| {
                inner.note_error(Arc::clone(record), FaultScope::Operation);
            })
            .await
    }

    /// Add or replace a named retry policy.
    pub fn register_policy(&self, policy: RetryPolicy) {
        lock(&self.inner.policies).register(policy);
    }

    /// Outcome counters for retried operations.
    pub fn retry_stats(&self) -> RetryStats {
        self.inner.retry.stats()
    }

    // --- Observation ---

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.current()
    }

    /// Receiver that observes every status change.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Subscribe to connection events. Slow receivers lag rather than block.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn statistics(&self) -> Statistics {
        self.inner.stats.snapshot()
    }

    /// Zero connection, dispatch, retry and latency counters.
    pub fn reset_statistics(&self) {
        self.inner.stats.reset();
        self.inner.dispatcher.reset_stats();
        self.inner.retry.reset_stats();
        lock(&self.inner.latency).reset();
    }

    /// The last `n` recorded errors, oldest first.
    pub fn recent_errors(&self, n: usize) -> Vec<Arc<ErrorRecord>> {
        lock(&self.inner.faults).log.recent(n)
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.inner.breaker.state()
    }

    /// State and recent outcomes of the connection breaker.
    pub fn breaker(&self) -> BreakerSnapshot {
        self.inner.breaker.snapshot()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn announce(&self, from: ConnectionStatus, to: ConnectionStatus) {
        tracing::debug!(%from, %to, "Status changed");
        self.emit(ConnectionEvent::StatusChanged { from, to });
    }

    fn transition(&self, to: ConnectionStatus) -> Result<ConnectionStatus, InvalidTransition> {
        self.status.transition(to, |from, to| self.announce(from, to))
    }

    fn transition_from(
        &self,
        expected: &[ConnectionStatus],
        to: ConnectionStatus,
    ) -> Result<ConnectionStatus, InvalidTransition> {
        self.status
            .transition_from(expected, to, |from, to| self.announce(from, to))
    }

    fn lifecycle_token(&self) -> CancellationToken {
        lock(&self.lifecycle).clone()
    }

    fn auto_reconnect_enabled(&self) -> bool {
        lock(&self.reconnect).enabled
    }

    // --- Errors ---

    fn record_error(&self, fault: &Fault, context: ErrorContext) -> Arc<ErrorRecord> {
        let record = Arc::new(self.classifier.classify(fault, context));
        self.note_error(Arc::clone(&record), FaultScope::Connection);
        record
    }

    /// Log, publish and pattern-check one classified error.
    fn note_error(&self, record: Arc<ErrorRecord>, scope: FaultScope) {
        self.stats.record_error();
        let now = Instant::now();
        let (notify, escalation) = {
            let mut faults = lock(&self.faults);
            faults.log.push(Arc::clone(&record));
            let pattern = faults.detector.observe_in(scope, &record, now);
            let notify = faults.throttle.should_notify(record.kind, now);
            let escalation = match pattern {
                Some(pattern) if !faults.escalated => {
                    faults.escalated = true;
                    Some(pattern)
                }
                _ => None,
            };
            (notify, escalation)
        };

        tracing::warn!(
            kind = %record.kind,
            severity = ?record.severity,
            operation = %record.context.operation,
            recoverable = record.recoverable,
            "{}",
            record.technical
        );
        self.emit(ConnectionEvent::Error(Arc::clone(&record)));
        if notify {
            self.emit(ConnectionEvent::Notice {
                kind: record.kind,
                message: record.message.clone(),
            });
        }
        if let Some(pattern) = escalation {
            self.escalate(pattern);
        }
    }

    /// The link carried traffic, so any run of link failures is over.
    fn note_link_healthy(&self) {
        lock(&self.faults).detector.record_success();
    }

    /// Force the breaker open and stretch reconnection delays until the next
    /// successful connection.
    fn escalate(&self, pattern: AbnormalPattern) {
        tracing::warn!(%pattern, "Abnormal error pattern, escalating");
        self.breaker.force_open();
        let errors = &self.config.errors;
        lock(&self.reconnect)
            .state
            .escalate(errors.escalation_backoff_factor, errors.escalated_max_delay());
        self.emit(ConnectionEvent::Escalated(pattern));
    }

    /// Settle a half-open probe admitted for an attempt that never ran to completion.
    fn release_probe(&self) {
        if self.breaker.state() == BreakerState::HalfOpen {
            self.breaker.record_failure();
        }
    }

    // --- Connecting ---

    /// One connection attempt. The caller holds the connect guard and has
    /// been admitted by the breaker.
    async fn attempt_connect(self: &Arc<Self>, reconnect_attempt: Option<u32>) -> Result<(), ConnectError> {
        let cancel = self.lifecycle_token();
        if cancel.is_cancelled() || self.transition(ConnectionStatus::Connecting).is_err() {
            return Err(ConnectError::Aborted);
        }
        self.ensure_processor();
        self.stats.record_connect_attempt();

        let url = self.config.connection.server_url.as_str();
        let limit = self.options.connect_timeout;
        tracing::info!(url, attempt = ?reconnect_attempt, "Connecting");

        let opened = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectError::Aborted),
            opened = tokio::time::timeout(limit, self.open_link()) => opened,
        };
        let fault = match opened {
            Ok(Ok(signals)) => return self.on_link_up(signals, reconnect_attempt.is_some()).await,
            Ok(Err(fault)) => fault,
            Err(_) => Fault::Timeout {
                operation: "connect",
                after: limit,
            },
        };

        let mut context = ErrorContext::new("connect").with_detail("url", url);
        if let Some(attempt) = reconnect_attempt {
            context = context.with_attempt(attempt);
        }
        let record = self.record_error(&fault, context);
        self.breaker.record_failure();
        self.transport.close(CLOSE_ABNORMAL, "connect failed").await;
        let _ = self.transition(ConnectionStatus::Error);
        Err(ConnectError::Failed(record))
    }

    /// Open the transport and wait for it to report the link usable.
    async fn open_link(&self) -> Result<SignalReceiver, Fault> {
        let mut signals = self
            .transport
            .open(&self.config.connection.server_url, &self.options)
            .await?;
        loop {
            match signals.recv().await {
                Some(TransportSignal::Opened) => return Ok(signals),
                Some(TransportSignal::Error(fault)) => return Err(fault),
                Some(TransportSignal::Closed { code, reason }) => {
                    return Err(Fault::Closed { code, reason });
                }
                Some(TransportSignal::Frame(frame)) => {
                    tracing::debug!(len = frame.len(), "Discarding frame received before open");
                }
                None => {
                    return Err(Fault::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: "transport closed while opening".to_string(),
                    });
                }
            }
        }
    }

    async fn on_link_up(
        self: &Arc<Self>,
        signals: SignalReceiver,
        after_reconnect: bool,
    ) -> Result<(), ConnectError> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let session = self.shutdown.child_token();
        *lock(&self.session) = Some(Session {
            epoch,
            cancel: session.clone(),
        });

        if self.transition(ConnectionStatus::Connected).is_err() {
            // A disconnect got in between open and now.
            if let Some(stale) = self.end_session(epoch) {
                stale.cancel.cancel();
            }
            self.transport.close(CLOSE_NORMAL, "connection aborted").await;
            self.release_probe();
            return Err(ConnectError::Aborted);
        }

        self.breaker.record_success();
        {
            let mut faults = lock(&self.faults);
            faults.detector.record_success();
            faults.escalated = false;
        }
        lock(&self.reconnect).state.reset();
        self.stats.record_connected(after_reconnect);

        tracing::info!(epoch, after_reconnect, "Connected");
        self.emit(ConnectionEvent::Connected);

        self.flush_outbound().await;
        self.resume_heartbeat();
        self.spawn_pump(epoch, signals, session);
        Ok(())
    }

    /// Take the session if it is still the one identified by `epoch`.
    fn end_session(&self, epoch: u64) -> Option<Session> {
        let mut session = lock(&self.session);
        match session.as_ref() {
            Some(current) if current.epoch == epoch => session.take(),
            _ => None,
        }
    }

    /// Tear down after the link died underneath us.
    async fn connection_lost(self: &Arc<Self>, epoch: u64, fault: Fault) {
        let Some(session) = self.end_session(epoch) else {
            return;
        };
        session.cancel.cancel();
        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        let record = self.record_error(&fault, ErrorContext::new("connection"));
        self.breaker.record_failure();
        self.transport.close(CLOSE_ABNORMAL, "connection lost").await;
        lock(&self.latency).clear_pending();
        self.stats.record_disconnected();

        tracing::warn!(kind = %record.kind, epoch, "Connection lost");
        self.emit(ConnectionEvent::Disconnected {
            reason: record.technical.clone(),
        });

        if record.recoverable && self.auto_reconnect_enabled() {
            if let Some(guard) = ConnectGuard::acquire(&self.connecting) {
                if self
                    .transition_from(&[ConnectionStatus::Connected], ConnectionStatus::Reconnecting)
                    .is_ok()
                {
                    self.spawn_reconnect(guard);
                }
                return;
            }
            tracing::debug!("Another connection attempt is in flight");
        }
        let _ = self.transition_from(&[ConnectionStatus::Connected], ConnectionStatus::Error);
    }

    // --- Reconnection ---

    fn spawn_reconnect(self: &Arc<Self>, guard: ConnectGuard) {
        let mut slot = lock(&self.reconnect_task);
        if self.closing.load(Ordering::SeqCst) || self.shutdown.is_cancelled() {
            return;
        }
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(reconnect_loop(Arc::downgrade(self), cancel.clone(), guard));
        if let Some(old) = slot.replace(ReconnectTask { cancel, handle }) {
            old.cancel.cancel();
        }
    }

    async fn cancel_reconnect(&self) {
        let task = lock(&self.reconnect_task).take();
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
    }

    // --- Outbound ---

    async fn write_text(&self, text: String) -> Result<(), Fault> {
        let len = text.len();
        self.transport.send_text(text).await?;
        self.stats.record_sent(len);
        self.note_link_healthy();
        Ok(())
    }

    /// Send everything queued, oldest first. Stops at the first transport
    /// failure, leaving that message at the head.
    async fn drain(&self, queue: &mut MessageQueue) -> Result<usize, Arc<ErrorRecord>> {
        let mut sent = 0;
        while let Some(message) = queue.pop_front() {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, msg_type = %message.msg_type, "Dropping unencodable message");
                    self.stats.record_dropped(1);
                    continue;
                }
            };
            if let Err(fault) = self.write_text(text).await {
                queue.requeue_front(message);
                return Err(self.record_error(&fault, ErrorContext::new("flush")));
            }
            sent += 1;
        }
        if sent > 0 {
            tracing::debug!(sent, "Flushed queued messages");
        }
        Ok(sent)
    }

    async fn flush_outbound(&self) {
        let mut queue = self.outbound.lock().await;
        if let Err(record) = self.drain(&mut queue).await {
            tracing::debug!(remaining = queue.len(), kind = %record.kind, "Queue flush interrupted");
        }
    }

    // --- Heartbeat ---

    /// (Re)start the heartbeat task for the current session if enabled.
    fn resume_heartbeat(self: &Arc<Self>) {
        let mut heartbeat = lock(&self.heartbeat);
        if let Some(task) = heartbeat.task.take() {
            task.cancel();
        }
        if !heartbeat.enabled {
            return;
        }
        let session = lock(&self.session);
        let Some(session) = session.as_ref() else {
            return;
        };
        let cancel = session.cancel.child_token();
        tokio::spawn(heartbeat_loop(
            Arc::downgrade(self),
            session.epoch,
            heartbeat.interval,
            cancel.clone(),
        ));
        heartbeat.task = Some(cancel);
    }

    /// Send a ping and wait up to the message timeout for its pong.
    async fn probe(&self) -> Result<Duration, Fault> {
        let (tx, rx) = oneshot::channel();
        let seq = lock(&self.latency).on_ping_sent(Some(tx));
        let ping = ping_message(&self.config.heartbeat.ping_type, seq);
        let sent = match ping.encode() {
            Ok(text) => self.write_text(text).await,
            Err(e) => Err(Fault::Protocol(e.to_string())),
        };
        if let Err(fault) = sent {
            lock(&self.latency).on_ping_lost(seq);
            return Err(fault);
        }

        let limit = self.config.connection.message_timeout();
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(rtt)) => Ok(rtt),
            Ok(Err(_)) => Err(Fault::Closed {
                code: CLOSE_NORMAL,
                reason: "ping abandoned".to_string(),
            }),
            Err(_) => {
                lock(&self.latency).on_ping_lost(seq);
                Err(Fault::Timeout {
                    operation: "heartbeat",
                    after: limit,
                })
            }
        }
    }

    // --- Inbound ---

    fn spawn_pump(self: &Arc<Self>, epoch: u64, signals: SignalReceiver, cancel: CancellationToken) {
        tokio::spawn(pump_signals(
            Arc::downgrade(self),
            epoch,
            signals,
            cancel,
            self.inbound_tx.clone(),
        ));
    }

    /// Start the inbound processing task on first use.
    fn ensure_processor(self: &Arc<Self>) {
        let Some(rx) = lock(&self.inbound_rx).take() else {
            return;
        };
        tokio::spawn(process_inbound(Arc::downgrade(self), rx, self.shutdown.clone()));
    }

    async fn process_frame(&self, frame: RawFrame) {
        self.stats.record_received(frame.len());
        self.emit(ConnectionEvent::MessageReceived(frame.clone()));

        let decoded = match &frame {
            RawFrame::Text(text) => Message::decode(text),
            RawFrame::Binary(bytes) => Message::decode_bytes(bytes),
        };
        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                self.record_error(&Fault::Protocol(e.to_string()), ErrorContext::new("decode"));
                return;
            }
        };

        let heartbeat = &self.config.heartbeat;
        if message.msg_type == heartbeat.pong_type {
            let rtt = pong_sequence(&message).and_then(|seq| lock(&self.latency).on_pong_received(seq));
            match rtt {
                Some(rtt) => {
                    tracing::trace!(?rtt, "Pong received");
                    self.stats.record_latency(rtt);
                    self.note_link_healthy();
                }
                None => tracing::debug!("Ignoring pong for an unknown ping"),
            }
            return;
        }
        if message.msg_type == heartbeat.ping_type {
            let pong = pong_for(&heartbeat.pong_type, &message);
            let sent = match pong.encode() {
                Ok(text) => self.write_text(text).await,
                Err(e) => Err(Fault::Protocol(e.to_string())),
            };
            if let Err(fault) = sent {
                tracing::debug!(%fault, "Failed to answer server ping");
            }
            return;
        }

        self.dispatcher.dispatch(message);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn reconnect_loop(weak: Weak<Inner>, cancel: CancellationToken, _guard: ConnectGuard) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let (next, attempt) = {
            let mut control = lock(&inner.reconnect);
            let next = control.state.next_delay();
            (next, control.state.attempts())
        };
        let Some(delay) = next else {
            tracing::warn!(attempts = attempt, "Reconnection attempts exhausted");
            let _ = inner.transition_from(&[ConnectionStatus::Reconnecting], ConnectionStatus::Error);
            return;
        };
        if inner.status.current() != ConnectionStatus::Reconnecting
            && inner.transition(ConnectionStatus::Reconnecting).is_err()
        {
            return;
        }
        tracing::info!(attempt, ?delay, "Scheduling reconnection attempt");
        inner.emit(ConnectionEvent::ReconnectAttempt { attempt, delay });
        drop(inner);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        // Waiting out an open breaker does not use up an attempt.
        let inner = loop {
            if cancel.is_cancelled() {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let wait = match inner.breaker.try_acquire() {
                Ok(()) => break inner,
                Err(open) => open.retry_in.max(BREAKER_POLL),
            };
            tracing::debug!(?wait, "Breaker open, holding reconnection");
            drop(inner);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        };

        match inner.attempt_connect(Some(attempt)).await {
            Ok(()) => return,
            Err(ConnectError::Failed(record)) if !record.recoverable => {
                tracing::warn!(kind = %record.kind, "Unrecoverable failure, stopping reconnection");
                return;
            }
            Err(ConnectError::Failed(_)) => {}
            Err(_) => {
                inner.release_probe();
                return;
            }
        }
    }
}

async fn heartbeat_loop(weak: Weak<Inner>, epoch: u64, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let timeout = inner.config.connection.message_timeout();
        let expired = lock(&inner.latency).expire_pending(timeout);
        if expired > 0 {
            tracing::debug!(expired, "Expired stale pings");
        }

        let probe = tokio::select! {
            _ = cancel.cancelled() => return,
            probe = inner.probe() => probe,
        };
        match probe {
            Ok(rtt) => tracing::trace!(?rtt, "Heartbeat ok"),
            Err(fault) => {
                tracing::warn!(%fault, "Heartbeat failed");
                inner.connection_lost(epoch, fault).await;
                return;
            }
        }
    }
}

/// Forward transport signals for one session until it closes or is cancelled.
async fn pump_signals(
    weak: Weak<Inner>,
    epoch: u64,
    mut signals: SignalReceiver,
    cancel: CancellationToken,
    inbound: InboundSender,
) {
    let fault = loop {
        let signal = tokio::select! {
            _ = cancel.cancelled() => return,
            signal = signals.recv() => signal,
        };
        match signal {
            Some(TransportSignal::Frame(frame)) => {
                if inbound.send(frame).await.is_err() {
                    return;
                }
            }
            Some(TransportSignal::Opened) => {}
            Some(TransportSignal::Error(fault)) => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.record_error(&fault, ErrorContext::new("transport"));
            }
            Some(TransportSignal::Closed { code, reason }) => break Fault::Closed { code, reason },
            None => {
                break Fault::Closed {
                    code: CLOSE_ABNORMAL,
                    reason: "transport stream ended".to_string(),
                };
            }
        }
    };

    if let Some(inner) = weak.upgrade() {
        inner.connection_lost(epoch, fault).await;
    }
}

/// Decode and dispatch inbound frames off the reception path.
async fn process_inbound(weak: Weak<Inner>, mut rx: InboundReceiver, shutdown: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.process_frame(frame).await;
    }
    tracing::debug!("Inbound processor exiting");
}
