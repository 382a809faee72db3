//! Resilient client connection engine: lifecycle state machine, fault
//! classification, retry and reconnection backoff, circuit breaking,
//! heartbeat latency tracking, message queueing and type-routed dispatch.

pub mod backoff;
pub mod breaker;
pub mod classifier;
pub mod connection;
pub mod dispatch;
pub mod error_log;
pub mod events;
pub mod framing;
pub mod heartbeat;
pub mod memory_transport;
pub mod message;
pub mod queue;
pub mod retry;
pub mod socket;
pub mod state;
pub mod stats;
pub mod tcp_transport;
pub mod transport;

pub use backoff::{BackoffPolicy, ReconnectState};
pub use breaker::{BreakerOpen, BreakerState, CircuitBreaker};
pub use classifier::{ErrorClassifier, ErrorContext, ErrorKind, ErrorRecord, Fault, Severity};
pub use connection::{ConnectError, ConnectionManager, SendError, SendOutcome};
pub use dispatch::{HandlerResult, MessageDispatcher, MessageHandler, TypeStats};
pub use events::ConnectionEvent;
pub use message::{Message, Priority};
pub use retry::{PolicyRegistry, RetryError, RetryExecutor, RetryPolicy};
pub use state::ConnectionStatus;
pub use stats::Statistics;
pub use tcp_transport::TcpTransport;
pub use transport::{RawFrame, Transport, TransportOptions, TransportSignal};

/// Lock a std mutex, recovering the data if a panicking thread poisoned it.
///
/// Every guarded section in this crate is a short, non-panicking update, so a
/// poisoned lock still holds consistent data.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
