//! Notifications published by the connection manager.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::classifier::{ErrorKind, ErrorRecord};
use crate::dispatch::DispatchFailure;
use crate::error_log::AbnormalPattern;
use crate::state::ConnectionStatus;
use crate::transport::RawFrame;

/// Subscribers that fall this far behind start missing events.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String },
    StatusChanged { from: ConnectionStatus, to: ConnectionStatus },
    /// Every classified failure, in the order recorded.
    Error(Arc<ErrorRecord>),
    /// Raw inbound frame, before decoding and dispatch.
    MessageReceived(RawFrame),
    ReconnectAttempt { attempt: u32, delay: Duration },
    UnknownMessage { msg_type: String },
    DispatchFailed(DispatchFailure),
    /// Debounced player-facing notice.
    Notice { kind: ErrorKind, message: String },
    /// An abnormal error pattern forced the breaker open and stretched backoff.
    Escalated(AbnormalPattern),
}

pub type EventSender = broadcast::Sender<ConnectionEvent>;

pub fn event_channel() -> EventSender {
    broadcast::channel(EVENT_CAPACITY).0
}
