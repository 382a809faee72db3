//! Connection lifecycle status and its legal transitions.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting
//!                     |             |             |
//!                     +--> Error <--+-------------+
//! any active state -> Closing -> Disconnected
//! ```
//!
//! Status changes are published through a [`watch`] channel so any number of
//! consumers can react without polling.

use std::fmt;
use std::sync::Mutex;

use tokio::sync::watch;

use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Closing,
}

impl ConnectionStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected | Error | Closing)
                | (Connected, Reconnecting | Error | Closing)
                | (Reconnecting, Connecting | Error | Closing)
                | (Error, Connecting | Reconnecting | Closing)
                | (Closing, Disconnected)
        )
    }

    /// Connecting, connected or trying to get back there.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Connected | ConnectionStatus::Reconnecting
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
}

/// Single owner of the current status.
///
/// Transitions are validated and applied under one lock, and the
/// `on_change` hook runs under that same lock, so observers see changes in
/// the order they were made.
pub struct StatusWatch {
    current: Mutex<ConnectionStatus>,
    tx: watch::Sender<ConnectionStatus>,
}

impl Default for StatusWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusWatch {
    /// Create a watch initialized to [`ConnectionStatus::Disconnected`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            current: Mutex::new(ConnectionStatus::Disconnected),
            tx,
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        *lock(&self.current)
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }

    /// Move to `to` if legal. Returns the previous status.
    pub fn transition<F>(&self, to: ConnectionStatus, on_change: F) -> Result<ConnectionStatus, InvalidTransition>
    where
        F: FnOnce(ConnectionStatus, ConnectionStatus),
    {
        let mut current = lock(&self.current);
        let from = *current;
        if !from.can_transition_to(to) {
            return Err(InvalidTransition { from, to });
        }
        *current = to;
        self.tx.send_replace(to);
        on_change(from, to);
        Ok(from)
    }

    /// Like [`transition`](Self::transition), but only when the current
    /// status is one of `expected`.
    pub fn transition_from<F>(
        &self,
        expected: &[ConnectionStatus],
        to: ConnectionStatus,
        on_change: F,
    ) -> Result<ConnectionStatus, InvalidTransition>
    where
        F: FnOnce(ConnectionStatus, ConnectionStatus),
    {
        let mut current = lock(&self.current);
        let from = *current;
        if !expected.contains(&from) || !from.can_transition_to(to) {
            return Err(InvalidTransition { from, to });
        }
        *current = to;
        self.tx.send_replace(to);
        on_change(from, to);
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    const ALL: [ConnectionStatus; 6] = [Disconnected, Connecting, Connected, Reconnecting, Error, Closing];

    #[test]
    fn test_status_starts_disconnected() {
        assert_eq!(StatusWatch::new().current(), Disconnected);
    }

    #[test]
    fn test_no_self_transitions() {
        for status in ALL {
            assert!(!status.can_transition_to(status), "{status} -> {status}");
        }
    }

    #[test]
    fn test_disconnect_always_goes_through_closing() {
        for status in ALL {
            if status != Closing {
                assert!(!status.can_transition_to(Disconnected), "{status} -> disconnected");
            }
        }
        for status in [Connecting, Connected, Reconnecting, Error] {
            assert!(status.can_transition_to(Closing));
        }
    }

    #[test]
    fn test_connected_only_from_connecting() {
        for status in ALL {
            assert_eq!(status.can_transition_to(Connected), status == Connecting);
        }
    }

    #[test]
    fn test_illegal_transition_leaves_status_unchanged() {
        let watch = StatusWatch::new();
        let err = watch.transition(Connected, |_, _| panic!("must not fire")).unwrap_err();
        assert_eq!(err, InvalidTransition { from: Disconnected, to: Connected });
        assert_eq!(watch.current(), Disconnected);
    }

    #[test]
    fn test_transition_from_checks_expected() {
        let watch = StatusWatch::new();
        watch.transition(Connecting, |_, _| {}).unwrap();
        assert!(watch.transition_from(&[Connected], Error, |_, _| {}).is_err());
        assert_eq!(watch.transition_from(&[Connecting], Error, |_, _| {}), Ok(Connecting));
    }

    #[tokio::test]
    async fn test_subscriber_receives_updates() {
        let watch = StatusWatch::new();
        let mut rx = watch.subscribe();
        let mut seen = Vec::new();

        watch.transition(Connecting, |from, to| seen.push((from, to))).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Connecting);
        assert_eq!(seen, vec![(Disconnected, Connecting)]);
    }
}
