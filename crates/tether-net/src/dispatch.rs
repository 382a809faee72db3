//! Message dispatch: route decoded messages to type-specific handlers.
//!
//! The [`MessageDispatcher`] maps message `type` strings to
//! [`MessageHandler`] implementations. Each message is validated, normalized
//! (missing id, timestamp and action filled in) and handed to at most one
//! handler. A handler that errors or panics is recorded and reported without
//! affecting later messages.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::events::{ConnectionEvent, EventSender};
use crate::lock;
use crate::message::{Message, next_message_id, now_ms};

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Error a handler reports for a message it could not process.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
/// Outcome of one handler invocation.
pub type HandlerResult = Result<(), HandlerError>;

/// Stats key for messages rejected before routing.
pub const INVALID_TYPE_KEY: &str = "<invalid>";

const FAILURE_LOG_CAPACITY: usize = 50;

/// Action filled in for well-known message types that arrive without one.
const DEFAULT_ACTIONS: &[(&str, &str)] = &[
    ("chat", "receive"),
    ("game_state", "sync"),
    ("match_found", "join"),
    ("player_joined", "add"),
    ("player_left", "remove"),
    ("error", "report"),
];

/// Default `action` for `msg_type`, if it is a well-known type.
pub fn default_action(msg_type: &str) -> Option<&'static str> {
    DEFAULT_ACTIONS
        .iter()
        .find(|(t, _)| *t == msg_type)
        .map(|(_, action)| *action)
}

/// Trait for message handlers.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, msg: &Message) -> HandlerResult;
}

/// Blanket implementation for closures.
impl<F> MessageHandler for F
where
    F: Fn(&Message) -> HandlerResult + Send + Sync,
{
    fn handle(&self, msg: &Message) -> HandlerResult {
        self(msg)
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Per-type dispatch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeStats {
    pub received: u64,
    pub handled: u64,
    pub failed: u64,
    pub unhandled: u64,
    pub last_seen_ms: Option<u64>,
}

/// A message that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub msg_type: String,
    pub message_id: Option<String>,
    pub reason: String,
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// MessageDispatcher
// ---------------------------------------------------------------------------

/// Routes incoming messages to registered handlers by type.
///
/// A missing or failing handler never blocks later messages: the failure is
/// counted, logged and published, and dispatch carries on.
pub struct MessageDispatcher {
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    stats: DashMap<String, TypeStats>,
    failures: Mutex<VecDeque<DispatchFailure>>,
    events: EventSender,
}

impl MessageDispatcher {
    /// Empty dispatcher publishing unknown-message and failure events on `events`.
    pub fn new(events: EventSender) -> Self {
        Self {
            handlers: DashMap::new(),
            stats: DashMap::new(),
            failures: Mutex::new(VecDeque::with_capacity(FAILURE_LOG_CAPACITY)),
            events,
        }
    }

    /// Register a handler for a message type, replacing any previous one.
    /// Returns `true` if a handler was replaced.
    pub fn register_handler<H: MessageHandler + 'static>(
        &self,
        msg_type: impl Into<String>,
        handler: H,
    ) -> bool {
        self.handlers
            .insert(msg_type.into(), Arc::new(handler))
            .is_some()
    }

    /// Remove the handler for `msg_type`. Returns `true` if one was registered.
    pub fn unregister_handler(&self, msg_type: &str) -> bool {
        self.handlers.remove(msg_type).is_some()
    }

    /// Remove every handler. Later messages count as unhandled.
    pub fn clear_handlers(&self) {
        self.handlers.clear();
    }

    /// Whether a handler is registered for `msg_type`.
    pub fn has_handler(&self, msg_type: &str) -> bool {
        self.handlers.contains_key(msg_type)
    }

    /// Registered types, sorted (useful for startup logging).
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    /// Route one message. Returns `true` only if a handler ran successfully.
    ///
    /// Missing `id`, `timestamp` and `action` fields are filled in first.
    /// Handler errors and panics are recorded as [`DispatchFailure`]s.
    pub fn dispatch(&self, mut msg: Message) -> bool {
        if msg.msg_type.trim().is_empty() {
            self.bump(INVALID_TYPE_KEY, |s| s.failed += 1);
            self.fail(&msg, "message has no type".to_string());
            return false;
        }

        if msg.id.is_none() {
            msg.id = Some(next_message_id());
        }
        if msg.timestamp.is_none() {
            msg.timestamp = Some(now_ms());
        }
        if msg.action.is_none() {
            msg.action = default_action(&msg.msg_type).map(str::to_string);
        }

        let now = now_ms();
        self.bump(&msg.msg_type, |s| {
            s.received += 1;
            s.last_seen_ms = Some(now);
        });

        // Clone the handler out so no map guard is held while it runs.
        let handler = self
            .handlers
            .get(&msg.msg_type)
            .map(|entry| Arc::clone(entry.value()));
        let Some(handler) = handler else {
            tracing::warn!(msg_type = %msg.msg_type, "No handler registered, dropping message");
            self.bump(&msg.msg_type, |s| s.unhandled += 1);
            let _ = self.events.send(ConnectionEvent::UnknownMessage {
                msg_type: msg.msg_type.clone(),
            });
            return false;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&msg)));
        let reason = match outcome {
            Ok(Ok(())) => {
                self.bump(&msg.msg_type, |s| s.handled += 1);
                return true;
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_reason(panic.as_ref()),
        };

        tracing::error!(msg_type = %msg.msg_type, %reason, "Message handler failed");
        self.bump(&msg.msg_type, |s| s.failed += 1);
        self.fail(&msg, reason);
        false
    }

    /// Counters for one message type, if it has been seen.
    pub fn type_stats(&self, msg_type: &str) -> Option<TypeStats> {
        self.stats.get(msg_type).map(|s| s.value().clone())
    }

    /// Counters for every type seen so far.
    pub fn all_stats(&self) -> HashMap<String, TypeStats> {
        self.stats
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Most recent failures, oldest first.
    pub fn recent_failures(&self) -> Vec<DispatchFailure> {
        lock(&self.failures).iter().cloned().collect()
    }

    /// Zero all counters and forget recorded failures.
    pub fn reset_stats(&self) {
        self.stats.clear();
        lock(&self.failures).clear();
    }

    fn bump(&self, msg_type: &str, update: impl FnOnce(&mut TypeStats)) {
        update(&mut self.stats.entry(msg_type.to_string()).or_default());
    }

    fn fail(&self, msg: &Message, reason: String) {
        let failure = DispatchFailure {
            msg_type: msg.msg_type.clone(),
            message_id: msg.id.clone(),
            reason,
            timestamp_ms: now_ms(),
        };
        {
            let mut failures = lock(&self.failures);
            if failures.len() >= FAILURE_LOG_CAPACITY {
                failures.pop_front();
            }
            failures.push_back(failure.clone());
        }
        let _ = self.events.send(ConnectionEvent::DispatchFailed(failure));
    }
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn dispatcher() -> (MessageDispatcher, tokio::sync::broadcast::Receiver<ConnectionEvent>) {
        let events = event_channel();
        let rx = events.subscribe();
        (MessageDispatcher::new(events), rx)
    }

    #[test]
    fn test_message_routed_to_correct_handler() {
        let (dispatcher, _rx) = dispatcher();
        let chat = Arc::new(AtomicU32::new(0));
        let moves = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&chat);
        dispatcher.register_handler("chat", move |_: &Message| -> HandlerResult {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let m = Arc::clone(&moves);
        dispatcher.register_handler("move", move |_: &Message| -> HandlerResult {
            m.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(dispatcher.dispatch(Message::new("chat", json!({"text": "hi"}))));
        assert_eq!(chat.load(Ordering::SeqCst), 1);
        assert_eq!(moves.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.type_stats("chat").unwrap().handled, 1);
    }

    #[test]
    fn test_handler_sees_normalized_message() {
        let (dispatcher, _rx) = dispatcher();
        dispatcher.register_handler("chat", |msg: &Message| -> HandlerResult {
            assert!(msg.id.is_some());
            assert!(msg.timestamp.is_some());
            assert_eq!(msg.action.as_deref(), Some("receive"));
            Ok(())
        });
        let raw = Message::decode(r#"{"type":"chat","payload":{}}"#).unwrap();
        assert!(dispatcher.dispatch(raw));
    }

    #[test]
    fn test_unknown_type_emits_event() {
        let (dispatcher, mut rx) = dispatcher();
        assert!(!dispatcher.dispatch(Message::new("mystery", json!(null))));

        match rx.try_recv().unwrap() {
            ConnectionEvent::UnknownMessage { msg_type } => assert_eq!(msg_type, "mystery"),
            other => panic!("unexpected event {other:?}"),
        }
        let stats = dispatcher.type_stats("mystery").unwrap();
        assert_eq!((stats.received, stats.unhandled), (1, 1));
    }

    #[test]
    fn test_unknown_type_does_not_block_later_messages() {
        let (dispatcher, _rx) = dispatcher();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        dispatcher.register_handler("chat", move |_: &Message| -> HandlerResult {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(!dispatcher.dispatch(Message::new("mystery", json!(null))));
        assert!(dispatcher.dispatch(Message::new("chat", json!({"text": "hi"}))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.type_stats("chat").unwrap().handled, 1);
    }

    #[test]
    fn test_empty_type_fails_validation() {
        let (dispatcher, mut rx) = dispatcher();
        let msg = Message::decode(r#"{"payload":1}"#).unwrap();
        assert!(!dispatcher.dispatch(msg));
        assert!(matches!(rx.try_recv().unwrap(), ConnectionEvent::DispatchFailed(_)));
        assert_eq!(dispatcher.type_stats(INVALID_TYPE_KEY).unwrap().failed, 1);
    }

    #[test]
    fn test_failing_handler_is_isolated() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.register_handler("bad", |_: &Message| -> HandlerResult {
            Err("inventory desync".into())
        });
        dispatcher.register_handler("boom", |_: &Message| -> HandlerResult {
            panic!("handler exploded")
        });
        let ok = Arc::new(AtomicU32::new(0));
        let o = Arc::clone(&ok);
        dispatcher.register_handler("good", move |_: &Message| -> HandlerResult {
            o.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(!dispatcher.dispatch(Message::new("bad", json!(null))));
        assert!(!dispatcher.dispatch(Message::new("boom", json!(null))));
        assert!(dispatcher.dispatch(Message::new("good", json!(null))));
        assert_eq!(ok.load(Ordering::SeqCst), 1);

        let failures = dispatcher.recent_failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].reason, "inventory desync");
        assert!(failures[1].reason.contains("handler exploded"));
        assert!(matches!(rx.try_recv().unwrap(), ConnectionEvent::DispatchFailed(_)));
    }

    #[test]
    fn test_register_replaces_and_unregister_removes() {
        let (dispatcher, _rx) = dispatcher();
        let noop = |_: &Message| -> HandlerResult { Ok(()) };
        assert!(!dispatcher.register_handler("chat", noop));
        assert!(dispatcher.register_handler("chat", noop));
        assert_eq!(dispatcher.registered_types(), vec!["chat".to_string()]);

        assert!(dispatcher.unregister_handler("chat"));
        assert!(!dispatcher.unregister_handler("chat"));
        assert!(!dispatcher.dispatch(Message::new("chat", json!(null))));
    }

    #[test]
    fn test_handler_may_register_handlers() {
        let (dispatcher, _rx) = dispatcher();
        let dispatcher = Arc::new(dispatcher);
        let inner = Arc::clone(&dispatcher);
        dispatcher.register_handler("hello", move |_: &Message| -> HandlerResult {
            inner.register_handler("welcome", |_: &Message| -> HandlerResult { Ok(()) });
            Ok(())
        });

        assert!(dispatcher.dispatch(Message::new("hello", json!(null))));
        assert!(dispatcher.has_handler("welcome"));
    }
}
