//! Scripted in-process transport.
//!
//! Every `open` consumes the next scripted [`OpenOutcome`] (falling back to a
//! configurable default), sent frames are captured for inspection, and tests
//! or local tools can inject frames, errors and closes into the live link.
//! With auto-pong enabled, heartbeat pings are answered immediately.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::classifier::Fault;
use crate::lock;
use crate::message::Message;
use crate::transport::{
    CLOSE_ABNORMAL, RawFrame, SignalReceiver, Transport, TransportOptions, TransportSignal,
};

const SIGNAL_BUFFER: usize = 256;

/// What the next `open` call does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Accept,
    /// Fail with `ConnectionRefused`.
    Refuse,
    /// Fail with a status-coded rejection (e.g. 401).
    Reject { status: u16 },
    /// Start opening but never report `Opened`.
    Hang,
    /// Report `Opened`, then immediately close with `code`.
    AcceptThenClose { code: u16 },
}

#[derive(Default)]
struct Inner {
    script: Mutex<VecDeque<OpenOutcome>>,
    default_outcome: Mutex<Option<OpenOutcome>>,
    link: Mutex<Option<mpsc::Sender<TransportSignal>>>,
    sent: Mutex<Vec<RawFrame>>,
    urls: Mutex<Vec<String>>,
    last_options: Mutex<Option<TransportOptions>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    auto_pong: AtomicBool,
    fail_sends: AtomicBool,
    heartbeat_types: Mutex<Option<(String, String)>>,
}

/// Cloneable handle; clones share the same link and capture buffers.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for the next `open` calls, in order.
    pub fn push_outcomes(&self, outcomes: impl IntoIterator<Item = OpenOutcome>) {
        lock(&self.inner.script).extend(outcomes);
    }

    /// Outcome used once the script is empty. Defaults to `Accept`.
    pub fn set_default_outcome(&self, outcome: OpenOutcome) {
        *lock(&self.inner.default_outcome) = Some(outcome);
    }

    /// Answer `ping_type` messages with `pong_type` messages echoing the payload.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.inner.auto_pong.store(enabled, Ordering::SeqCst);
    }

    pub fn set_heartbeat_types(&self, ping: impl Into<String>, pong: impl Into<String>) {
        *lock(&self.inner.heartbeat_types) = Some((ping.into(), pong.into()));
    }

    /// Make every send fail with `BrokenPipe`.
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        lock(&self.inner.link).is_some()
    }

    pub fn opened_urls(&self) -> Vec<String> {
        lock(&self.inner.urls).clone()
    }

    pub fn last_options(&self) -> Option<TransportOptions> {
        lock(&self.inner.last_options).clone()
    }

    pub fn sent_frames(&self) -> Vec<RawFrame> {
        lock(&self.inner.sent).clone()
    }

    /// Sent text frames that decode as messages.
    pub fn sent_messages(&self) -> Vec<Message> {
        lock(&self.inner.sent)
            .iter()
            .filter_map(|frame| match frame {
                RawFrame::Text(text) => Message::decode(text).ok(),
                RawFrame::Binary(bytes) => Message::decode_bytes(bytes).ok(),
            })
            .collect()
    }

    /// Sent messages of one type, in send order.
    pub fn sent_of_type(&self, msg_type: &str) -> Vec<Message> {
        self.sent_messages()
            .into_iter()
            .filter(|m| m.msg_type == msg_type)
            .collect()
    }

    /// Deliver a frame on the live link. Returns false if there is none.
    pub fn inject_frame(&self, frame: RawFrame) -> bool {
        self.signal(TransportSignal::Frame(frame))
    }

    pub fn inject_message(&self, message: &Message) -> bool {
        match message.encode() {
            Ok(text) => self.inject_frame(RawFrame::Text(text)),
            Err(_) => false,
        }
    }

    pub fn inject_error(&self, fault: Fault) -> bool {
        self.signal(TransportSignal::Error(fault))
    }

    /// Close the live link from the remote side.
    pub fn inject_close(&self, code: u16, reason: &str) -> bool {
        let Some(tx) = lock(&self.inner.link).take() else {
            return false;
        };
        tx.try_send(TransportSignal::Closed {
            code,
            reason: reason.to_string(),
        })
        .is_ok()
    }

    fn signal(&self, signal: TransportSignal) -> bool {
        match lock(&self.inner.link).as_ref() {
            Some(tx) => tx.try_send(signal).is_ok(),
            None => false,
        }
    }

    fn next_outcome(&self) -> OpenOutcome {
        lock(&self.inner.script)
            .pop_front()
            .or_else(|| lock(&self.inner.default_outcome).clone())
            .unwrap_or(OpenOutcome::Accept)
    }

    fn record_send(&self, frame: RawFrame) -> Result<(), Fault> {
        if self.inner.fail_sends.load(Ordering::SeqCst) {
            return Err(Fault::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        let link = lock(&self.inner.link).clone();
        let Some(tx) = link else {
            return Err(Fault::Io(io::Error::from(io::ErrorKind::NotConnected)));
        };

        if self.inner.auto_pong.load(Ordering::SeqCst)
            && let RawFrame::Text(text) = &frame
            && let Ok(message) = Message::decode(text)
        {
            let (ping, pong) = lock(&self.inner.heartbeat_types)
                .clone()
                .unwrap_or_else(|| ("ping".to_string(), "pong".to_string()));
            if message.msg_type == ping
                && let Ok(reply) = Message::new(pong, message.payload.clone()).encode()
            {
                let _ = tx.try_send(TransportSignal::Frame(RawFrame::Text(reply)));
            }
        }

        lock(&self.inner.sent).push(frame);
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str, options: &TransportOptions) -> Result<SignalReceiver, Fault> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.urls).push(url.to_string());
        *lock(&self.inner.last_options) = Some(options.clone());

        let outcome = self.next_outcome();
        tracing::debug!(url, ?outcome, "Memory transport open");

        match outcome {
            OpenOutcome::Refuse => {
                return Err(Fault::Io(io::Error::from(io::ErrorKind::ConnectionRefused)));
            }
            OpenOutcome::Reject { status } => {
                return Err(Fault::Http {
                    status,
                    message: "rejected by memory transport".to_string(),
                });
            }
            _ => {}
        }

        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        match outcome {
            OpenOutcome::Accept => {
                let _ = tx.try_send(TransportSignal::Opened);
                *lock(&self.inner.link) = Some(tx);
            }
            OpenOutcome::AcceptThenClose { code } => {
                let _ = tx.try_send(TransportSignal::Opened);
                let _ = tx.try_send(TransportSignal::Closed {
                    code,
                    reason: "closed by memory transport".to_string(),
                });
            }
            // Keep the sender alive so the stream stays pending.
            _ => *lock(&self.inner.link) = Some(tx),
        }
        Ok(rx)
    }

    async fn send_text(&self, text: String) -> Result<(), Fault> {
        self.record_send(RawFrame::Text(text))
    }

    async fn send_binary(&self, data: Vec<u8>) -> Result<(), Fault> {
        self.record_send(RawFrame::Binary(data))
    }

    async fn close(&self, _code: u16, _reason: &str) {
        if lock(&self.inner.link).take().is_some() {
            self.inner.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_outcomes_then_default() {
        let transport = MemoryTransport::new();
        transport.push_outcomes([OpenOutcome::Refuse, OpenOutcome::Reject { status: 401 }]);
        let options = TransportOptions::default();

        assert!(matches!(transport.open("mem://a", &options).await, Err(Fault::Io(_))));
        assert!(matches!(
            transport.open("mem://a", &options).await,
            Err(Fault::Http { status: 401, .. })
        ));
        let mut signals = transport.open("mem://a", &options).await.unwrap();
        assert!(matches!(signals.recv().await, Some(TransportSignal::Opened)));
        assert_eq!(transport.open_count(), 3);
    }

    #[tokio::test]
    async fn test_captures_sends_and_injects_frames() {
        let transport = MemoryTransport::new();
        let mut signals = transport.open("mem://a", &TransportOptions::default()).await.unwrap();
        signals.recv().await;

        transport.send_text(Message::new("chat", json!({"t": 1})).encode().unwrap()).await.unwrap();
        assert_eq!(transport.sent_of_type("chat").len(), 1);

        assert!(transport.inject_message(&Message::new("state", json!(null))));
        assert!(matches!(signals.recv().await, Some(TransportSignal::Frame(_))));

        assert!(transport.inject_close(CLOSE_ABNORMAL, "gone"));
        assert!(matches!(
            signals.recv().await,
            Some(TransportSignal::Closed { code: CLOSE_ABNORMAL, .. })
        ));
        assert!(signals.recv().await.is_none());
        assert!(transport.send_text("x".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_auto_pong_echoes_payload() {
        let transport = MemoryTransport::new();
        transport.set_auto_pong(true);
        let mut signals = transport.open("mem://a", &TransportOptions::default()).await.unwrap();
        signals.recv().await;

        let ping = Message::new("ping", json!({"seq": 4}));
        transport.send_text(ping.encode().unwrap()).await.unwrap();

        match signals.recv().await {
            Some(TransportSignal::Frame(RawFrame::Text(text))) => {
                let pong = Message::decode(&text).unwrap();
                assert_eq!(pong.msg_type, "pong");
                assert_eq!(pong.payload["seq"], 4);
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }
}
