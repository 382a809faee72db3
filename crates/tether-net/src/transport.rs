//! Transport abstraction.
//!
//! A [`Transport`] opens one link at a time and reports everything that
//! happens on it as a stream of [`TransportSignal`]s: `Opened` once, then any
//! number of frames and errors, then at most one `Closed`. The connection
//! manager never touches sockets directly.

use std::time::Duration;

use async_trait::async_trait;
use tether_config::ConnectionConfig;
use tokio::sync::mpsc;

use crate::classifier::Fault;

/// Close code for an orderly shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code reported when the link dropped without a close handshake.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// A single text or binary frame as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl RawFrame {
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RawFrame::Text(text) => text.as_bytes(),
            RawFrame::Binary(bytes) => bytes,
        }
    }
}

#[derive(Debug)]
pub enum TransportSignal {
    Opened,
    Frame(RawFrame),
    Error(Fault),
    Closed { code: u16, reason: String },
}

pub type SignalReceiver = mpsc::Receiver<TransportSignal>;

/// Options applied when opening a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Sorted by name so the handshake is deterministic.
    pub headers: Vec<(String, String)>,
    pub verify_certificates: bool,
    pub connect_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

impl TransportOptions {
    /// Build options from config; an auth token becomes an `Authorization` header.
    pub fn from_config(config: &ConnectionConfig) -> Self {
        let mut headers: Vec<(String, String)> = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(token) = &config.auth_token {
            headers.retain(|(k, _)| !k.eq_ignore_ascii_case("authorization"));
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        headers.sort();

        Self {
            headers,
            verify_certificates: config.verify_certificates,
            connect_timeout: config.connect_timeout(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start opening a link to `url`. Success means the attempt is under way;
    /// the returned stream yields `Opened` once the link is usable.
    async fn open(&self, url: &str, options: &TransportOptions) -> Result<SignalReceiver, Fault>;

    async fn send_text(&self, text: String) -> Result<(), Fault>;

    async fn send_binary(&self, data: Vec<u8>) -> Result<(), Fault>;

    /// Close the current link, if any. Idempotent.
    async fn close(&self, code: u16, reason: &str);
}
