//! TCP transport for `tcp://host:port` game servers.
//!
//! Resolves the host, connects, applies [`SocketOptions`] and exchanges
//! length-prefixed frames (see [`crate::framing`]). When headers are
//! configured they are sent first as a `hello` text frame. A background
//! reader task turns inbound frames and stream shutdown into
//! [`TransportSignal`]s.

use std::collections::BTreeMap;
use std::io;

use async_trait::async_trait;
use serde_json::json;
use tether_config::Config;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::classifier::Fault;
use crate::framing::{FrameConfig, FrameError, read_frame, write_frame};
use crate::socket::SocketOptions;
use crate::transport::{
    CLOSE_ABNORMAL, CLOSE_NORMAL, RawFrame, SignalReceiver, Transport, TransportOptions, TransportSignal,
};

const SIGNAL_BUFFER: usize = 256;

struct Link {
    writer: OwnedWriteHalf,
    cancel: CancellationToken,
}

/// Plain TCP transport. Certificate verification does not apply.
pub struct TcpTransport {
    frame_config: FrameConfig,
    socket_options: SocketOptions,
    link: Mutex<Option<Link>>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(FrameConfig::default(), SocketOptions::default())
    }
}

impl TcpTransport {
    pub fn new(frame_config: FrameConfig, socket_options: SocketOptions) -> Self {
        Self {
            frame_config,
            socket_options,
            link: Mutex::new(None),
        }
    }

    /// Transport tuned for `config`: keepalive follows the heartbeat interval.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            FrameConfig::default(),
            SocketOptions::for_heartbeat(&config.heartbeat),
        )
    }

    async fn write(&self, frame: RawFrame) -> Result<(), Fault> {
        let mut link = self.link.lock().await;
        let Some(link) = link.as_mut() else {
            return Err(Fault::Io(io::Error::from(io::ErrorKind::NotConnected)));
        };
        write_frame(&mut link.writer, &frame, &self.frame_config)
            .await
            .map_err(frame_fault)
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        config: FrameConfig,
        tx: mpsc::Sender<TransportSignal>,
        cancel: CancellationToken,
    ) {
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = read_frame(&mut reader, &config) => result,
            };

            match result {
                Ok(frame) => {
                    if tx.send(TransportSignal::Frame(frame)).await.is_err() {
                        break;
                    }
                }
                Err(FrameError::ConnectionClosed) => {
                    let _ = tx
                        .send(TransportSignal::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: "server closed the connection".to_string(),
                        })
                        .await;
                    break;
                }
                Err(e) => {
                    let reason = e.to_string();
                    let _ = tx.send(TransportSignal::Error(frame_fault(e))).await;
                    let _ = tx
                        .send(TransportSignal::Closed {
                            code: CLOSE_ABNORMAL,
                            reason,
                        })
                        .await;
                    break;
                }
            }
        }
        tracing::debug!("TCP reader task exiting");
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, url: &str, options: &TransportOptions) -> Result<SignalReceiver, Fault> {
        self.close(CLOSE_NORMAL, "reopening").await;

        let (host, port) = parse_tcp_url(url)?;
        let addrs: Vec<_> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| Fault::Dns {
                host: host.clone(),
                reason: e.to_string(),
            })?
            .collect();
        if addrs.is_empty() {
            return Err(Fault::Dns {
                host,
                reason: "no addresses found".to_string(),
            });
        }

        let mut last_err = None;
        let mut stream = None;
        for addr in &addrs {
            match TcpStream::connect(addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "TCP connect failed");
                    last_err = Some(e);
                }
            }
        }
        let Some(stream) = stream else {
            return Err(Fault::Io(last_err.unwrap_or_else(|| {
                io::Error::from(io::ErrorKind::ConnectionRefused)
            })));
        };

        if let Err(e) = self.socket_options.apply(&stream) {
            tracing::warn!(error = %e, "Failed to apply socket options");
        }
        tracing::info!(peer = ?stream.peer_addr().ok(), "TCP link established");

        let (reader, mut writer) = stream.into_split();

        if !options.headers.is_empty() {
            let headers: BTreeMap<_, _> = options.headers.iter().cloned().collect();
            let hello = json!({ "type": "hello", "payload": { "headers": headers } });
            write_frame(&mut writer, &RawFrame::Text(hello.to_string()), &self.frame_config)
                .await
                .map_err(frame_fault)?;
        }

        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        // Capacity is non-zero and the receiver is alive, so this cannot fail.
        let _ = tx.try_send(TransportSignal::Opened);

        let cancel = CancellationToken::new();
        tokio::spawn(Self::read_loop(
            reader,
            self.frame_config.clone(),
            tx,
            cancel.clone(),
        ));

        *self.link.lock().await = Some(Link { writer, cancel });
        Ok(rx)
    }

    async fn send_text(&self, text: String) -> Result<(), Fault> {
        self.write(RawFrame::Text(text)).await
    }

    async fn send_binary(&self, data: Vec<u8>) -> Result<(), Fault> {
        self.write(RawFrame::Binary(data)).await
    }

    async fn close(&self, code: u16, reason: &str) {
        let Some(mut link) = self.link.lock().await.take() else {
            return;
        };
        link.cancel.cancel();
        let _ = link.writer.shutdown().await;
        tracing::debug!(code, reason, "TCP link closed");
    }
}

fn frame_fault(e: FrameError) -> Fault {
    match e {
        FrameError::Io(e) => Fault::Io(e),
        FrameError::ConnectionClosed => Fault::Closed {
            code: CLOSE_ABNORMAL,
            reason: "connection closed mid-frame".to_string(),
        },
        other => Fault::Protocol(other.to_string()),
    }
}

/// Split `tcp://host:port` (scheme optional) into host and port.
pub fn parse_tcp_url(url: &str) -> Result<(String, u16), Fault> {
    let invalid = || Fault::InvalidAddress(url.to_string());

    let rest = match url.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some(_) => return Err(invalid()),
        None => url,
    };
    let rest = rest.trim_end_matches('/');
    let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ErrorKind, kind_of};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_tcp_url() {
        assert_eq!(parse_tcp_url("tcp://127.0.0.1:7777").unwrap(), ("127.0.0.1".into(), 7777));
        assert_eq!(parse_tcp_url("play.example:9000").unwrap(), ("play.example".into(), 9000));
        assert_eq!(parse_tcp_url("tcp://[::1]:80").unwrap(), ("::1".into(), 80));
        assert!(parse_tcp_url("ws://127.0.0.1:7777").is_err());
        assert!(parse_tcp_url("tcp://nohost").is_err());
        assert!(parse_tcp_url("tcp://:80").is_err());
        assert_eq!(
            kind_of(&parse_tcp_url("tcp://x:99999").unwrap_err()),
            ErrorKind::InvalidRequest
        );
    }

    #[tokio::test]
    async fn test_open_exchange_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let hello = read_frame(&mut stream, &FrameConfig::default()).await.unwrap();
            write_frame(&mut stream, &RawFrame::Text(r#"{"type":"welcome"}"#.into()), &FrameConfig::default())
                .await
                .unwrap();
            let echo = read_frame(&mut stream, &FrameConfig::default()).await.unwrap();
            (hello, echo)
        });

        let transport = TcpTransport::default();
        let options = TransportOptions {
            headers: vec![("Authorization".into(), "Bearer t".into())],
            ..Default::default()
        };
        let mut signals = transport
            .open(&format!("tcp://{addr}"), &options)
            .await
            .unwrap();

        assert!(matches!(signals.recv().await, Some(TransportSignal::Opened)));
        match signals.recv().await {
            Some(TransportSignal::Frame(RawFrame::Text(text))) => assert!(text.contains("welcome")),
            other => panic!("unexpected signal {other:?}"),
        }

        transport.send_binary(vec![7, 7]).await.unwrap();
        let (hello, echo) = server.await.unwrap();
        match hello {
            RawFrame::Text(text) => assert!(text.contains("Bearer t")),
            other => panic!("unexpected hello {other:?}"),
        }
        assert_eq!(echo, RawFrame::Binary(vec![7, 7]));

        // Server task dropped its stream
        assert!(matches!(
            signals.recv().await,
            Some(TransportSignal::Closed { code: CLOSE_ABNORMAL, .. })
        ));

        transport.close(1000, "done").await;
    }

    #[tokio::test]
    async fn test_refused_connection_reports_io_fault() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = TcpTransport::default();
        let err = transport
            .open(&format!("tcp://{addr}"), &TransportOptions::default())
            .await
            .unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_send_without_link_fails() {
        let transport = TcpTransport::default();
        let err = transport.send_text("x".into()).await.unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::SocketError);
    }
}
