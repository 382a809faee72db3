//! Socket tuning for TCP game-server links.
//!
//! Kernel keepalive backs up the application heartbeat: with the heartbeat
//! enabled the first probe is scheduled well after the heartbeat would have
//! noticed a dead peer, so it only catches links the heartbeat cannot see
//! (for example while the heartbeat is stopped).

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tether_config::HeartbeatConfig;
use tokio::net::TcpStream;

const FALLBACK_IDLE: Duration = Duration::from_secs(60);
const PROBE_INTERVAL: Duration = Duration::from_secs(10);
const PROBE_COUNT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub idle: Duration,
    pub interval: Duration,
    /// Ignored on platforms without `TCP_KEEPCNT` support.
    pub probes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// Game traffic is small and latency sensitive, so Nagle is off by default.
    pub nodelay: bool,
    pub keepalive: Option<Keepalive>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: Some(Keepalive {
                idle: FALLBACK_IDLE,
                interval: PROBE_INTERVAL,
                probes: PROBE_COUNT,
            }),
        }
    }
}

impl SocketOptions {
    /// Keepalive idle time of twice the heartbeat interval, or 60s without a heartbeat.
    pub fn for_heartbeat(heartbeat: &HeartbeatConfig) -> Self {
        let idle = if heartbeat.enabled && heartbeat.interval_ms > 0 {
            heartbeat.interval().saturating_mul(2)
        } else {
            FALLBACK_IDLE
        };
        Self {
            keepalive: Some(Keepalive {
                idle,
                interval: PROBE_INTERVAL,
                probes: PROBE_COUNT,
            }),
            ..Self::default()
        }
    }

    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        let Some(keepalive) = self.keepalive else {
            return Ok(());
        };
        let params = TcpKeepalive::new()
            .with_time(keepalive.idle)
            .with_interval(keepalive.interval);
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let params = params.with_retries(keepalive.probes);

        SockRef::from(stream).set_tcp_keepalive(&params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn client_stream() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[test]
    fn test_keepalive_follows_heartbeat() {
        let mut heartbeat = HeartbeatConfig::default();
        heartbeat.interval_ms = 15_000;
        let options = SocketOptions::for_heartbeat(&heartbeat);
        assert_eq!(options.keepalive.unwrap().idle, Duration::from_secs(30));

        heartbeat.enabled = false;
        let options = SocketOptions::for_heartbeat(&heartbeat);
        assert_eq!(options.keepalive.unwrap().idle, FALLBACK_IDLE);
        assert!(options.nodelay);
    }

    #[tokio::test]
    async fn test_apply_sets_nodelay_and_keepalive() {
        let (client, _server) = client_stream().await;
        SocketOptions::default().apply(&client).unwrap();
        assert!(client.nodelay().unwrap());
        assert!(SockRef::from(&client).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_apply_without_keepalive() {
        let (client, _server) = client_stream().await;
        let options = SocketOptions {
            nodelay: false,
            keepalive: None,
        };
        options.apply(&client).unwrap();
        assert!(!client.nodelay().unwrap());
        assert!(!SockRef::from(&client).keepalive().unwrap());
    }
}
