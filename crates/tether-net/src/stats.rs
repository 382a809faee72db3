//! Connection counters.

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::lock;

/// Snapshot of connection activity since start or the last reset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_queued: u64,
    pub messages_dropped: u64,
    pub errors: u64,
    pub connect_attempts: u64,
    pub successful_connects: u64,
    /// Successful connections that followed an automatic reconnection attempt.
    pub reconnections: u64,
    pub last_latency: Option<Duration>,
    pub average_latency: Option<Duration>,
    pub min_latency: Option<Duration>,
    pub max_latency: Option<Duration>,
    pub latency_samples: u64,
    pub connected_since: Option<SystemTime>,
}

impl Statistics {
    /// Time since the current connection was established.
    pub fn uptime(&self) -> Option<Duration> {
        self.connected_since
            .and_then(|since| SystemTime::now().duration_since(since).ok())
    }
}

#[derive(Debug, Default)]
struct Counters {
    stats: Statistics,
    total_latency: Duration,
}

#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    inner: Mutex<Counters>,
}

impl StatsRecorder {
    pub fn snapshot(&self) -> Statistics {
        lock(&self.inner).stats.clone()
    }

    /// Zero all counters, keeping the current connection timestamp.
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        let connected_since = inner.stats.connected_since;
        *inner = Counters::default();
        inner.stats.connected_since = connected_since;
    }

    pub fn record_sent(&self, bytes: usize) {
        let mut inner = lock(&self.inner);
        let stats = &mut inner.stats;
        stats.messages_sent += 1;
        stats.bytes_sent += bytes as u64;
    }

    pub fn record_received(&self, bytes: usize) {
        let mut inner = lock(&self.inner);
        let stats = &mut inner.stats;
        stats.messages_received += 1;
        stats.bytes_received += bytes as u64;
    }

    pub fn record_queued(&self) {
        lock(&self.inner).stats.messages_queued += 1;
    }

    pub fn record_dropped(&self, n: u64) {
        lock(&self.inner).stats.messages_dropped += n;
    }

    pub fn record_error(&self) {
        lock(&self.inner).stats.errors += 1;
    }

    pub fn record_connect_attempt(&self) {
        lock(&self.inner).stats.connect_attempts += 1;
    }

    pub fn record_connected(&self, after_reconnect: bool) {
        let mut inner = lock(&self.inner);
        let stats = &mut inner.stats;
        stats.successful_connects += 1;
        if after_reconnect {
            stats.reconnections += 1;
        }
        stats.connected_since = Some(SystemTime::now());
    }

    pub fn record_disconnected(&self) {
        lock(&self.inner).stats.connected_since = None;
    }

    pub fn record_latency(&self, rtt: Duration) {
        let mut inner = lock(&self.inner);
        inner.total_latency += rtt;
        let total = inner.total_latency;
        let stats = &mut inner.stats;
        stats.latency_samples += 1;
        stats.last_latency = Some(rtt);
        stats.min_latency = Some(stats.min_latency.map_or(rtt, |min| min.min(rtt)));
        stats.max_latency = Some(stats.max_latency.map_or(rtt, |max| max.max(rtt)));
        stats.average_latency = u32::try_from(stats.latency_samples)
            .ok()
            .map(|n| total / n);
    }
}
