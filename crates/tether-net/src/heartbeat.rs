//! Heartbeat ping/pong bookkeeping: RTT measurement, jitter and loss tracking.
//!
//! Pings carry a sequence number in their payload (`{"seq": n, "ts": ms}`);
//! the server echoes the sequence in its pong. The tracker pairs them up,
//! keeps a rolling window of RTT samples and wakes whoever is waiting on a
//! particular ping.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::message::{Message, now_ms};

/// Outstanding ping awaiting a pong.
struct PendingPing {
    sequence: u32,
    sent_at: Instant,
    waiter: Option<oneshot::Sender<Duration>>,
}

/// Rolling window of RTT samples plus the pings still in flight.
pub struct LatencyTracker {
    window_size: usize,
    pub(crate) rtt_samples: VecDeque<Duration>,
    pending: VecDeque<PendingPing>,
    next_sequence: u32,
    pub(crate) total_pings_sent: u64,
    pub(crate) total_pongs_received: u64,
    lost: u64,
    last_rtt: Option<Duration>,
}

impl LatencyTracker {
    pub const DEFAULT_WINDOW: usize = 100;

    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            rtt_samples: VecDeque::with_capacity(window_size.max(1)),
            pending: VecDeque::new(),
            next_sequence: 0,
            total_pings_sent: 0,
            total_pongs_received: 0,
            lost: 0,
            last_rtt: None,
        }
    }

    /// Record an outgoing ping. Returns the sequence number to put in it.
    /// `waiter` receives the RTT when the matching pong arrives.
    pub fn on_ping_sent(&mut self, waiter: Option<oneshot::Sender<Duration>>) -> u32 {
        let seq = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.pending.push_back(PendingPing {
            sequence: seq,
            sent_at: Instant::now(),
            waiter,
        });
        self.total_pings_sent += 1;
        seq
    }

    /// Match a pong to its ping. Returns the RTT, or `None` for an unknown or
    /// already expired sequence.
    pub fn on_pong_received(&mut self, sequence: u32) -> Option<Duration> {
        let pos = self.pending.iter().position(|p| p.sequence == sequence)?;
        let ping = self.pending.remove(pos)?;
        let rtt = ping.sent_at.elapsed();

        if self.rtt_samples.len() >= self.window_size {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(rtt);
        self.total_pongs_received += 1;
        self.last_rtt = Some(rtt);

        if let Some(waiter) = ping.waiter {
            let _ = waiter.send(rtt);
        }
        Some(rtt)
    }

    /// Give up on one ping (its reply window elapsed) and count it as lost.
    pub fn on_ping_lost(&mut self, sequence: u32) {
        if let Some(pos) = self.pending.iter().position(|p| p.sequence == sequence) {
            self.pending.remove(pos);
            self.lost += 1;
        }
    }

    /// Expire every ping older than `timeout`. Returns how many were dropped.
    pub fn expire_pending(&mut self, timeout: Duration) -> usize {
        let mut expired = 0;
        while let Some(front) = self.pending.front() {
            if front.sent_at.elapsed() > timeout {
                self.pending.pop_front();
                self.lost += 1;
                expired += 1;
            } else {
                break;
            }
        }
        expired
    }

    /// Forget in-flight pings (the connection they were sent on is gone).
    /// Waiters observe a closed channel.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    pub fn average_rtt(&self) -> Option<Duration> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        let sum: Duration = self.rtt_samples.iter().sum();
        Some(sum / self.rtt_samples.len() as u32)
    }

    pub fn min_rtt(&self) -> Option<Duration> {
        self.rtt_samples.iter().min().copied()
    }

    pub fn max_rtt(&self) -> Option<Duration> {
        self.rtt_samples.iter().max().copied()
    }

    /// Jitter: sample standard deviation of the RTT window.
    pub fn jitter(&self) -> Option<Duration> {
        if self.rtt_samples.len() < 2 {
            return None;
        }

        let avg = self.average_rtt()?.as_secs_f64();
        let variance: f64 = self
            .rtt_samples
            .iter()
            .map(|s| {
                let diff = s.as_secs_f64() - avg;
                diff * diff
            })
            .sum::<f64>()
            / (self.rtt_samples.len() - 1) as f64;

        Some(Duration::from_secs_f64(variance.sqrt()))
    }

    /// Fraction of pings declared lost (0.0 to 1.0).
    pub fn loss_rate(&self) -> f64 {
        if self.total_pings_sent == 0 {
            return 0.0;
        }
        self.lost as f64 / self.total_pings_sent as f64
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            last_rtt: self.last_rtt,
            average_rtt: self.average_rtt(),
            min_rtt: self.min_rtt(),
            max_rtt: self.max_rtt(),
            jitter: self.jitter(),
            loss_rate: self.loss_rate(),
            sample_count: self.rtt_samples.len(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.window_size);
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

/// Immutable view of heartbeat latency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencySnapshot {
    pub last_rtt: Option<Duration>,
    pub average_rtt: Option<Duration>,
    pub min_rtt: Option<Duration>,
    pub max_rtt: Option<Duration>,
    pub jitter: Option<Duration>,
    pub loss_rate: f64,
    pub sample_count: usize,
}

/// Build the ping message for `sequence`.
pub fn ping_message(ping_type: &str, sequence: u32) -> Message {
    Message::new(ping_type, json!({ "seq": sequence, "ts": now_ms() }))
}

/// Build the reply to a server-initiated ping, echoing its payload.
pub fn pong_for(pong_type: &str, ping: &Message) -> Message {
    Message::new(pong_type, ping.payload.clone())
}

/// Sequence number carried by a pong, if present.
pub fn pong_sequence(pong: &Message) -> Option<u32> {
    pong.payload
        .get("seq")
        .and_then(serde_json::Value::as_u64)
        .and_then(|seq| u32::try_from(seq).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rtt_measured_correctly() {
        let mut tracker = LatencyTracker::default();
        let seq = tracker.on_ping_sent(None);
        tokio::time::advance(Duration::from_millis(42)).await;

        assert_eq!(tracker.on_pong_received(seq), Some(Duration::from_millis(42)));
        assert_eq!(tracker.average_rtt(), Some(Duration::from_millis(42)));
        assert_eq!(tracker.last_rtt(), Some(Duration::from_millis(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_receives_rtt() {
        let mut tracker = LatencyTracker::default();
        let (tx, rx) = oneshot::channel();
        let seq = tracker.on_ping_sent(Some(tx));
        tokio::time::advance(Duration::from_millis(7)).await;
        tracker.on_pong_received(seq);
        assert_eq!(rx.await.unwrap(), Duration::from_millis(7));
    }

    #[test]
    fn test_jitter_calculated_from_variance() {
        let mut tracker = LatencyTracker::default();
        for ms in [10, 20, 30, 40, 50] {
            tracker.rtt_samples.push_back(Duration::from_millis(ms));
        }

        let jitter_ms = tracker.jitter().unwrap().as_secs_f64() * 1000.0;
        assert!(
            (jitter_ms - 15.81).abs() < 1.0,
            "Jitter should be ~15.81ms, got {jitter_ms:.2}ms",
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_rate_tracks_timeouts() {
        let mut tracker = LatencyTracker::default();
        for i in 0..10 {
            let seq = tracker.on_ping_sent(None);
            if i < 7 {
                tracker.on_pong_received(seq);
            }
        }

        tokio::time::advance(Duration::from_millis(5)).await;
        assert_eq!(tracker.expire_pending(Duration::from_millis(1)), 3);

        let loss = tracker.loss_rate();
        assert!((loss - 0.3).abs() < 0.01, "Loss rate should be ~30%, got {loss}");
    }

    #[test]
    fn test_rolling_window_is_bounded() {
        let mut tracker = LatencyTracker::new(5);
        for _ in 0..10 {
            let seq = tracker.on_ping_sent(None);
            tracker.on_pong_received(seq);
        }
        assert_eq!(tracker.snapshot().sample_count, 5);
    }

    #[test]
    fn test_out_of_order_and_unknown_pongs() {
        let mut tracker = LatencyTracker::default();
        let s1 = tracker.on_ping_sent(None);
        let s2 = tracker.on_ping_sent(None);

        assert!(tracker.on_pong_received(s2).is_some());
        assert!(tracker.on_pong_received(s1).is_some());
        assert!(tracker.on_pong_received(99).is_none());
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_lost_ping_is_counted_once() {
        let mut tracker = LatencyTracker::default();
        let seq = tracker.on_ping_sent(None);
        tracker.on_ping_lost(seq);
        tracker.on_ping_lost(seq);
        assert_eq!(tracker.loss_rate(), 1.0);
        assert!(tracker.on_pong_received(seq).is_none());
    }

    #[test]
    fn test_empty_tracker_returns_none() {
        let tracker = LatencyTracker::default();
        assert!(tracker.average_rtt().is_none());
        assert!(tracker.jitter().is_none());
        assert_eq!(tracker.loss_rate(), 0.0);
    }

    #[test]
    fn test_ping_payload_roundtrip() {
        let ping = ping_message("ping", 12);
        assert_eq!(ping.msg_type, "ping");
        let pong = pong_for("pong", &ping);
        assert_eq!(pong.msg_type, "pong");
        assert_eq!(pong_sequence(&pong), Some(12));
        assert_eq!(pong_sequence(&Message::new("pong", json!({}))), None);
    }
}
