//! Bounded error history, abnormal-pattern detection and notice throttling.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tether_config::ErrorConfig;
use tokio::time::Instant;

use crate::classifier::{ErrorKind, ErrorRecord};

/// Ring buffer of the most recent error records, oldest evicted first.
#[derive(Debug)]
pub struct ErrorLog {
    capacity: usize,
    entries: VecDeque<Arc<ErrorRecord>>,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, record: Arc<ErrorRecord>) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    /// Up to `n` most recent records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Arc<ErrorRecord>> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn count_by_kind(&self) -> HashMap<ErrorKind, usize> {
        let mut counts = HashMap::new();
        for record in &self.entries {
            *counts.entry(record.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// An error pattern that warrants escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbnormalPattern {
    ConsecutiveFailures(u32),
    HighErrorRate { count: usize, window: Duration },
    KindSpike { kind: ErrorKind, count: usize },
    SevereCluster { count: usize },
}

impl fmt::Display for AbnormalPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbnormalPattern::ConsecutiveFailures(n) => write!(f, "{n} consecutive failures"),
            AbnormalPattern::HighErrorRate { count, window } => {
                write!(f, "{count} errors within {window:?}")
            }
            AbnormalPattern::KindSpike { kind, count } => {
                write!(f, "{count} {kind} errors in a short window")
            }
            AbnormalPattern::SevereCluster { count } => write!(f, "{count} severe errors clustered"),
        }
    }
}

/// Thresholds for [`PatternDetector`].
#[derive(Debug, Clone, PartialEq)]
pub struct PatternThresholds {
    pub consecutive: u32,
    pub rate: usize,
    pub rate_window: Duration,
    pub spike: usize,
    pub severe_cluster: usize,
    pub severe_window: Duration,
}

impl From<&ErrorConfig> for PatternThresholds {
    fn from(config: &ErrorConfig) -> Self {
        Self {
            consecutive: config.consecutive_threshold,
            rate: config.rate_threshold,
            rate_window: config.rate_window(),
            spike: config.spike_threshold,
            severe_cluster: config.severe_cluster_threshold,
            severe_window: config.severe_window(),
        }
    }
}

impl Default for PatternThresholds {
    fn default() -> Self {
        Self::from(&ErrorConfig::default())
    }
}

/// Where a fault came from. Only link faults extend the consecutive-failure
/// streak; operation faults still count toward the windowed patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultScope {
    Connection,
    Operation,
}

/// Watches the error stream for abnormal patterns.
#[derive(Debug)]
pub struct PatternDetector {
    thresholds: PatternThresholds,
    consecutive: u32,
    recent: VecDeque<(Instant, ErrorKind, bool)>,
}

impl PatternDetector {
    pub fn new(thresholds: PatternThresholds) -> Self {
        Self {
            thresholds,
            consecutive: 0,
            recent: VecDeque::new(),
        }
    }

    /// Feed one link error. Returns the first threshold it crosses, if any.
    pub fn observe(&mut self, record: &ErrorRecord, now: Instant) -> Option<AbnormalPattern> {
        self.observe_in(FaultScope::Connection, record, now)
    }

    /// Feed one error raised in `scope`.
    pub fn observe_in(
        &mut self,
        scope: FaultScope,
        record: &ErrorRecord,
        now: Instant,
    ) -> Option<AbnormalPattern> {
        if scope == FaultScope::Connection {
            self.consecutive = self.consecutive.saturating_add(1);
        }
        self.recent
            .push_back((now, record.kind, record.severity.is_severe()));

        let horizon = self.thresholds.rate_window.max(self.thresholds.severe_window);
        while let Some(&(at, _, _)) = self.recent.front() {
            if now.duration_since(at) > horizon {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        if self.consecutive >= self.thresholds.consecutive {
            return Some(AbnormalPattern::ConsecutiveFailures(self.consecutive));
        }

        let in_window = |window: Duration| {
            self.recent
                .iter()
                .filter(move |(at, _, _)| now.duration_since(*at) <= window)
        };

        let count = in_window(self.thresholds.rate_window).count();
        if count >= self.thresholds.rate {
            return Some(AbnormalPattern::HighErrorRate {
                count,
                window: self.thresholds.rate_window,
            });
        }

        let same_kind = in_window(self.thresholds.rate_window)
            .filter(|(_, kind, _)| *kind == record.kind)
            .count();
        if same_kind >= self.thresholds.spike {
            return Some(AbnormalPattern::KindSpike {
                kind: record.kind,
                count: same_kind,
            });
        }

        let severe = in_window(self.thresholds.severe_window)
            .filter(|(_, _, severe)| *severe)
            .count();
        if severe >= self.thresholds.severe_cluster {
            return Some(AbnormalPattern::SevereCluster { count: severe });
        }

        None
    }

    /// A success breaks any run of consecutive failures.
    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
        self.recent.clear();
    }
}

/// Debounces user-facing notices per error kind.
#[derive(Debug)]
pub struct NoticeThrottle {
    cooldown: Duration,
    last: HashMap<ErrorKind, Instant>,
}

impl NoticeThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last: HashMap::new(),
        }
    }

    /// Returns true (and arms the cooldown) if a notice for `kind` may be shown.
    pub fn should_notify(&mut self, kind: ErrorKind, now: Instant) -> bool {
        match self.last.get(&kind) {
            Some(&at) if now.duration_since(at) < self.cooldown => false,
            _ => {
                self.last.insert(kind, now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ErrorClassifier, ErrorContext, Fault};

    fn record(fault: Fault) -> ErrorRecord {
        ErrorClassifier::new(false).classify(&fault, ErrorContext::new("test"))
    }

    fn timeout() -> ErrorRecord {
        record(Fault::Timeout {
            operation: "connect",
            after: Duration::from_secs(1),
        })
    }

    fn thresholds() -> PatternThresholds {
        PatternThresholds {
            consecutive: 100,
            rate: 100,
            rate_window: Duration::from_secs(60),
            spike: 100,
            severe_cluster: 100,
            severe_window: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_log_evicts_oldest() {
        let mut log = ErrorLog::new(3);
        for _ in 0..5 {
            log.push(Arc::new(timeout()));
        }
        assert_eq!(log.len(), 3);
        let recent = log.recent(10);
        assert!(recent.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(log.recent(1).len(), 1);
        assert_eq!(log.count_by_kind()[&ErrorKind::Timeout], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_escalate() {
        let mut detector = PatternDetector::new(PatternThresholds {
            consecutive: 3,
            ..thresholds()
        });
        let now = Instant::now();
        assert_eq!(detector.observe(&timeout(), now), None);
        assert_eq!(detector.observe(&timeout(), now), None);
        assert_eq!(
            detector.observe(&timeout(), now),
            Some(AbnormalPattern::ConsecutiveFailures(3))
        );

        detector.record_success();
        assert_eq!(detector.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_faults_do_not_extend_streak() {
        let mut detector = PatternDetector::new(PatternThresholds {
            consecutive: 2,
            ..thresholds()
        });
        let now = Instant::now();
        assert_eq!(detector.observe(&timeout(), now), None);
        for _ in 0..5 {
            assert_eq!(
                detector.observe_in(FaultScope::Operation, &timeout(), now),
                None
            );
        }
        assert_eq!(detector.consecutive_failures(), 1);
        assert_eq!(
            detector.observe(&timeout(), now),
            Some(AbnormalPattern::ConsecutiveFailures(2))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_expires_old_errors() {
        let mut detector = PatternDetector::new(PatternThresholds {
            rate: 3,
            rate_window: Duration::from_secs(10),
            ..thresholds()
        });
        let start = Instant::now();
        detector.observe(&timeout(), start);
        detector.observe(&timeout(), start);
        detector.record_success();

        // The first two have aged out of the window
        let later = start + Duration::from_secs(11);
        assert_eq!(detector.observe(&timeout(), later), None);
        assert!(matches!(
            detector.observe(&record(Fault::Protocol("x".into())), later),
            None
        ));
        assert!(matches!(
            detector.observe(&timeout(), later),
            Some(AbnormalPattern::HighErrorRate { count: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kind_spike() {
        let mut detector = PatternDetector::new(PatternThresholds {
            spike: 2,
            ..thresholds()
        });
        let now = Instant::now();
        assert_eq!(detector.observe(&timeout(), now), None);
        assert_eq!(
            detector.observe(&timeout(), now),
            Some(AbnormalPattern::KindSpike {
                kind: ErrorKind::Timeout,
                count: 2
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_severe_cluster_ignores_low_severity() {
        let mut detector = PatternDetector::new(PatternThresholds {
            severe_cluster: 2,
            ..thresholds()
        });
        let now = Instant::now();
        let server_error = || {
            record(Fault::Http {
                status: 500,
                message: "boom".into(),
            })
        };
        assert_eq!(detector.observe(&timeout(), now), None);
        assert_eq!(detector.observe(&server_error(), now), None);
        assert_eq!(
            detector.observe(&server_error(), now),
            Some(AbnormalPattern::SevereCluster { count: 2 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_notice_throttle_per_kind() {
        let mut throttle = NoticeThrottle::new(Duration::from_secs(5));
        let now = Instant::now();
        assert!(throttle.should_notify(ErrorKind::Timeout, now));
        assert!(!throttle.should_notify(ErrorKind::Timeout, now + Duration::from_secs(1)));
        assert!(throttle.should_notify(ErrorKind::ServerError, now + Duration::from_secs(1)));
        assert!(throttle.should_notify(ErrorKind::Timeout, now + Duration::from_secs(5)));
    }
}
