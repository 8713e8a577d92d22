//! Liveness bookkeeping for transports that probe the server themselves.
//!
//! The monitor tracks probes in flight and decides when the silence has
//! lasted long enough to call the link dead. It never touches the clock on
//! its own; callers pass in `Instant`s, which keeps the arithmetic testable.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Timestamps of the most recent probe activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatRecord {
    pub last_sent_at: Option<Instant>,
    pub last_ack_at: Option<Instant>,
    pub outstanding: usize,
}

/// Tracks ping probes and their acknowledgements on one link.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    ping_timeout: Duration,
    record: HeartbeatRecord,
    probes: VecDeque<(String, Instant)>,
    sent: u64,
    acked: u64,
    missed: u64,
}

impl HeartbeatMonitor {
    pub fn new(ping_timeout: Duration) -> Self {
        Self {
            ping_timeout,
            record: HeartbeatRecord::default(),
            probes: VecDeque::new(),
            sent: 0,
            acked: 0,
            missed: 0,
        }
    }

    /// Note that a probe with the given request id went out.
    pub fn probe_sent(&mut self, id: String, now: Instant) {
        self.probes.push_back((id, now));
        self.record.last_sent_at = Some(now);
        self.record.outstanding = self.probes.len();
        self.sent += 1;
    }

    /// Try to match an inbound `refs` against a probe in flight.
    ///
    /// Returns true when the frame acknowledged one of our probes, in which
    /// case the frame should not be forwarded further.
    pub fn observe_ack(&mut self, refs: &str, now: Instant) -> bool {
        let position = self.probes.iter().position(|(id, _)| id == refs);
        match position {
            Some(index) => {
                self.probes.remove(index);
                self.notify_ping(true, now);
                true
            }
            None => false,
        }
    }

    /// Record the outcome of a probe without drawing any conclusion about
    /// the link. Deciding whether the link is dead is `expire`'s job.
    pub fn notify_ping(&mut self, success: bool, now: Instant) {
        if success {
            self.record.last_ack_at = Some(now);
            self.acked += 1;
        } else {
            self.missed += 1;
        }
        self.record.outstanding = self.probes.len();
    }

    /// Drop probes that have waited longer than the timeout.
    ///
    /// Returns how many expired in this pass; the caller decides what that
    /// means for the link.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        loop {
            let due = match self.probes.front() {
                Some((_, sent_at)) => now.duration_since(*sent_at) >= self.ping_timeout,
                None => false,
            };
            if !due {
                break;
            }
            self.probes.pop_front();
            self.notify_ping(false, now);
            expired += 1;
        }
        expired
    }

    pub fn record(&self) -> HeartbeatRecord {
        self.record
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn acked(&self) -> u64 {
        self.acked
    }

    pub fn missed(&self) -> u64 {
        self.missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_matches_probe_in_flight() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_millis(500));
        let start = Instant::now();
        monitor.probe_sent("p1".to_string(), start);
        monitor.probe_sent("p2".to_string(), start + Duration::from_millis(100));

        assert!(monitor.observe_ack("p1", start + Duration::from_millis(150)));
        assert!(!monitor.observe_ack("p1", start + Duration::from_millis(160)));
        assert_eq!(monitor.sent(), 2);
        assert_eq!(monitor.acked(), 1);
        assert_eq!(monitor.record().outstanding, 1);
    }

    #[test]
    fn test_unrelated_refs_are_not_acks() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_millis(500));
        let start = Instant::now();
        monitor.probe_sent("p1".to_string(), start);
        assert!(!monitor.observe_ack("other-request", start));
        assert_eq!(monitor.record().outstanding, 1);
    }

    #[test]
    fn test_expire_drops_only_overdue_probes() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_millis(500));
        let start = Instant::now();
        monitor.probe_sent("p1".to_string(), start);
        monitor.probe_sent("p2".to_string(), start + Duration::from_millis(400));

        assert_eq!(monitor.expire(start + Duration::from_millis(300)), 0);
        assert_eq!(monitor.expire(start + Duration::from_millis(600)), 1);
        assert_eq!(monitor.missed(), 1);
        assert_eq!(monitor.record().outstanding, 1);
        assert_eq!(monitor.expire(start + Duration::from_millis(1000)), 1);
        assert_eq!(monitor.record().outstanding, 0);
    }

    #[test]
    fn test_missed_probe_keeps_last_ack() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_millis(100));
        let start = Instant::now();
        monitor.probe_sent("p1".to_string(), start);
        monitor.observe_ack("p1", start + Duration::from_millis(10));
        let last_ack = monitor.record().last_ack_at;

        monitor.probe_sent("p2".to_string(), start + Duration::from_millis(20));
        monitor.expire(start + Duration::from_millis(500));
        assert_eq!(monitor.record().last_ack_at, last_ack);
        assert_eq!(monitor.missed(), 1);
    }
}
