use std::time::{Duration, Instant};

/// Liveness bookkeeping for one connection.
///
/// Pure state: the connector's monitor thread feeds it the clock and acts on
/// its answers, which keeps the timing rules testable without sockets.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    missed_threshold: u32,
    last_traffic: Instant,
    last_probe: Instant,
    next_sequence: u64,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, missed_threshold: u32, now: Instant) -> Self {
        Self {
            interval,
            missed_threshold,
            last_traffic: now,
            last_probe: now,
            next_sequence: 1,
        }
    }

    /// A zero interval turns the monitor off.
    pub fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Any inbound frame proves the peer alive.
    pub fn record_traffic(&mut self, now: Instant) {
        if now > self.last_traffic {
            self.last_traffic = now;
        }
    }

    /// Whether a probe should be sent now.
    pub fn probe_due(&self, now: Instant) -> bool {
        self.enabled() && now.saturating_duration_since(self.last_probe) >= self.interval
    }

    /// Note that a probe went out; returns the sequence number to send it with.
    pub fn probe_sent(&mut self, now: Instant) -> u64 {
        self.last_probe = now;
        let seq = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1).max(1);
        seq
    }

    /// Silence tolerated before the peer is declared dead.
    pub fn deadline(&self) -> Duration {
        self.interval.saturating_mul(self.missed_threshold)
    }

    pub fn is_overdue(&self, now: Instant) -> bool {
        self.enabled() && now.saturating_duration_since(self.last_traffic) >= self.deadline()
    }

    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_traffic)
    }
}
