//! Heartbeat Monitor
//!
//! Tracks the ping/pong exchange of one connection and derives the
//! reported link quality from it. The monitor never decides when to ping
//! or when a pong is overdue; the owning connection runs those timers and
//! feeds the results in here.

use std::time::{Duration, Instant};

use crate::defaults;

/// Link quality reported to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionQuality {
    /// Round trip of the last answered ping
    pub latency: Duration,
    /// Wall-clock time (epoch ms) of the last ping sent, 0 if none yet
    pub last_ping_at_ms: u64,
    /// False when the last pong was slow or never arrived
    pub is_stable: bool,
}

#[derive(Debug, Clone, Copy)]
struct PendingPing {
    timestamp: u64,
    sent_at: Instant,
}

/// Per-connection ping bookkeeping and latency/stability tracker
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    stability_threshold: Duration,
    quality: ConnectionQuality,
    pending: Option<PendingPing>,
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(Duration::from_millis(defaults::STABILITY_THRESHOLD_MS))
    }
}

impl HeartbeatMonitor {
    pub fn new(stability_threshold: Duration) -> Self {
        Self {
            stability_threshold,
            quality: ConnectionQuality::default(),
            pending: None,
        }
    }

    pub fn quality(&self) -> ConnectionQuality {
        self.quality
    }

    pub fn is_awaiting_pong(&self) -> bool {
        self.pending.is_some()
    }

    /// A fresh socket reached the open state
    pub fn on_open(&mut self) {
        self.pending = None;
        self.quality.is_stable = true;
    }

    /// The socket left the open state
    pub fn on_close(&mut self) {
        self.pending = None;
        self.quality.is_stable = false;
    }

    /// Record an outgoing ping and return the timestamp to put on the wire.
    ///
    /// Timestamps are strictly increasing per monitor so that a late pong
    /// for an older ping can never be mistaken for the current one.
    pub fn begin_ping(&mut self, now: Instant, wall_ms: u64) -> u64 {
        let timestamp = wall_ms.max(self.quality.last_ping_at_ms + 1);
        self.quality.last_ping_at_ms = timestamp;
        self.pending = Some(PendingPing {
            timestamp,
            sent_at: now,
        });
        timestamp
    }

    /// Apply a pong. Returns the measured latency when it answers the
    /// outstanding ping; unmatched pongs are ignored.
    pub fn on_pong(&mut self, timestamp: u64, now: Instant) -> Option<Duration> {
        let pending = self.pending.filter(|p| p.timestamp == timestamp)?;
        self.pending = None;

        let latency = now.saturating_duration_since(pending.sent_at);
        self.quality.latency = latency;
        self.quality.is_stable = latency < self.stability_threshold;
        Some(latency)
    }

    /// The pong deadline for the ping stamped `timestamp` expired.
    ///
    /// Only downgrades stability; returns true if the ping was still
    /// outstanding.
    pub fn on_pong_timeout(&mut self, timestamp: u64) -> bool {
        match self.pending {
            Some(p) if p.timestamp == timestamp => {
                self.pending = None;
                self.quality.is_stable = false;
                true
            }
            _ => false,
        }
    }
}
