//! Chat Shared Protocol Types
//!
//! This crate provides the wire records, codec and connection policies
//! shared by every part of the chat client. Nothing in here owns a socket
//! or a timer; the runtime pieces live in the `chat-client` crate.

pub mod backoff;
pub mod codec;
pub mod heartbeat;
pub mod protocol;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use backoff::BackoffPolicy;
pub use heartbeat::{ConnectionQuality, HeartbeatMonitor};
pub use protocol::{ChatMessage, InboundFrame, NormalizeError, OutboundFrame, OutboundPayload};
pub use state_machine::{ConnectionState, LinkEvent, LinkStateMachine, Transition};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing and sizing defaults for realtime connections
pub mod defaults {
    /// Base reconnect interval in milliseconds
    pub const RECONNECT_INTERVAL_MS: u64 = 3000;

    /// Upper bound on any single reconnect delay
    pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

    /// Reconnect attempts before a connection gives up
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

    /// Interval between client pings
    pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

    /// How long to wait for a pong before reporting the link unstable
    pub const PONG_TIMEOUT_MS: u64 = 5000;

    /// Round trips at or above this latency are reported unstable
    pub const STABILITY_THRESHOLD_MS: u64 = 1000;

    /// Live connections kept in the pool
    pub const MAX_CONNECTIONS: usize = 3;

    /// Outbound payloads held per connection while it is not open
    pub const MAX_QUEUED_MESSAGES: usize = 256;

    /// Inbound message ids remembered per conversation for duplicate suppression
    pub const SEEN_IDS_CAPACITY: usize = 512;

    /// Conversations with remembered message ids; pooled ones are always kept
    pub const MAX_TRACKED_CONVERSATIONS: usize = 64;

    /// Deadline for a single socket open attempt
    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// Close code for an intentional, non-retried closure
    pub const NORMAL_CLOSURE: u16 = 1000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_after_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_defaults_are_consistent() {
        assert!(defaults::RECONNECT_INTERVAL_MS <= defaults::MAX_RECONNECT_DELAY_MS);
        assert!(defaults::PONG_TIMEOUT_MS < defaults::HEARTBEAT_INTERVAL_MS);
        assert_eq!(defaults::NORMAL_CLOSURE, 1000);
    }
}
