//! Connection management for realtime conversation channels
//!
//! This module handles:
//! - One channel per conversation, pooled under a fixed capacity
//! - Automatic reconnection with exponential backoff
//! - Heartbeat-based link quality
//! - Outbound queuing while a channel is down
//! - Duplicate suppression and event fan-out to subscribers

mod dedup;
mod error;
mod events;
mod link;
mod manager;

pub use dedup::SeenIds;
pub use error::ConnectionError;
pub use events::{
    ConnectionEvent, ConnectionStats, ErrorInfo, EventStream, PoolStats, StatusSnapshot,
};
pub use manager::{ConnectionHandle, ConnectionManager};
