//! Manager configuration with file and environment overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ManagerConfig::default()`]
//! 2. If a settings file is given and exists, deep-merge its values over defaults
//! 3. Apply `CHAT_*` environment variable overrides (highest priority)

use std::path::Path;
use std::time::Duration;

use chat_shared::{defaults, BackoffPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Default channel endpoint
pub const DEFAULT_BASE_URL: &str = "ws://127.0.0.1:8000";

/// Errors raised while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings: {0}")]
    Json(#[from] serde_json::Error),
}

/// Connection manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub stability_threshold_ms: u64,
    pub enable_heartbeat: bool,
    pub max_connections: usize,
    pub max_queued_messages: usize,
    pub seen_ids_capacity: usize,
    pub max_tracked_conversations: usize,
    pub connect_timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            token: None,
            reconnect_interval_ms: defaults::RECONNECT_INTERVAL_MS,
            max_reconnect_delay_ms: defaults::MAX_RECONNECT_DELAY_MS,
            max_reconnect_attempts: defaults::MAX_RECONNECT_ATTEMPTS,
            heartbeat_interval_ms: defaults::HEARTBEAT_INTERVAL_MS,
            pong_timeout_ms: defaults::PONG_TIMEOUT_MS,
            stability_threshold_ms: defaults::STABILITY_THRESHOLD_MS,
            enable_heartbeat: true,
            max_connections: defaults::MAX_CONNECTIONS,
            max_queued_messages: defaults::MAX_QUEUED_MESSAGES,
            seen_ids_capacity: defaults::SEEN_IDS_CAPACITY,
            max_tracked_conversations: defaults::MAX_TRACKED_CONVERSATIONS,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
        }
    }
}

impl ManagerConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.reconnect_interval_ms, self.max_reconnect_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn stability_threshold(&self) -> Duration {
        Duration::from_millis(self.stability_threshold_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Pool capacity; a pool always has room for at least one connection
    pub fn pool_capacity(&self) -> usize {
        self.max_connections.max(1)
    }
}

/// Load configuration from an optional settings file with env overrides.
///
/// A missing file yields defaults; an unreadable or invalid one is an error.
pub fn load_config(path: Option<&Path>) -> Result<ManagerConfig, ConfigError> {
    let defaults = serde_json::to_value(ManagerConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "settings file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: ManagerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, anything else is replaced by `source`, and
/// nulls in `source` leave the target untouched.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `CHAT_*` environment overrides. Invalid values are ignored.
pub fn apply_env_overrides(config: &mut ManagerConfig) {
    if let Some(v) = read_env_string("CHAT_WS_BASE_URL") {
        config.base_url = v;
    }
    if let Some(v) = read_env_string("CHAT_TOKEN") {
        config.token = Some(v);
    }
    if let Some(v) = read_env_u64("CHAT_RECONNECT_INTERVAL_MS", 100, 600_000) {
        config.reconnect_interval_ms = v;
    }
    if let Some(v) = read_env_u64("CHAT_MAX_RECONNECT_ATTEMPTS", 0, 1000) {
        config.max_reconnect_attempts = v as u32;
    }
    if let Some(v) = read_env_u64("CHAT_HEARTBEAT_INTERVAL_MS", 1000, 3_600_000) {
        config.heartbeat_interval_ms = v;
    }
    if let Some(v) = read_env_bool("CHAT_ENABLE_HEARTBEAT") {
        config.enable_heartbeat = v;
    }
    if let Some(v) = read_env_usize("CHAT_MAX_CONNECTIONS", 1, 1000) {
        config.max_connections = v;
    }
    if let Some(v) = read_env_usize("CHAT_MAX_QUEUED", 1, 1_000_000) {
        config.max_queued_messages = v;
    }
    if let Some(v) = read_env_usize("CHAT_MAX_TRACKED_CONVERSATIONS", 1, 100_000) {
        config.max_tracked_conversations = v;
    }
}

// Pure parsing functions

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// Env var readers

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid integer env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid integer env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ManagerConfig::default();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.reconnect_interval_ms, 3000);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.heartbeat_interval_ms, 30_000);
        assert!(config.enable_heartbeat);
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.max_tracked_conversations, 64);
        assert_eq!(config.token, None);
    }

    #[test]
    fn test_deep_merge_objects_and_nulls() {
        let merged = deep_merge(
            json!({ "a": 1, "b": { "c": 2, "d": 3 } }),
            json!({ "b": { "c": 20 }, "a": null, "e": [1] }),
        );
        assert_eq!(merged, json!({ "a": 1, "b": { "c": 20, "d": 3 }, "e": [1] }));
    }

    #[test]
    fn test_load_without_file_gives_defaults() {
        let config = load_config(None).expect("defaults load");
        // Env overrides may be present on a developer machine; the shape
        // must still round-trip
        assert!(config.pool_capacity() >= 1);
    }

    #[test]
    fn test_load_merges_partial_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"max_reconnect_delay_ms": 9000, "pong_timeout_ms": 2500}}"#)
            .expect("write settings");

        let config = load_config(Some(file.path())).expect("load");
        assert_eq!(config.max_reconnect_delay_ms, 9000);
        assert_eq!(config.pong_timeout_ms, 2500);
        assert_eq!(config.stability_threshold_ms, 1000);
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(Some(&dir.path().join("absent.json")));
        assert!(config.is_ok());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "{{not json").expect("write settings");
        assert!(matches!(
            load_config(Some(file.path())),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("nope"), None);
    }

    #[test]
    fn test_parse_ranges() {
        assert_eq!(parse_u64_range("1500", 100, 2000), Some(1500));
        assert_eq!(parse_u64_range("50", 100, 2000), None);
        assert_eq!(parse_u64_range("-1", 0, 10), None);
        assert_eq!(parse_usize_range(" 3 ", 1, 10), Some(3));
        assert_eq!(parse_usize_range("0", 1, 10), None);
    }

    #[test]
    fn test_derived_durations() {
        let config = ManagerConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert_eq!(config.pool_capacity(), 1);
        assert_eq!(config.pong_timeout(), Duration::from_secs(5));
        assert_eq!(config.backoff().delay(0), Duration::from_secs(3));
    }
}
