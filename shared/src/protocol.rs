//! Wire records and inbound normalization
//!
//! The backend is loose about field names (`text`/`content`,
//! `sender`/`user`, `sent_at`/`timestamp`). Every inbound record is
//! normalized into one canonical shape right at the boundary, by a pure
//! function, so nothing past the socket ever sees the raw variants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Kind given to records that do not name one
pub const DEFAULT_KIND: &str = "text";

/// Canonical chat message delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub sender_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub kind: String,
}

/// A decoded inbound record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Server-initiated ping; must be answered with a pong
    Ping { timestamp: u64 },
    /// Answer to one of our pings
    Pong { timestamp: u64 },
    /// Server-side error report
    ServerError { message: String },
    /// Ordinary chat message
    Message(ChatMessage),
}

/// Payload a caller sends into a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_id: Option<String>,
}

impl OutboundPayload {
    /// Plain text message
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: DEFAULT_KIND.to_owned(),
            user_id: None,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

impl From<&str> for OutboundPayload {
    fn from(text: &str) -> Self {
        OutboundPayload::text(text)
    }
}

impl From<String> for OutboundPayload {
    fn from(text: String) -> Self {
        OutboundPayload::text(text)
    }
}

/// Reserved control records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
}

/// Anything the client writes to a socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Control(ControlFrame),
    Payload(OutboundPayload),
}

impl From<OutboundPayload> for OutboundFrame {
    fn from(payload: OutboundPayload) -> Self {
        OutboundFrame::Payload(payload)
    }
}

impl From<ControlFrame> for OutboundFrame {
    fn from(control: ControlFrame) -> Self {
        OutboundFrame::Control(control)
    }
}

/// Why an inbound record could not be normalized
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("record is missing `{0}`")]
    MissingField(&'static str),

    #[error("{0} record has no numeric timestamp")]
    InvalidControl(&'static str),
}

/// Normalize one parsed inbound record
pub fn normalize(value: &Value) -> Result<InboundFrame, NormalizeError> {
    let obj = value.as_object().ok_or(NormalizeError::NotAnObject)?;
    let kind = obj.get("type").and_then(Value::as_str);

    match kind {
        Some("ping") => {
            let timestamp = control_timestamp(obj).ok_or(NormalizeError::InvalidControl("ping"))?;
            return Ok(InboundFrame::Ping { timestamp });
        }
        Some("pong") => {
            let timestamp = control_timestamp(obj).ok_or(NormalizeError::InvalidControl("pong"))?;
            return Ok(InboundFrame::Pong { timestamp });
        }
        _ => {}
    }

    if let Some(error) = obj.get("error").filter(|e| !e.is_null()) {
        let message = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Ok(InboundFrame::ServerError { message });
    }

    let id = obj
        .get("id")
        .and_then(id_like)
        .ok_or(NormalizeError::MissingField("id"))?;

    let text = first_str(obj, &["content", "text"])
        .ok_or(NormalizeError::MissingField("text"))?
        .to_owned();

    let sent_at = ["sent_at", "sentAt", "timestamp"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(parse_time));

    Ok(InboundFrame::Message(ChatMessage {
        id,
        text,
        sender_id: sender_of(obj),
        sent_at,
        kind: kind.unwrap_or(DEFAULT_KIND).to_owned(),
    }))
}

fn control_timestamp(obj: &Map<String, Value>) -> Option<u64> {
    obj.get("timestamp").and_then(Value::as_u64)
}

fn id_like(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_str<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| obj.get(*key).and_then(Value::as_str))
}

fn sender_of(obj: &Map<String, Value>) -> Option<String> {
    if let Some(sender) = obj.get("sender").and_then(id_like) {
        return Some(sender);
    }
    match obj.get("user") {
        Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
        Some(Value::Object(user)) => {
            if let Some(id) = user.get("id").and_then(id_like) {
                return Some(id);
            }
        }
        _ => {}
    }
    obj.get("user_id").and_then(id_like)
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}
