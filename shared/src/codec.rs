//! Line-oriented JSON codec
//!
//! Every record is one JSON object on one line:
//! ```text
//! {"type":"ping","timestamp":1714557600000}\n
//! {"id":"m1","content":"hi","sender":"alice","type":"text"}\n
//! ```
//! A transport text frame usually carries a single record, but may carry
//! several separated by newlines. Each line is decoded on its own so one
//! malformed record never takes its neighbours down with it.

use serde_json::Value;
use thiserror::Error;

use crate::protocol::{normalize, InboundFrame, NormalizeError, OutboundFrame};

/// Maximum text frame size (1 MiB) to prevent memory exhaustion
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Invalid JSON record: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Malformed record: {0}")]
    Malformed(#[from] NormalizeError),

    #[error("JSON encode error: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Encode an outbound frame as a single wire line (without the newline)
pub fn encode(frame: &OutboundFrame) -> Result<String, CodecError> {
    let line = serde_json::to_string(frame).map_err(CodecError::Encode)?;

    if line.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(line.len()));
    }

    Ok(line)
}

/// Decode and normalize one record
pub fn decode_record(line: &str) -> Result<InboundFrame, CodecError> {
    let value: Value = serde_json::from_str(line).map_err(CodecError::InvalidJson)?;
    Ok(normalize(&value)?)
}

/// Decode every record in a text frame, in order.
///
/// Returns `Err` only when the frame as a whole is rejected; per-record
/// failures are reported in place.
pub fn decode_frame(text: &str) -> Result<Vec<Result<InboundFrame, CodecError>>, CodecError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(text.len()));
    }

    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(decode_record)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControlFrame, OutboundPayload};

    #[test]
    fn test_encode_is_single_line() {
        let frame = OutboundFrame::from(OutboundPayload::text("two\nlines"));
        let line = encode(&frame).expect("encode failed");
        assert!(!line.contains('\n'));
        assert!(line.contains(r#""text":"two\nlines""#));
    }

    #[test]
    fn test_encoded_ping_decodes_as_ping() {
        let line = encode(&ControlFrame::Ping { timestamp: 17 }.into()).expect("encode failed");
        let decoded = decode_record(&line).expect("decode failed");
        assert_eq!(decoded, InboundFrame::Ping { timestamp: 17 });
    }

    #[test]
    fn test_multiple_records_per_frame() {
        let frame = "{\"type\":\"pong\",\"timestamp\":1}\n\n{\"id\":\"a\",\"text\":\"x\"}\n";
        let records = decode_frame(frame).expect("frame accepted");
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], Ok(InboundFrame::Pong { timestamp: 1 })));
        assert!(matches!(records[1], Ok(InboundFrame::Message(_))));
    }

    #[test]
    fn test_bad_record_does_not_poison_frame() {
        let frame = "not json\n{\"id\":\"a\",\"text\":\"x\"}";
        let records = decode_frame(frame).expect("frame accepted");
        assert!(matches!(records[0], Err(CodecError::InvalidJson(_))));
        assert!(records[1].is_ok());
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        let result = decode_record(r#"{"text":"no id"}"#);
        assert!(matches!(
            result,
            Err(CodecError::Malformed(NormalizeError::MissingField("id")))
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let huge = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(
            decode_frame(&huge),
            Err(CodecError::FrameTooLarge(_))
        ));
    }
}
