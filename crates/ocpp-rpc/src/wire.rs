//! OCPP-J wire codec.
//!
//! One WebSocket text message carries one JSON array with a leading
//! message-type tag:
//!
//! - `[2, "<id>", "<method>", {params}]` — CALL
//! - `[3, "<id>", {result}]` — CALLRESULT
//! - `[4, "<id>", "<code>", "<description>", {details}]` — CALLERROR
//!
//! [`decode`] classifies a message into a [`WireMessage`] or a
//! [`MalformedFrame`] carrying the reason used for `badMessage` accounting.

use serde_json::{Value, json};

use crate::error::ErrorCode;

/// Message-type tags defined by OCPP-J.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// A request expecting a response.
    Call = 2,
    /// A successful response.
    CallResult = 3,
    /// An error response.
    CallError = 4,
}

impl MessageType {
    fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            2 => Some(Self::Call),
            3 => Some(Self::CallResult),
            4 => Some(Self::CallError),
            _ => None,
        }
    }
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Inbound or outbound CALL.
    Call {
        /// Correlation id, unique on the sending side.
        message_id: String,
        /// Method name.
        method: String,
        /// Parameters object.
        params: Value,
    },
    /// CALLRESULT answering a CALL.
    Result {
        /// Correlation id of the CALL being answered.
        message_id: String,
        /// Result object.
        payload: Value,
    },
    /// CALLERROR answering a CALL.
    Error {
        /// Correlation id of the CALL being answered.
        message_id: String,
        /// Wire error code.
        code: ErrorCode,
        /// Human-readable description.
        description: String,
        /// Details object.
        details: Value,
    },
}

impl WireMessage {
    /// The correlation id of this message.
    pub fn message_id(&self) -> &str {
        match self {
            Self::Call { message_id, .. }
            | Self::Result { message_id, .. }
            | Self::Error { message_id, .. } => message_id,
        }
    }
}

/// Why a message failed to decode.
///
/// The offending payload is kept (truncated) so the `badMessage` event can
/// surface it without ballooning event buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedFrame {
    /// Human-readable decode failure.
    pub reason: String,
    /// The first bytes of the offending payload.
    pub payload: String,
}

const PAYLOAD_EXCERPT: usize = 256;

impl MalformedFrame {
    fn new(reason: impl Into<String>, raw: &str) -> Self {
        let mut payload = raw.to_string();
        if payload.len() > PAYLOAD_EXCERPT {
            let mut cut = PAYLOAD_EXCERPT;
            while !payload.is_char_boundary(cut) {
                cut -= 1;
            }
            payload.truncate(cut);
        }
        Self {
            reason: reason.into(),
            payload,
        }
    }
}

/// Decode one text message into a [`WireMessage`].
pub fn decode(raw: &str) -> Result<WireMessage, MalformedFrame> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| MalformedFrame::new(format!("Invalid JSON: {e}"), raw))?;

    let Value::Array(items) = value else {
        return Err(MalformedFrame::new("Message is not a JSON array", raw));
    };

    let Some(tag) = items.first().and_then(Value::as_u64) else {
        return Err(MalformedFrame::new("Missing message type", raw));
    };
    let Some(message_type) = MessageType::from_tag(tag) else {
        return Err(MalformedFrame::new(
            format!("Unsupported message type {tag}"),
            raw,
        ));
    };

    let message_id = match items.get(1) {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        _ => {
            return Err(MalformedFrame::new(
                "Message ID must be a non-empty string",
                raw,
            ));
        }
    };

    match message_type {
        MessageType::Call => {
            if items.len() != 4 {
                return Err(MalformedFrame::new("CALL must have 4 elements", raw));
            }
            let Some(method) = items[2].as_str() else {
                return Err(MalformedFrame::new("Method must be a string", raw));
            };
            if !items[3].is_object() {
                return Err(MalformedFrame::new("Params must be an object", raw));
            }
            Ok(WireMessage::Call {
                message_id,
                method: method.to_string(),
                params: items[3].clone(),
            })
        }
        MessageType::CallResult => {
            if items.len() != 3 {
                return Err(MalformedFrame::new("CALLRESULT must have 3 elements", raw));
            }
            if !items[2].is_object() {
                return Err(MalformedFrame::new("Result must be an object", raw));
            }
            Ok(WireMessage::Result {
                message_id,
                payload: items[2].clone(),
            })
        }
        MessageType::CallError => {
            if items.len() != 5 {
                return Err(MalformedFrame::new("CALLERROR must have 5 elements", raw));
            }
            let Some(code_name) = items[2].as_str() else {
                return Err(MalformedFrame::new("Error code must be a string", raw));
            };
            let Some(code) = ErrorCode::from_name(code_name) else {
                return Err(MalformedFrame::new(
                    format!("Unrecognized error code {code_name:?}"),
                    raw,
                ));
            };
            let Some(description) = items[3].as_str() else {
                return Err(MalformedFrame::new(
                    "Error description must be a string",
                    raw,
                ));
            };
            if !items[4].is_object() {
                return Err(MalformedFrame::new("Error details must be an object", raw));
            }
            Ok(WireMessage::Error {
                message_id,
                code,
                description: description.to_string(),
                details: items[4].clone(),
            })
        }
    }
}

/// Encode a [`WireMessage`] into its JSON array text form.
pub fn encode(message: &WireMessage) -> String {
    let value = match message {
        WireMessage::Call {
            message_id,
            method,
            params,
        } => json!([MessageType::Call as u8, message_id, method, params]),
        WireMessage::Result {
            message_id,
            payload,
        } => json!([MessageType::CallResult as u8, message_id, payload]),
        WireMessage::Error {
            message_id,
            code,
            description,
            details,
        } => json!([
            MessageType::CallError as u8,
            message_id,
            code.as_str(),
            description,
            details
        ]),
    };
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_call() {
        let msg = decode(r#"[2, "19223201", "BootNotification", {"reason": "PowerUp"}]"#)
            .expect("well-formed CALL");
        assert_eq!(
            msg,
            WireMessage::Call {
                message_id: "19223201".into(),
                method: "BootNotification".into(),
                params: json!({"reason": "PowerUp"}),
            }
        );
    }

    #[test]
    fn decodes_result_and_error() {
        let msg = decode(r#"[3, "19223201", {"status": "Accepted"}]"#).expect("CALLRESULT");
        assert!(matches!(msg, WireMessage::Result { .. }));

        let msg = decode(r#"[4, "19223201", "NotImplemented", "no handler", {}]"#).expect("CALLERROR");
        match msg {
            WireMessage::Error { code, .. } => assert_eq!(code, ErrorCode::NotImplemented),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn accepts_both_occurrence_spellings_inbound() {
        for name in [
            "OccurenceConstraintViolation",
            "OccurrenceConstraintViolation",
        ] {
            let raw = format!(r#"[4, "1", "{name}", "bad", {{}}]"#);
            assert!(decode(&raw).is_ok(), "{name} must decode");
        }
    }

    #[test]
    fn round_trips_well_formed_messages() {
        let messages = [
            WireMessage::Call {
                message_id: "m1".into(),
                method: "Heartbeat".into(),
                params: json!({}),
            },
            WireMessage::Result {
                message_id: "m2".into(),
                payload: json!({"currentTime": "2024-01-01T00:00:00Z"}),
            },
            WireMessage::Error {
                message_id: "m3".into(),
                code: ErrorCode::OccurenceConstraintViolation,
                description: "missing field".into(),
                details: json!({"field": "reason"}),
            },
        ];
        for message in messages {
            assert_eq!(decode(&encode(&message)).expect("decode"), message);
        }
    }

    #[test]
    fn rejects_malformed_frames() {
        let cases = [
            ("{}", "not a JSON array"),
            ("[]", "Missing message type"),
            ("[5, \"x\", {}]", "Unsupported message type"),
            ("[2, \"\", \"M\", {}]", "non-empty"),
            ("[2, 7, \"M\", {}]", "non-empty"),
            ("[2, \"x\", \"M\", {}, {}]", "4 elements"),
            ("[2, \"x\", \"M\", []]", "Params must be an object"),
            ("[3, \"x\", 12]", "Result must be an object"),
            ("[4, \"x\", \"NoSuchCode\", \"d\", {}]", "Unrecognized error code"),
            ("[4, \"x\", \"GenericError\", \"d\", []]", "details must be an object"),
            ("not json", "Invalid JSON"),
        ];
        for (raw, want) in cases {
            let err = decode(raw).expect_err(raw);
            assert!(
                err.reason.contains(want),
                "{raw}: got {:?}, want {want:?}",
                err.reason
            );
        }
    }

    #[test]
    fn truncates_oversized_bad_payloads() {
        let raw = format!("[9, {:?}]", "y".repeat(10_000));
        let err = decode(&raw).expect_err("unsupported type");
        assert!(err.payload.len() <= PAYLOAD_EXCERPT);
    }
}
