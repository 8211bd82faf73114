//! Push channel protocol frames.
//!
//! Every frame is a JSON text message with a `type` discriminator. Control
//! frames use snake_case tags; business events carry their topic name as the
//! `type` plus a server-assigned `sequence`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// `auth_error` code the server uses when the credential has expired.
pub const TOKEN_EXPIRED_CODE: &str = "token_expired";

// ============================================================================
// Client → Server Frames
// ============================================================================

/// Frame sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Application-level handshake, sent right after the socket opens.
    Auth {
        /// Opaque credential.
        token: String,
    },
    /// Ask the server for every event after `since_sequence`.
    RequestMissing {
        /// Low-water mark: the last sequence the client has fully applied.
        since_sequence: u64,
        /// Correlates the `missed_events` response.
        request_id: Uuid,
    },
    /// Arbitrary application event published by the client.
    Emit {
        /// Event name.
        event: String,
        /// Event payload.
        payload: Value,
    },
    /// Application-level keepalive.
    Ping,
}

impl ClientFrame {
    /// Serialize to the JSON text sent on the wire.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Server → Client Frames
// ============================================================================

/// Control frame sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Handshake accepted.
    AuthOk {
        /// Server-side session identifier, if the server exposes one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Handshake rejected, or credential revoked mid-session.
    AuthError {
        /// Human readable reason.
        reason: String,
        /// Machine readable code, e.g. `token_expired`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// Response to [`ClientFrame::RequestMissing`].
    MissedEvents(RecoveryResponse),
    /// Response to [`ClientFrame::Ping`].
    Pong,
}

/// A sequenced state-change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Topic name, e.g. `balance-changed`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Server-assigned position within the connection session, starting at 1.
    pub sequence: u64,
    /// Type-specific payload.
    #[serde(default)]
    pub data: Value,
    /// Server emission time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
}

impl Event {
    pub fn new(event_type: impl Into<String>, sequence: u64, data: Value, timestamp: i64) -> Self {
        Self {
            event_type: event_type.into(),
            sequence,
            data,
            timestamp,
        }
    }
}

/// Batch of events returned for a recovery request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResponse {
    /// Id of the request this answers. Absent on servers that do not echo it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    /// Events after the requested low-water mark. The server may compact
    /// intermediate states, so this can be shorter than the numeric range.
    #[serde(default)]
    pub events: Vec<Event>,
    /// Number of events the server reports.
    #[serde(default)]
    pub count: usize,
}

/// Any inbound frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Control(ControlFrame),
    Event(Event),
}

impl ServerFrame {
    /// Parse an inbound text frame.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|_| {
            let preview: String = text.chars().take(120).collect();
            Error::UnsupportedFrame(preview)
        })
    }
}

/// Whether an `auth_error` code means the credential expired.
pub fn is_expiry_code(code: Option<&str>) -> bool {
    code == Some(TOKEN_EXPIRED_CODE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_event_frame() {
        let text = r#"{"type":"balance-changed","sequence":42,"data":{"member_id":"m1","balance":"10.5"},"timestamp":1704067200000}"#;
        match ServerFrame::parse(text).unwrap() {
            ServerFrame::Event(event) => {
                assert_eq!(event.event_type, "balance-changed");
                assert_eq!(event.sequence, 42);
                assert_eq!(event.data["member_id"], "m1");
                assert_eq!(event.timestamp, 1704067200000);
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_control_frames() {
        let ok = ServerFrame::parse(r#"{"type":"auth_ok","session_id":"s-1"}"#).unwrap();
        assert_eq!(
            ok,
            ServerFrame::Control(ControlFrame::AuthOk {
                session_id: Some("s-1".to_string())
            })
        );

        let rejected =
            ServerFrame::parse(r#"{"type":"auth_error","reason":"expired","code":"token_expired"}"#)
                .unwrap();
        match rejected {
            ServerFrame::Control(ControlFrame::AuthError { code, .. }) => {
                assert!(is_expiry_code(code.as_deref()));
            }
            other => panic!("expected auth_error, got {:?}", other),
        }

        let pong = ServerFrame::parse(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(pong, ServerFrame::Control(ControlFrame::Pong));
    }

    #[test]
    fn test_parse_missed_events() {
        let request_id = Uuid::new_v4();
        let text = json!({
            "type": "missed_events",
            "request_id": request_id,
            "events": [
                {"type": "status-changed", "sequence": 4, "data": {}, "timestamp": 2},
                {"type": "status-changed", "sequence": 3, "data": {}, "timestamp": 1}
            ],
            "count": 2
        })
        .to_string();

        match ServerFrame::parse(&text).unwrap() {
            ServerFrame::Control(ControlFrame::MissedEvents(response)) => {
                assert_eq!(response.request_id, Some(request_id));
                assert_eq!(response.count, 2);
                assert_eq!(response.events[0].sequence, 4);
            }
            other => panic!("expected missed_events, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ServerFrame::parse("not json").is_err());
        assert!(ServerFrame::parse(r#"{"type":"balance-changed"}"#).is_err());
    }

    #[test]
    fn test_client_frame_wire_format() {
        let request_id = Uuid::new_v4();
        let frame = ClientFrame::RequestMissing {
            since_sequence: 40,
            request_id,
        };
        let parsed: Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(parsed["type"], "request_missing");
        assert_eq!(parsed["since_sequence"], 40);
        assert_eq!(parsed["request_id"], request_id.to_string());

        let auth: Value =
            serde_json::from_str(&ClientFrame::Auth { token: "t".into() }.to_text().unwrap())
                .unwrap();
        assert_eq!(auth, json!({"type": "auth", "token": "t"}));
    }
}
