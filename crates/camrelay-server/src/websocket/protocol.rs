//! Wire messages sent to subscribers.

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

/// RFC 3339 UTC timestamp with millisecond precision, e.g.
/// `2024-05-01T12:00:00.123Z`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One webhook delivery from the upstream device.
///
/// The payload is forwarded verbatim and never interpreted.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Address of the HTTP peer that delivered the webhook.
    pub source_address: String,
    /// When the relay received the webhook.
    pub received_at: DateTime<Utc>,
    /// Webhook body.
    pub payload: Value,
}

impl Event {
    /// Stamp a payload with the current time.
    pub fn new(source_address: impl Into<String>, payload: Value) -> Self {
        Self {
            source_address: source_address.into(),
            received_at: Utc::now(),
            payload,
        }
    }
}

/// Server-to-client message.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to an application-level `{"type":"ping"}`.
    Pong {
        /// Reply time.
        timestamp: String,
    },
    /// Another subscriber's message, relayed.
    ClientMessage {
        /// Peer address of the originating subscriber.
        from: String,
        /// Relay time.
        timestamp: String,
        /// The original message, verbatim.
        payload: Value,
    },
    /// A webhook event.
    HikvisionEvent {
        /// Receipt time.
        timestamp: String,
        /// Webhook body, verbatim.
        data: Value,
    },
}

impl ServerMessage {
    /// `pong` stamped now.
    pub fn pong() -> Self {
        Self::Pong {
            timestamp: format_timestamp(Utc::now()),
        }
    }

    /// `client_message` from `from`, stamped now.
    pub fn client_message(from: impl Into<String>, payload: Value) -> Self {
        Self::ClientMessage {
            from: from.into(),
            timestamp: format_timestamp(Utc::now()),
            payload,
        }
    }

    /// `hikvision_event` for a received webhook.
    pub fn event(event: &Event) -> Self {
        Self::HikvisionEvent {
            timestamp: format_timestamp(event.received_at),
            data: event.payload.clone(),
        }
    }

    /// Serialize once into a shareable text frame payload.
    pub fn to_text(&self) -> Result<Utf8Bytes, serde_json::Error> {
        serde_json::to_string(self).map(Utf8Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn parse(msg: &ServerMessage) -> Value {
        serde_json::from_str(msg.to_text().unwrap().as_str()).unwrap()
    }

    #[test]
    fn timestamp_format() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(format_timestamp(at), "2024-05-01T12:00:00.000Z");
    }

    #[test]
    fn pong_shape() {
        let v = parse(&ServerMessage::pong());
        assert_eq!(v["type"], "pong");
        assert!(v["timestamp"].as_str().unwrap().ends_with('Z'));
        assert_eq!(v.as_object().unwrap().len(), 2);
    }

    #[test]
    fn client_message_shape() {
        let v = parse(&ServerMessage::client_message(
            "10.0.0.5",
            json!({"type": "note", "text": "hi"}),
        ));
        assert_eq!(v["type"], "client_message");
        assert_eq!(v["from"], "10.0.0.5");
        assert_eq!(v["payload"], json!({"type": "note", "text": "hi"}));
        assert!(v["timestamp"].is_string());
    }

    #[test]
    fn event_shape_uses_receipt_time() {
        let event = Event {
            source_address: "192.168.1.64".into(),
            received_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            payload: json!({"event": "motion", "channel": 1}),
        };
        let v = parse(&ServerMessage::event(&event));
        assert_eq!(v["type"], "hikvision_event");
        assert_eq!(v["timestamp"], "2024-01-02T03:04:05.000Z");
        assert_eq!(v["data"], json!({"event": "motion", "channel": 1}));
    }

    #[test]
    fn event_payload_is_verbatim() {
        let payload = json!([1, "two", null, {"nested": [true]}]);
        let event = Event::new("x", payload.clone());
        assert_eq!(parse(&ServerMessage::event(&event))["data"], payload);
    }
}
