//! Channel envelope and message types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Every message type the channel carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Handshake,
    Ping,
    Pong,
    Error,
    MetricUpdate,
    InsightNotification,
    AnalysisUpdate,
    SyncStatusUpdate,
    SystemNotification,
    MetricsRequest,
    InsightUpdateRequest,
    SubscribeRequest,
    UnsubscribeRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    Control,
    Data,
    Request,
}

impl MessageType {
    pub const ALL: [MessageType; 13] = [
        MessageType::Handshake,
        MessageType::Ping,
        MessageType::Pong,
        MessageType::Error,
        MessageType::MetricUpdate,
        MessageType::InsightNotification,
        MessageType::AnalysisUpdate,
        MessageType::SyncStatusUpdate,
        MessageType::SystemNotification,
        MessageType::MetricsRequest,
        MessageType::InsightUpdateRequest,
        MessageType::SubscribeRequest,
        MessageType::UnsubscribeRequest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Handshake => "handshake",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
            MessageType::MetricUpdate => "metricUpdate",
            MessageType::InsightNotification => "insightNotification",
            MessageType::AnalysisUpdate => "analysisUpdate",
            MessageType::SyncStatusUpdate => "syncStatusUpdate",
            MessageType::SystemNotification => "systemNotification",
            MessageType::MetricsRequest => "metricsRequest",
            MessageType::InsightUpdateRequest => "insightUpdateRequest",
            MessageType::SubscribeRequest => "subscribeRequest",
            MessageType::UnsubscribeRequest => "unsubscribeRequest",
        }
    }

    pub fn category(&self) -> MessageCategory {
        match self {
            MessageType::Handshake | MessageType::Ping | MessageType::Pong | MessageType::Error => {
                MessageCategory::Control
            }
            MessageType::MetricUpdate
            | MessageType::InsightNotification
            | MessageType::AnalysisUpdate
            | MessageType::SyncStatusUpdate
            | MessageType::SystemNotification => MessageCategory::Data,
            MessageType::MetricsRequest
            | MessageType::InsightUpdateRequest
            | MessageType::SubscribeRequest
            | MessageType::UnsubscribeRequest => MessageCategory::Request,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope for every frame. The payload is JSON bytes, base64 on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl ChannelMessage {
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Envelope with a JSON-encoded payload
    pub fn json<T: Serialize>(message_type: MessageType, payload: &T) -> Result<Self> {
        Ok(Self::new(message_type, serde_json::to_vec(payload)?))
    }

    /// Decode the payload as `T`
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            SyncError::Decode(format!("{} payload of message {}: {}", self.message_type, self.id, e))
        })
    }

    /// Wire form
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame received as text or binary
    pub fn decode(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame).map_err(|e| SyncError::Decode(format!("channel frame: {}", e)))
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_type_names_match_wire() {
        for t in MessageType::ALL {
            let wire = serde_json::to_value(t).unwrap();
            assert_eq!(wire, Value::String(t.as_str().to_string()));
        }
    }

    #[test]
    fn test_categories() {
        assert_eq!(MessageType::Ping.category(), MessageCategory::Control);
        assert_eq!(MessageType::SyncStatusUpdate.category(), MessageCategory::Data);
        assert_eq!(MessageType::SubscribeRequest.category(), MessageCategory::Request);
    }

    #[test]
    fn test_payload_is_base64_on_wire() {
        let msg = ChannelMessage::json(MessageType::Ping, &json!({"n": 1})).unwrap();
        let wire: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(wire["type"], "ping");
        assert_eq!(wire["payload"], "eyJuIjoxfQ==");

        let back = ChannelMessage::decode(msg.encode().unwrap().as_bytes()).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.payload_json::<Value>().unwrap(), json!({"n": 1}));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let frame = br#"{"id":"1","type":"teleport","timestamp":"2024-05-01T12:00:00Z","payload":""}"#;
        assert!(matches!(ChannelMessage::decode(frame), Err(SyncError::Decode(_))));
    }
}
