//! Typed channel payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{ChannelMessage, MessageType};
use crate::error::Result;

/// Sent right after the transport opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub client_version: String,
    pub platform: String,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsRequest {
    pub since: DateTime<Utc>,
    pub types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightUpdateRequest {
    pub insight_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricUpdate {
    pub metric_id: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightNotification {
    pub insight_id: String,
    pub title: String,
    pub message: String,
    pub priority: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisUpdate {
    pub analysis_id: String,
    pub status: String,
    pub progress: f64,
    #[serde(default)]
    pub results: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusUpdate {
    /// Entity name, either the store name (`metric`) or the cloud record
    /// type (`HealthMetric`)
    pub entity_type: String,
    pub entity_id: String,
    pub sync_status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemNotificationKind {
    Maintenance,
    Update,
    Feature,
    Alert,
    Promotion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemNotification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SystemNotificationKind,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub actions: Option<Vec<NotificationAction>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Pong,
    Error(ServerError),
    MetricUpdate(MetricUpdate),
    InsightNotification(InsightNotification),
    AnalysisUpdate(AnalysisUpdate),
    SyncStatusUpdate(SyncStatusUpdate),
    SystemNotification(SystemNotification),
    /// Types a client does not act on
    Other(MessageType),
}

impl ChannelEvent {
    pub fn decode(message: &ChannelMessage) -> Result<Self> {
        Ok(match message.message_type {
            MessageType::Pong => ChannelEvent::Pong,
            MessageType::Error => ChannelEvent::Error(message.payload_json()?),
            MessageType::MetricUpdate => ChannelEvent::MetricUpdate(message.payload_json()?),
            MessageType::InsightNotification => {
                ChannelEvent::InsightNotification(message.payload_json()?)
            }
            MessageType::AnalysisUpdate => ChannelEvent::AnalysisUpdate(message.payload_json()?),
            MessageType::SyncStatusUpdate => {
                ChannelEvent::SyncStatusUpdate(message.payload_json()?)
            }
            MessageType::SystemNotification => {
                ChannelEvent::SystemNotification(message.payload_json()?)
            }
            other => ChannelEvent::Other(other),
        })
    }
}
