//! Applies pushed data messages to the local store

use std::str::FromStr;
use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use super::client::{ListenerId, RealtimeClient};
use super::events::{
    AnalysisUpdate, ChannelEvent, InsightNotification, MetricUpdate, SyncStatusUpdate,
};
use super::message::{ChannelMessage, MessageType};
use crate::error::{Result, SyncError};
use crate::storage::RecordStore;
use crate::sync::conflict::RemoteRecord;
use crate::types::{EntityType, SyncChannel, SyncStatus, SyncUpdate, SyncableRecord};

/// Message types the processor acts on
pub const PROCESSED_TYPES: [MessageType; 4] = [
    MessageType::MetricUpdate,
    MessageType::InsightNotification,
    MessageType::AnalysisUpdate,
    MessageType::SyncStatusUpdate,
];

pub struct EventProcessor {
    records: Arc<dyn RecordStore>,
}

impl EventProcessor {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    /// Register with a client for every processed type
    pub fn attach(self: &Arc<Self>, client: &RealtimeClient) -> Vec<ListenerId> {
        PROCESSED_TYPES
            .into_iter()
            .map(|message_type| {
                let processor = Arc::clone(self);
                client.subscribe(message_type, move |message| {
                    if let Err(e) = processor.process(message) {
                        tracing::warn!(
                            id = %message.id,
                            message_type = %message.message_type,
                            "Channel event not applied: {}",
                            e
                        );
                    }
                })
            })
            .collect()
    }

    /// Apply one message; returns whether the store changed
    pub fn process(&self, message: &ChannelMessage) -> Result<bool> {
        match ChannelEvent::decode(message)? {
            ChannelEvent::MetricUpdate(update) => self.apply_metric(&update),
            ChannelEvent::InsightNotification(notification) => self.mark_unread(&notification),
            ChannelEvent::AnalysisUpdate(update) => self.apply_analysis(&update),
            ChannelEvent::SyncStatusUpdate(update) => self.apply_sync_status(&update),
            _ => Ok(false),
        }
    }

    fn apply_metric(&self, update: &MetricUpdate) -> Result<bool> {
        let remote = RemoteRecord {
            entity_type: EntityType::Metric,
            remote_id: update.metric_id.clone(),
            local_id: Uuid::parse_str(&update.metric_id).ok(),
            owner_id: None,
            modified_at: update.timestamp,
            payload: json!({
                "type": update.metric_type,
                "value": update.value,
                "unit": update.unit,
                "source": update.source,
            }),
        };
        let merge = self.records.apply_remote_changes(&[remote])?;
        Ok(merge.applied() > 0)
    }

    fn mark_unread(&self, notification: &InsightNotification) -> Result<bool> {
        let Some(mut record) = self.lookup(EntityType::Insight, &notification.insight_id)? else {
            return Ok(false);
        };
        set_field(&mut record.payload, "is_read", Value::Bool(false));
        self.records.save_record(&record)?;
        Ok(true)
    }

    fn apply_analysis(&self, update: &AnalysisUpdate) -> Result<bool> {
        let Some(mut record) = self.lookup(EntityType::Analysis, &update.analysis_id)? else {
            return Ok(false);
        };
        set_field(&mut record.payload, "status", Value::String(update.status.clone()));
        set_field(&mut record.payload, "progress", json!(update.progress));
        if let Some(results) = &update.results {
            set_field(&mut record.payload, "results", results.clone());
        }
        self.records.save_record(&record)?;
        Ok(true)
    }

    fn apply_sync_status(&self, update: &SyncStatusUpdate) -> Result<bool> {
        let entity_type = EntityType::from_str(&update.entity_type)
            .ok()
            .or_else(|| EntityType::from_cloud_record_type(&update.entity_type))
            .ok_or_else(|| {
                SyncError::Decode(format!("unknown entity type: {}", update.entity_type))
            })?;
        let status = SyncStatus::from_str(&update.sync_status)?;
        let Some(record) = self.lookup(entity_type, &update.entity_id)? else {
            return Ok(false);
        };

        let change = SyncUpdate {
            local_id: record.local_id,
            status,
            remote_id: record.remote_id.clone(),
            last_synced_at: if status == SyncStatus::Synced {
                Some(update.timestamp)
            } else {
                record.last_synced_at
            },
            sync_error: if status == SyncStatus::Failed {
                update.details.clone()
            } else {
                None
            },
            expected_timestamp: None,
            channel: SyncChannel::Backend,
        };
        Ok(self.records.commit_sync_updates(&[change])? > 0)
    }

    /// By local id when the id is a uuid, otherwise by remote id
    fn lookup(&self, entity_type: EntityType, id: &str) -> Result<Option<SyncableRecord>> {
        if let Ok(local_id) = Uuid::parse_str(id) {
            if let Some(record) = self.records.get_record(local_id)? {
                return Ok(Some(record));
            }
        }
        self.records.find_by_remote_id(entity_type, id)
    }
}

fn set_field(payload: &mut Value, key: &str, value: Value) {
    if !payload.is_object() {
        *payload = Value::Object(Default::default());
    }
    if let Value::Object(map) = payload {
        map.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use chrono::{Duration, TimeZone, Utc};

    fn setup() -> (Arc<Storage>, EventProcessor) {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let processor = EventProcessor::new(storage.clone());
        (storage, processor)
    }

    fn message(message_type: MessageType, payload: Value) -> ChannelMessage {
        ChannelMessage::json(message_type, &payload).unwrap()
    }

    #[test]
    fn test_metric_update_inserts_synced_record() {
        let (storage, processor) = setup();
        let id = Uuid::new_v4();
        let msg = message(
            MessageType::MetricUpdate,
            json!({
                "metricId": id.to_string(),
                "type": "steps",
                "value": 1200.0,
                "unit": "count",
                "timestamp": "2024-05-01T12:00:00Z",
                "source": "phone"
            }),
        );

        assert!(processor.process(&msg).unwrap());
        let record = storage.get_record(id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.payload["value"], json!(1200.0));
    }

    #[test]
    fn test_stale_metric_update_ignored() {
        let (storage, processor) = setup();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let local = SyncableRecord::new(EntityType::Metric, json!({"value": 5.0})).with_timestamp(t0);
        storage.save_record(&local).unwrap();

        let msg = message(
            MessageType::MetricUpdate,
            json!({
                "metricId": local.local_id.to_string(),
                "type": "steps",
                "value": 1.0,
                "unit": "count",
                "timestamp": t0 - Duration::hours(1),
                "source": "phone"
            }),
        );
        assert!(!processor.process(&msg).unwrap());
        assert_eq!(
            storage.get_record(local.local_id).unwrap().unwrap().payload,
            json!({"value": 5.0})
        );
    }

    #[test]
    fn test_insight_notification_marks_unread() {
        let (storage, processor) = setup();
        let mut insight = SyncableRecord::new(EntityType::Insight, json!({"is_read": true}));
        insight.remote_id = Some("ins-7".into());
        insight.sync_status = SyncStatus::Synced;
        storage.save_record(&insight).unwrap();

        let msg = message(
            MessageType::InsightNotification,
            json!({
                "insightId": "ins-7",
                "title": "Sleep",
                "message": "Better rest this week",
                "priority": "low",
                "timestamp": "2024-05-01T12:00:00Z"
            }),
        );
        assert!(processor.process(&msg).unwrap());

        let record = storage.get_record(insight.local_id).unwrap().unwrap();
        assert_eq!(record.payload["is_read"], json!(false));
        assert_eq!(record.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_analysis_update_for_unknown_record_is_noop() {
        let (_storage, processor) = setup();
        let msg = message(
            MessageType::AnalysisUpdate,
            json!({"analysisId": "a-404", "status": "completed", "progress": 1.0}),
        );
        assert!(!processor.process(&msg).unwrap());
    }

    #[test]
    fn test_sync_status_update() {
        let (storage, processor) = setup();
        let mut record = SyncableRecord::new(EntityType::Metric, json!({}));
        record.sync_status = SyncStatus::Syncing;
        storage.save_record(&record).unwrap();

        let msg = message(
            MessageType::SyncStatusUpdate,
            json!({
                "entityType": "HealthMetric",
                "entityId": record.local_id.to_string(),
                "syncStatus": "synced",
                "timestamp": "2024-05-01T12:00:00Z"
            }),
        );
        assert!(processor.process(&msg).unwrap());
        assert_eq!(
            storage.get_record(record.local_id).unwrap().unwrap().sync_status,
            SyncStatus::Synced
        );

        let bad = message(
            MessageType::SyncStatusUpdate,
            json!({
                "entityType": "metric",
                "entityId": record.local_id.to_string(),
                "syncStatus": "teleported",
                "timestamp": "2024-05-01T12:00:00Z"
            }),
        );
        assert!(matches!(processor.process(&bad), Err(SyncError::Decode(_))));
    }
}
