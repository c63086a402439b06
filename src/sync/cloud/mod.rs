//! Replication to a per-user cloud record database
//!
//! Records live in one custom zone. Uploads are batched, downloads follow a
//! server change token that is persisted only after the changes it covers
//! have been committed locally.

mod engine;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::conflict::RemoteRecord;
use crate::error::{Result, SyncError};
use crate::types::{EntityType, SyncableRecord};

pub use engine::{
    change_token_key,
    CloudReplicationEngine, CloudSyncFailure, CloudSyncReport, CloudSyncState, DownloadSummary,
    UploadSummary,
};
pub use memory::{InjectedFailure, MemoryCloudDatabase};

/// Provider ceiling on records per modify/fetch operation
pub const MAX_CLOUD_BATCH: usize = 400;

/// Cloud account availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Available,
    NoAccount,
    Restricted,
    CouldNotDetermine,
}

impl AccountStatus {
    /// Reason sync is disabled, `None` when the account is usable
    pub fn disabled_reason(self) -> Option<&'static str> {
        match self {
            AccountStatus::Available => None,
            AccountStatus::NoAccount => Some("No cloud account"),
            AccountStatus::Restricted => Some("Cloud account restricted"),
            AccountStatus::CouldNotDetermine => Some("Could not determine cloud account status"),
        }
    }
}

/// A record as stored in the cloud database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudRecord {
    /// Local identity as a string; stable across devices
    pub record_name: String,
    pub record_type: String,
    /// `{"owner_id": ..., "payload": ...}`
    pub fields: Value,
    pub modified_at: DateTime<Utc>,
}

impl CloudRecord {
    pub fn from_local(record: &SyncableRecord) -> Self {
        Self {
            record_name: record.local_id.to_string(),
            record_type: record.entity_type.cloud_record_type().to_string(),
            fields: json!({
                "owner_id": record.owner_id,
                "payload": record.payload,
            }),
            modified_at: record.timestamp,
        }
    }

    /// Convert back into a mergeable remote record
    pub fn to_remote(&self) -> Result<RemoteRecord> {
        let entity_type = EntityType::from_cloud_record_type(&self.record_type).ok_or_else(|| {
            SyncError::Decode(format!("unknown record type: {}", self.record_type))
        })?;
        let local_id = Uuid::parse_str(&self.record_name).map_err(|e| {
            SyncError::Decode(format!("record name {} is not a uuid: {}", self.record_name, e))
        })?;
        let owner_id = match self.fields.get("owner_id") {
            None | Some(Value::Null) => None,
            Some(v) => Some(serde_json::from_value::<Uuid>(v.clone()).map_err(|e| {
                SyncError::Decode(format!("record {}: bad owner_id: {}", self.record_name, e))
            })?),
        };

        Ok(RemoteRecord {
            entity_type,
            remote_id: self.record_name.clone(),
            local_id: Some(local_id),
            owner_id,
            modified_at: self.modified_at,
            payload: self.fields.get("payload").cloned().unwrap_or(Value::Null),
        })
    }
}

/// One page of the zone change feed
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub records: Vec<CloudRecord>,
    /// Token to resume from after this page
    pub token: String,
    pub more_coming: bool,
}

/// Per-record outcome of a modify operation
pub type RecordResult = (String, Result<()>);

/// Cloud record database, scoped to the signed-in account
#[async_trait]
pub trait CloudDatabase: Send + Sync {
    async fn account_status(&self) -> Result<AccountStatus>;

    /// Create a zone; an existing zone yields `ZoneAlreadyExists`
    async fn save_zone(&self, zone: &str) -> Result<()>;

    async fn save_subscription(&self, zone: &str, subscription_id: &str) -> Result<()>;

    /// Save records. An `Err` fails the whole operation; otherwise each
    /// record carries its own result.
    async fn modify_records(&self, zone: &str, records: &[CloudRecord])
        -> Result<Vec<RecordResult>>;

    /// Changes after `token` (from the beginning when `None`)
    async fn fetch_changes(&self, zone: &str, token: Option<&str>, limit: usize)
        -> Result<ChangeBatch>;

    fn max_batch_size(&self) -> usize {
        MAX_CLOUD_BATCH
    }
}
