//! Last-write-wins conflict resolution
//!
//! Remote values win only when the remote modification time is strictly newer
//! than the local record's `timestamp`. Ties keep local.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{EntityType, LocalId, SyncStatus, SyncableRecord};

/// A record as delivered by a remote party (backend pull, cloud change feed,
/// real-time push)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub entity_type: EntityType,
    pub remote_id: String,
    /// Local identity, when the remote side knows it
    #[serde(default)]
    pub local_id: Option<LocalId>,
    #[serde(default)]
    pub owner_id: Option<LocalId>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Outcome of comparing a remote record with its local counterpart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// No local counterpart
    Insert,
    /// Local is newer or equal
    KeepLocal,
    /// Remote is newer and local has nothing unpushed
    AdoptRemote,
    /// Remote is newer but local had unpushed changes; remote values are
    /// adopted and the record is flagged for review
    AdoptRemoteConflict,
}

impl Resolution {
    pub fn adopts_remote(self) -> bool {
        !matches!(self, Resolution::KeepLocal)
    }
}

/// Decide how a remote record merges into the local store
pub fn resolve(local: Option<&SyncableRecord>, remote: &RemoteRecord) -> Resolution {
    let Some(local) = local else {
        return Resolution::Insert;
    };

    if remote.modified_at <= local.timestamp {
        return Resolution::KeepLocal;
    }

    match local.sync_status {
        SyncStatus::Synced | SyncStatus::Conflict => Resolution::AdoptRemote,
        SyncStatus::Pending | SyncStatus::Syncing | SyncStatus::Failed => {
            Resolution::AdoptRemoteConflict
        }
    }
}

/// Build the record that results from applying `resolution`
///
/// Returns `None` for [`Resolution::KeepLocal`].
pub fn merged_record(
    local: Option<&SyncableRecord>,
    remote: &RemoteRecord,
    resolution: Resolution,
    now: DateTime<Utc>,
) -> Option<SyncableRecord> {
    let status = match resolution {
        Resolution::KeepLocal => return None,
        Resolution::Insert | Resolution::AdoptRemote => SyncStatus::Synced,
        Resolution::AdoptRemoteConflict => SyncStatus::Conflict,
    };

    let local_id = local
        .map(|l| l.local_id)
        .or(remote.local_id)
        .unwrap_or_else(Uuid::new_v4);

    Some(SyncableRecord {
        local_id,
        entity_type: remote.entity_type,
        remote_id: Some(remote.remote_id.clone()),
        owner_id: remote.owner_id.or_else(|| local.and_then(|l| l.owner_id)),
        timestamp: remote.modified_at,
        sync_status: status,
        last_synced_at: Some(now),
        sync_error: None,
        payload: remote.payload.clone(),
    })
}

/// Counts produced by one merge pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub inserted: usize,
    pub updated: usize,
    pub conflicts: usize,
    pub kept_local: usize,
}

impl MergeSummary {
    pub fn record(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Insert => self.inserted += 1,
            Resolution::AdoptRemote => self.updated += 1,
            Resolution::AdoptRemoteConflict => {
                self.updated += 1;
                self.conflicts += 1;
            }
            Resolution::KeepLocal => self.kept_local += 1,
        }
    }

    pub fn absorb(&mut self, other: MergeSummary) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.conflicts += other.conflicts;
        self.kept_local += other.kept_local;
    }

    pub fn applied(&self) -> usize {
        self.inserted + self.updated
    }
}
