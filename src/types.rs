//! Core types for vitalsync

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Stable local identity of a record, assigned at creation and never reused
pub type LocalId = Uuid;

/// Per-record sync lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
    Conflict,
}

impl SyncStatus {
    pub const ALL: [SyncStatus; 5] = [
        SyncStatus::Pending,
        SyncStatus::Syncing,
        SyncStatus::Synced,
        SyncStatus::Failed,
        SyncStatus::Conflict,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::Conflict => "conflict",
        }
    }

    /// Whether `self -> next` is one of the allowed lifecycle edges
    pub fn can_transition_to(self, next: SyncStatus) -> bool {
        use SyncStatus::*;
        matches!(
            (self, next),
            (Pending, Syncing)
                | (Syncing, Synced)
                | (Syncing, Failed)
                | (Failed, Pending)
                | (Synced, Pending)
                | (_, Conflict)
                | (Conflict, Pending)
        )
    }

    /// Validate and perform a transition
    pub fn transition(self, next: SyncStatus) -> Result<SyncStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SyncError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Records in these states are picked up by the next push
    pub fn needs_sync(self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Failed)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            "conflict" => Ok(SyncStatus::Conflict),
            other => Err(SyncError::Decode(format!("unknown sync status: {}", other))),
        }
    }
}

/// Remote party a record is delivered to
///
/// Each channel keeps its own delivery state (status, remote identity, last
/// success, error) on the record, so a push on one never hides the record
/// from the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncChannel {
    /// Backend REST API, driven by the batch coordinators
    Backend,
    /// Cloud record database, driven by the replication engine
    Cloud,
}

impl SyncChannel {
    pub const ALL: [SyncChannel; 2] = [SyncChannel::Backend, SyncChannel::Cloud];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncChannel::Backend => "backend",
            SyncChannel::Cloud => "cloud",
        }
    }

    /// The channel whose copy goes stale when this one adopts a remote change
    pub fn other(self) -> SyncChannel {
        match self {
            SyncChannel::Backend => SyncChannel::Cloud,
            SyncChannel::Cloud => SyncChannel::Backend,
        }
    }
}

impl fmt::Display for SyncChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Syncable entity types; one batch coordinator runs per type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Metric,
    Insight,
    Analysis,
    Profile,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Metric,
        EntityType::Insight,
        EntityType::Analysis,
        EntityType::Profile,
    ];

    /// Name used in the local store
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Metric => "metric",
            EntityType::Insight => "insight",
            EntityType::Analysis => "analysis",
            EntityType::Profile => "profile",
        }
    }

    /// Record type name used by the cloud replication service
    pub fn cloud_record_type(&self) -> &'static str {
        match self {
            EntityType::Metric => "HealthMetric",
            EntityType::Insight => "AIInsight",
            EntityType::Analysis => "ActivityAnalysis",
            EntityType::Profile => "UserProfile",
        }
    }

    /// Resolve a cloud record type name
    pub fn from_cloud_record_type(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|e| e.cloud_record_type() == name)
    }

    /// Backend path segment
    pub fn api_segment(&self) -> &'static str {
        match self {
            EntityType::Metric => "health-data",
            EntityType::Insight => "insights",
            EntityType::Analysis => "analyses",
            EntityType::Profile => "profile",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| SyncError::Decode(format!("unknown entity type: {}", s)))
    }
}

/// A locally owned record eligible for remote synchronization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord {
    pub local_id: LocalId,
    pub entity_type: EntityType,
    /// Assigned once the backend accepts the record. Views read through
    /// [`SyncChannel::Cloud`] carry the cloud record name here instead.
    pub remote_id: Option<String>,
    /// Owning profile, resolved through the store
    pub owner_id: Option<LocalId>,
    /// Last local modification time; drives last-write-wins
    pub timestamp: DateTime<Utc>,
    pub sync_status: SyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
    /// Business fields, opaque to the sync engine
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SyncableRecord {
    /// Create a fresh pending record
    pub fn new(entity_type: EntityType, payload: serde_json::Value) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            entity_type,
            remote_id: None,
            owner_id: None,
            timestamp: Utc::now(),
            sync_status: SyncStatus::Pending,
            last_synced_at: None,
            sync_error: None,
            payload,
        }
    }

    pub fn with_owner(mut self, owner_id: LocalId) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A write of one channel's sync fields, committed in batches
#[derive(Debug, Clone, PartialEq)]
pub struct SyncUpdate {
    pub local_id: LocalId,
    pub channel: SyncChannel,
    pub status: SyncStatus,
    pub remote_id: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
    /// Timestamp observed when the sync attempt started. If the record was
    /// edited since, a `Synced` outcome is stored as `Pending` instead.
    pub expected_timestamp: Option<DateTime<Utc>>,
}

impl SyncUpdate {
    pub fn status(local_id: LocalId, status: SyncStatus) -> Self {
        Self {
            local_id,
            channel: SyncChannel::Backend,
            status,
            remote_id: None,
            last_synced_at: None,
            sync_error: None,
            expected_timestamp: None,
        }
    }

    pub fn synced(record: &SyncableRecord, remote_id: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            local_id: record.local_id,
            channel: SyncChannel::Backend,
            status: SyncStatus::Synced,
            remote_id: remote_id.or_else(|| record.remote_id.clone()),
            last_synced_at: Some(at),
            sync_error: None,
            expected_timestamp: Some(record.timestamp),
        }
    }

    pub fn failed(record: &SyncableRecord, error: impl Into<String>) -> Self {
        Self {
            local_id: record.local_id,
            channel: SyncChannel::Backend,
            status: SyncStatus::Failed,
            remote_id: record.remote_id.clone(),
            last_synced_at: record.last_synced_at,
            sync_error: Some(error.into()),
            expected_timestamp: None,
        }
    }

    /// Target another channel's delivery state (default: backend)
    pub fn on(mut self, channel: SyncChannel) -> Self {
        self.channel = channel;
        self
    }
}

/// Read-only snapshot of one coordinator, published to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySyncState {
    pub entity_type: EntityType,
    pub is_syncing: bool,
    pub pending_count: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl EntitySyncState {
    pub fn idle(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            is_syncing: false,
            pending_count: 0,
            last_sync: None,
            last_error: None,
        }
    }
}

/// Aggregated status across every channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOverview {
    pub entities: Vec<EntitySyncState>,
    pub queued_operations: usize,
    pub dead_letters: usize,
    pub online: bool,
    /// Most recent user-visible failure from any component
    pub last_error: Option<String>,
}

/// Storage mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// WAL journal, best for a single local process
    #[default]
    Local,
    /// DELETE journal, safe inside folders replicated by file-sync tools
    CloudSafe,
}

/// Local store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    pub db_path: String,
    #[serde(default)]
    pub storage_mode: StorageMode,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "~/.local/share/vitalsync/sync.db".to_string(),
            storage_mode: StorageMode::Local,
        }
    }
}

/// Batch coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Largest number of records per upload request
    pub batch_size: usize,
    /// Upper bound on records loaded per `sync()` run
    pub fetch_limit: Option<usize>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            fetch_limit: None,
        }
    }
}

/// Offline queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Failures tolerated before an operation is dead-lettered
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// Periodic processing interval while online
    pub process_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base_ms: 5_000,
            retry_max_ms: 60_000,
            process_interval_secs: 60,
        }
    }
}

impl QueueConfig {
    pub fn process_interval(&self) -> Duration {
        Duration::from_secs(self.process_interval_secs.max(1))
    }
}

/// Cloud replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub zone_name: String,
    pub subscription_id: String,
    /// Records per modify/fetch operation, clamped to the provider ceiling
    pub batch_size: usize,
    pub max_attempts: u32,
    /// Number of failures retained for diagnostics
    pub error_history: usize,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            zone_name: "HealthData".to_string(),
            subscription_id: "health-data-changes".to_string(),
            batch_size: 400,
            max_attempts: 3,
            error_history: 50,
        }
    }
}

/// Real-time channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub url: String,
    pub client_type: String,
    pub client_id: String,
    pub client_version: String,
    pub heartbeat_interval_secs: u64,
    /// Treat the connection as dead after this much inbound silence
    pub pong_timeout_secs: Option<u64>,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub history_size: usize,
    pub connect_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: "wss://localhost/ws".to_string(),
            client_type: "vitalsync".to_string(),
            client_id: "vitalsync-client".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat_interval_secs: 30,
            pong_timeout_secs: None,
            reconnect_base_ms: 5_000,
            reconnect_max_ms: 60_000,
            history_size: 100,
            connect_timeout_secs: 30,
        }
    }
}

impl RealtimeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Backend API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub request_timeout_secs: u64,
    pub resource_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api/v1".to_string(),
            max_retries: 3,
            retry_base_ms: 1_000,
            retry_max_ms: 60_000,
            cache_ttl_secs: 300,
            cache_max_entries: 100,
            request_timeout_secs: 30,
            resource_timeout_secs: 300,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn resource_timeout(&self) -> Duration {
        Duration::from_secs(self.resource_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub storage: StorageConfig,
    pub coordinator: CoordinatorConfig,
    pub queue: QueueConfig,
    pub cloud: CloudConfig,
    pub realtime: RealtimeConfig,
    pub api: ApiConfig,
    /// Interval of the periodic full sync (0 = disabled)
    pub full_sync_interval_secs: u64,
}

impl SyncConfig {
    /// Reject settings that would make components misbehave
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.batch_size == 0 {
            return Err(SyncError::Config("coordinator.batch_size must be > 0".into()));
        }
        if self.cloud.batch_size == 0 {
            return Err(SyncError::Config("cloud.batch_size must be > 0".into()));
        }
        if self.cloud.zone_name.trim().is_empty() {
            return Err(SyncError::Config("cloud.zone_name must not be empty".into()));
        }
        if self.queue.retry_base_ms > self.queue.retry_max_ms {
            return Err(SyncError::Config(
                "queue.retry_base_ms cannot exceed queue.retry_max_ms".into(),
            ));
        }
        if self.api.retry_base_ms > self.api.retry_max_ms {
            return Err(SyncError::Config(
                "api.retry_base_ms cannot exceed api.retry_max_ms".into(),
            ));
        }
        if self.realtime.reconnect_base_ms > self.realtime.reconnect_max_ms {
            return Err(SyncError::Config(
                "realtime.reconnect_base_ms cannot exceed realtime.reconnect_max_ms".into(),
            ));
        }
        if self.realtime.history_size == 0 {
            return Err(SyncError::Config("realtime.history_size must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_transitions() {
        use SyncStatus::*;
        assert!(Pending.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Synced));
        assert!(Syncing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Synced.can_transition_to(Pending));
        assert!(Conflict.can_transition_to(Pending));
        for s in SyncStatus::ALL {
            assert!(s.can_transition_to(Conflict));
        }
    }

    #[test]
    fn test_rejected_transitions() {
        use SyncStatus::*;
        assert!(Pending.transition(Synced).is_err());
        assert!(Failed.transition(Syncing).is_err());
        assert!(Synced.transition(Failed).is_err());
        assert!(Conflict.transition(Synced).is_err());
        assert!(matches!(
            Pending.transition(Failed),
            Err(SyncError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for s in SyncStatus::ALL {
            assert_eq!(s.as_str().parse::<SyncStatus>().unwrap(), s);
        }
        assert!("done".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_entity_cloud_names() {
        for e in EntityType::ALL {
            assert_eq!(EntityType::from_cloud_record_type(e.cloud_record_type()), Some(e));
        }
        assert_eq!(EntityType::from_cloud_record_type("Unknown"), None);
    }

    #[test]
    fn test_config_validation() {
        assert!(SyncConfig::default().validate().is_ok());

        let mut config = SyncConfig::default();
        config.coordinator.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.realtime.reconnect_base_ms = 120_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_partial_json() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"queue": {"max_retries": 2}}"#).unwrap();
        assert_eq!(config.queue.max_retries, 2);
        assert_eq!(config.queue.retry_base_ms, 5_000);
        assert_eq!(config.coordinator.batch_size, 100);
    }
}
