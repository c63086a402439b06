//! Local persistence store
//!
//! SQLite-backed storage for syncable records, settings, per-entity sync
//! state and the durable offline operation queue. Components depend on the
//! store traits rather than on [`Storage`] directly.

mod connection;
mod migrations;
pub mod operations;
pub mod records;
pub mod settings;

pub use connection::Storage;
pub use migrations::SCHEMA_VERSION;

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::queue::{DeadLetter, OfflineOperation};
use crate::sync::conflict::{MergeSummary, RemoteRecord};
use crate::types::{EntityType, LocalId, SyncChannel, SyncStatus, SyncUpdate, SyncableRecord};

/// Fixed-width RFC 3339 so stored timestamps sort lexically
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// CRUD and predicate queries over syncable records
///
/// Delivery state is kept per [`SyncChannel`]. Methods without a channel
/// argument read and write the backend's state.
pub trait RecordStore: Send + Sync {
    /// Insert or replace a record (content and backend state)
    fn save_record(&self, record: &SyncableRecord) -> Result<()>;

    /// Record with `channel`'s delivery state in its sync fields
    fn get_record_on(&self, channel: SyncChannel, local_id: LocalId)
        -> Result<Option<SyncableRecord>>;

    fn find_by_remote_id_on(
        &self,
        channel: SyncChannel,
        entity_type: EntityType,
        remote_id: &str,
    ) -> Result<Option<SyncableRecord>>;

    /// Local edit of business fields; moves the record back to `pending`
    fn update_local(&self, local_id: LocalId, payload: &serde_json::Value)
        -> Result<SyncableRecord>;

    fn delete_record(&self, local_id: LocalId) -> Result<bool>;

    /// `pending` and `failed` records of one entity type on `channel`,
    /// oldest first
    fn records_needing_sync_on(
        &self,
        channel: SyncChannel,
        entity_type: EntityType,
        limit: Option<usize>,
    ) -> Result<Vec<SyncableRecord>>;

    fn records_with_status_on(
        &self,
        channel: SyncChannel,
        entity_type: Option<EntityType>,
        status: SyncStatus,
    ) -> Result<Vec<SyncableRecord>>;

    fn count_with_status_on(
        &self,
        channel: SyncChannel,
        entity_type: Option<EntityType>,
        statuses: &[SyncStatus],
    ) -> Result<usize>;

    /// Atomically move claimable records to `syncing` on `channel`; returns
    /// the ids this caller now owns
    fn claim_for_sync(&self, channel: SyncChannel, ids: &[LocalId]) -> Result<Vec<LocalId>>;

    /// Write sync fields for many records atomically
    fn commit_sync_updates(&self, updates: &[SyncUpdate]) -> Result<usize>;

    /// Merge records delivered by `channel` with last-write-wins atomically
    fn apply_remote_changes_on(
        &self,
        channel: SyncChannel,
        remote: &[RemoteRecord],
    ) -> Result<MergeSummary>;

    /// `conflict` -> `pending` on `channel`; returns how many moved
    fn resolve_conflicts_on(&self, channel: SyncChannel) -> Result<usize>;

    /// Settled records back to `pending` on `channel`
    fn reset_channel(&self, channel: SyncChannel) -> Result<usize>;

    /// Every record back to `pending` on every channel; returns how many
    /// records were reset
    fn reset_sync_status(&self) -> Result<usize>;

    /// `syncing` -> `failed` on every channel for deliveries left behind by
    /// an interrupted run
    fn recover_interrupted(&self) -> Result<usize>;

    fn sync_state(&self, entity_type: EntityType)
        -> Result<(Option<DateTime<Utc>>, Option<String>)>;

    fn record_sync_result(
        &self,
        entity_type: EntityType,
        last_sync: Option<DateTime<Utc>>,
        last_error: Option<&str>,
    ) -> Result<()>;

    fn get_record(&self, local_id: LocalId) -> Result<Option<SyncableRecord>> {
        self.get_record_on(SyncChannel::Backend, local_id)
    }

    fn find_by_remote_id(
        &self,
        entity_type: EntityType,
        remote_id: &str,
    ) -> Result<Option<SyncableRecord>> {
        self.find_by_remote_id_on(SyncChannel::Backend, entity_type, remote_id)
    }

    fn records_needing_sync(
        &self,
        entity_type: EntityType,
        limit: Option<usize>,
    ) -> Result<Vec<SyncableRecord>> {
        self.records_needing_sync_on(SyncChannel::Backend, entity_type, limit)
    }

    fn records_with_status(
        &self,
        entity_type: Option<EntityType>,
        status: SyncStatus,
    ) -> Result<Vec<SyncableRecord>> {
        self.records_with_status_on(SyncChannel::Backend, entity_type, status)
    }

    fn count_with_status(
        &self,
        entity_type: Option<EntityType>,
        statuses: &[SyncStatus],
    ) -> Result<usize> {
        self.count_with_status_on(SyncChannel::Backend, entity_type, statuses)
    }

    fn apply_remote_changes(&self, remote: &[RemoteRecord]) -> Result<MergeSummary> {
        self.apply_remote_changes_on(SyncChannel::Backend, remote)
    }

    fn resolve_conflicts(&self) -> Result<usize> {
        self.resolve_conflicts_on(SyncChannel::Backend)
    }
}

/// Small process-wide configuration values (change tokens, cursors)
pub trait KeyValueStore: Send + Sync {
    fn get_value(&self, key: &str) -> Result<Option<String>>;
    fn set_value(&self, key: &str, value: &str) -> Result<()>;
    fn remove_value(&self, key: &str) -> Result<bool>;
}

/// Durable storage for the offline operation queue
pub trait OperationStore: Send + Sync {
    /// Insert, or update in place keeping queue position
    fn save_operation(&self, op: &OfflineOperation) -> Result<()>;
    fn due_operations(&self, now: DateTime<Utc>) -> Result<Vec<OfflineOperation>>;
    fn all_operations(&self) -> Result<Vec<OfflineOperation>>;
    fn get_operation(&self, id: Uuid) -> Result<Option<OfflineOperation>>;
    fn delete_operation(&self, id: Uuid) -> Result<bool>;
    fn count_operations(&self) -> Result<usize>;
    fn clear_operations(&self) -> Result<usize>;
    /// Atomically move an operation to the dead-letter table
    fn dead_letter(&self, op: &OfflineOperation, error: &str) -> Result<DeadLetter>;
    fn dead_letters(&self) -> Result<Vec<DeadLetter>>;
    fn count_dead_letters(&self) -> Result<usize>;
    fn requeue_dead_letter(&self, id: Uuid) -> Result<OfflineOperation>;
}

impl RecordStore for Storage {
    fn save_record(&self, record: &SyncableRecord) -> Result<()> {
        self.with_transaction(|conn| records::upsert_record(conn, record))
    }

    fn get_record_on(
        &self,
        channel: SyncChannel,
        local_id: LocalId,
    ) -> Result<Option<SyncableRecord>> {
        self.with_connection(|conn| records::get_record_on(conn, channel, local_id))
    }

    fn find_by_remote_id_on(
        &self,
        channel: SyncChannel,
        entity_type: EntityType,
        remote_id: &str,
    ) -> Result<Option<SyncableRecord>> {
        self.with_connection(|conn| {
            records::find_by_remote_id_on(conn, channel, entity_type, remote_id)
        })
    }

    fn update_local(
        &self,
        local_id: LocalId,
        payload: &serde_json::Value,
    ) -> Result<SyncableRecord> {
        self.with_transaction(|conn| records::update_local(conn, local_id, payload, Utc::now()))
    }

    fn delete_record(&self, local_id: LocalId) -> Result<bool> {
        self.with_connection(|conn| records::delete_record(conn, local_id))
    }

    fn records_needing_sync_on(
        &self,
        channel: SyncChannel,
        entity_type: EntityType,
        limit: Option<usize>,
    ) -> Result<Vec<SyncableRecord>> {
        self.with_connection(|conn| {
            records::records_needing_sync(conn, channel, entity_type, limit)
        })
    }

    fn records_with_status_on(
        &self,
        channel: SyncChannel,
        entity_type: Option<EntityType>,
        status: SyncStatus,
    ) -> Result<Vec<SyncableRecord>> {
        self.with_connection(|conn| {
            records::records_with_status(conn, channel, entity_type, status)
        })
    }

    fn count_with_status_on(
        &self,
        channel: SyncChannel,
        entity_type: Option<EntityType>,
        statuses: &[SyncStatus],
    ) -> Result<usize> {
        self.with_connection(|conn| {
            records::count_with_status(conn, channel, entity_type, statuses)
        })
    }

    fn claim_for_sync(&self, channel: SyncChannel, ids: &[LocalId]) -> Result<Vec<LocalId>> {
        self.with_transaction(|conn| records::claim_for_sync(conn, channel, ids))
    }

    fn commit_sync_updates(&self, updates: &[SyncUpdate]) -> Result<usize> {
        self.with_transaction(|conn| records::commit_sync_updates(conn, updates))
    }

    fn apply_remote_changes_on(
        &self,
        channel: SyncChannel,
        remote: &[RemoteRecord],
    ) -> Result<MergeSummary> {
        self.with_transaction(|conn| {
            records::apply_remote_records(conn, channel, remote, Utc::now())
        })
    }

    fn resolve_conflicts_on(&self, channel: SyncChannel) -> Result<usize> {
        self.with_connection(|conn| {
            records::move_status(conn, channel, SyncStatus::Conflict, SyncStatus::Pending, None)
        })
    }

    fn reset_channel(&self, channel: SyncChannel) -> Result<usize> {
        self.with_connection(|conn| records::reset_pending(conn, channel))
    }

    fn reset_sync_status(&self) -> Result<usize> {
        self.with_transaction(|conn| {
            let reset = records::count_resettable(conn)?;
            for channel in SyncChannel::ALL {
                records::reset_pending(conn, channel)?;
            }
            Ok(reset)
        })
    }

    fn recover_interrupted(&self) -> Result<usize> {
        self.with_transaction(|conn| {
            let mut recovered = 0;
            for channel in SyncChannel::ALL {
                recovered += records::move_status(
                    conn,
                    channel,
                    SyncStatus::Syncing,
                    SyncStatus::Failed,
                    Some("sync interrupted"),
                )?;
            }
            Ok(recovered)
        })
    }

    fn sync_state(
        &self,
        entity_type: EntityType,
    ) -> Result<(Option<DateTime<Utc>>, Option<String>)> {
        self.with_connection(|conn| records::get_sync_state(conn, entity_type))
    }

    fn record_sync_result(
        &self,
        entity_type: EntityType,
        last_sync: Option<DateTime<Utc>>,
        last_error: Option<&str>,
    ) -> Result<()> {
        self.with_connection(|conn| {
            records::record_sync_result(conn, entity_type, last_sync, last_error)
        })
    }
}

impl KeyValueStore for Storage {
    fn get_value(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| settings::get_value(conn, key))
    }

    fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.with_connection(|conn| settings::set_value(conn, key, value))
    }

    fn remove_value(&self, key: &str) -> Result<bool> {
        self.with_connection(|conn| settings::remove_value(conn, key))
    }
}

impl OperationStore for Storage {
    fn save_operation(&self, op: &OfflineOperation) -> Result<()> {
        self.with_connection(|conn| operations::save_operation(conn, op))
    }

    fn due_operations(&self, now: DateTime<Utc>) -> Result<Vec<OfflineOperation>> {
        self.with_connection(|conn| operations::due_operations(conn, now))
    }

    fn all_operations(&self) -> Result<Vec<OfflineOperation>> {
        self.with_connection(operations::all_operations)
    }

    fn get_operation(&self, id: Uuid) -> Result<Option<OfflineOperation>> {
        self.with_connection(|conn| operations::get_operation(conn, id))
    }

    fn delete_operation(&self, id: Uuid) -> Result<bool> {
        self.with_connection(|conn| operations::delete_operation(conn, id))
    }

    fn count_operations(&self) -> Result<usize> {
        self.with_connection(operations::count_operations)
    }

    fn clear_operations(&self) -> Result<usize> {
        self.with_connection(operations::clear_operations)
    }

    fn dead_letter(&self, op: &OfflineOperation, error: &str) -> Result<DeadLetter> {
        self.with_transaction(|conn| operations::dead_letter(conn, op, error))
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.with_connection(operations::dead_letters)
    }

    fn count_dead_letters(&self) -> Result<usize> {
        self.with_connection(operations::count_dead_letters)
    }

    fn requeue_dead_letter(&self, id: Uuid) -> Result<OfflineOperation> {
        self.with_transaction(|conn| operations::requeue_dead_letter(conn, id))
    }
}
