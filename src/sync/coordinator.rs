//! Chunked push/pull of one entity type against the backend

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::conflict::MergeSummary;
use crate::api::BackendGateway;
use crate::error::{Result, SyncError};
use crate::storage::{KeyValueStore, RecordStore};
use crate::types::{
    CoordinatorConfig, EntitySyncState, EntityType, LocalId, SyncChannel, SyncStatus, SyncUpdate,
    SyncableRecord,
};

/// Result of one push
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Another run was in flight; nothing was done
    pub skipped: bool,
    /// Stopped before every chunk was sent
    pub interrupted: bool,
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Upload requests issued
    pub chunks: usize,
}

/// Result of one pull
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReport {
    pub skipped: bool,
    pub fetched: usize,
    pub merge: MergeSummary,
}

/// Clears the in-flight flag when a run ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Pushes local changes of one entity type in bounded chunks and pulls
/// remote changes back. At most one run is active per coordinator.
pub struct BatchSyncCoordinator {
    entity: EntityType,
    records: Arc<dyn RecordStore>,
    settings: Arc<dyn KeyValueStore>,
    gateway: Arc<dyn BackendGateway>,
    config: CoordinatorConfig,
    in_flight: AtomicBool,
    cancelled: AtomicBool,
    state: watch::Sender<EntitySyncState>,
}

impl BatchSyncCoordinator {
    pub fn new(
        entity: EntityType,
        records: Arc<dyn RecordStore>,
        settings: Arc<dyn KeyValueStore>,
        gateway: Arc<dyn BackendGateway>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        let (last_sync, last_error) = records.sync_state(entity)?;
        let pending_count =
            records.count_with_status(Some(entity), &[SyncStatus::Pending, SyncStatus::Failed])?;
        let (state, _) = watch::channel(EntitySyncState {
            entity_type: entity,
            is_syncing: false,
            pending_count,
            last_sync,
            last_error,
        });

        Ok(Self {
            entity,
            records,
            settings,
            gateway,
            config,
            in_flight: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            state,
        })
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity
    }

    pub fn subscribe(&self) -> watch::Receiver<EntitySyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> EntitySyncState {
        self.state.borrow().clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Ask the active run to stop at the next chunk boundary
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn try_begin(&self) -> Option<InFlight<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.cancelled.store(false, Ordering::SeqCst);
        Some(InFlight(&self.in_flight))
    }

    /// Push every `pending`/`failed` record of this entity type
    pub async fn sync(&self) -> Result<SyncReport> {
        let Some(_guard) = self.try_begin() else {
            tracing::debug!(entity = %self.entity, "Sync already in flight");
            return Ok(SyncReport {
                skipped: true,
                ..Default::default()
            });
        };

        let records = match self
            .records
            .records_needing_sync(self.entity, self.config.fetch_limit)
        {
            Ok(records) => records,
            Err(e) => {
                self.abort(&[], &e);
                return Err(e);
            }
        };
        if records.is_empty() {
            self.publish(|s| s.pending_count = 0);
            return Ok(SyncReport::default());
        }

        self.push(records).await
    }

    /// Push a caller-chosen set of records (e.g. after a bulk write)
    pub async fn sync_batch(&self, records: Vec<SyncableRecord>) -> Result<SyncReport> {
        let Some(_guard) = self.try_begin() else {
            return Ok(SyncReport {
                skipped: true,
                ..Default::default()
            });
        };

        let (eligible, ignored): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| r.entity_type == self.entity && r.sync_status.needs_sync());
        if !ignored.is_empty() {
            tracing::debug!(
                entity = %self.entity,
                ignored = ignored.len(),
                "Ignoring records that are not awaiting sync"
            );
        }
        if eligible.is_empty() {
            return Ok(SyncReport::default());
        }

        self.push(eligible).await
    }

    async fn push(&self, records: Vec<SyncableRecord>) -> Result<SyncReport> {
        // pending/failed -> syncing, persisted before any network call
        let ids: Vec<LocalId> = records.iter().map(|r| r.local_id).collect();
        let claimed: HashSet<LocalId> = match self.records.claim_for_sync(SyncChannel::Backend, &ids)
        {
            Ok(claimed) => claimed.into_iter().collect(),
            Err(e) => {
                self.abort(&[], &e);
                return Err(e);
            }
        };
        let records: Vec<SyncableRecord> = records
            .into_iter()
            .filter(|r| claimed.contains(&r.local_id))
            .collect();

        let mut report = SyncReport {
            attempted: records.len(),
            ..Default::default()
        };
        if records.is_empty() {
            return Ok(report);
        }
        self.publish(|s| s.is_syncing = true);

        tracing::info!(entity = %self.entity, records = records.len(), "Sync started");

        let batch_size = self.config.batch_size.max(1);
        let mut updates = Vec::with_capacity(records.len());
        let mut chunk_error: Option<String> = None;

        for chunk in records.chunks(batch_size) {
            if self.cancelled.load(Ordering::SeqCst) {
                report.interrupted = true;
                updates.extend(chunk.iter().map(|r| SyncUpdate::failed(r, "sync cancelled")));
                continue;
            }

            report.chunks += 1;
            let result = self.gateway.upload_batch(self.entity, chunk).await;

            // A result that raced with stop() is discarded
            if self.cancelled.load(Ordering::SeqCst) {
                tracing::debug!(
                    entity = %self.entity,
                    size = chunk.len(),
                    "Discarding chunk result after stop"
                );
                report.interrupted = true;
                updates.extend(chunk.iter().map(|r| SyncUpdate::failed(r, "sync cancelled")));
                continue;
            }
            let now = Utc::now();

            match result {
                Ok(outcomes) => {
                    for record in chunk {
                        let outcome = outcomes.iter().find(|o| o.local_id == record.local_id);
                        updates.push(match outcome.map(|o| &o.result) {
                            Some(Ok(remote_id)) => {
                                SyncUpdate::synced(record, Some(remote_id.clone()), now)
                            }
                            Some(Err(e)) => SyncUpdate::failed(record, e.clone()),
                            None => SyncUpdate::failed(record, "no result for record"),
                        });
                    }
                    tracing::debug!(entity = %self.entity, size = chunk.len(), "Chunk uploaded");
                }
                Err(e) => {
                    tracing::warn!(
                        entity = %self.entity,
                        size = chunk.len(),
                        "Chunk upload failed: {}",
                        e
                    );
                    let message = e.to_string();
                    updates.extend(chunk.iter().map(|r| SyncUpdate::failed(r, message.clone())));
                    chunk_error = Some(message);
                }
            }
        }

        report.synced = updates
            .iter()
            .filter(|u| u.status == SyncStatus::Synced)
            .count();
        report.failed = updates.len() - report.synced;

        if let Err(e) = self.records.commit_sync_updates(&updates) {
            tracing::error!(entity = %self.entity, "Committing sync results failed: {}", e);
            self.abort(&records, &e);
            return Err(e);
        }

        let last_error = chunk_error.or_else(|| {
            (report.failed > 0)
                .then(|| format!("{} of {} records failed", report.failed, report.attempted))
        });
        let last_sync = (report.chunks > 0 && report.synced > 0).then(Utc::now);
        if let Err(e) = self.finish(last_sync, last_error) {
            self.abort(&[], &e);
            return Err(e);
        }

        tracing::info!(
            entity = %self.entity,
            synced = report.synced,
            failed = report.failed,
            chunks = report.chunks,
            "Sync finished"
        );
        Ok(report)
    }

    fn cursor_key(&self) -> String {
        format!("backend.pull_cursor.{}", self.entity)
    }

    /// Fetch remote changes since the saved cursor and merge them
    pub async fn pull(&self) -> Result<PullReport> {
        let Some(_guard) = self.try_begin() else {
            return Ok(PullReport {
                skipped: true,
                ..Default::default()
            });
        };

        match self.pull_changes().await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.abort(&[], &e);
                Err(e)
            }
        }
    }

    async fn pull_changes(&self) -> Result<PullReport> {
        let since = match self.settings.get_value(&self.cursor_key())? {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
            None => None,
        };

        self.publish(|s| s.is_syncing = true);
        let changes = self.gateway.fetch_changes(self.entity, since).await?;

        if self.cancelled.load(Ordering::SeqCst) {
            self.finish(None, None)?;
            return Ok(PullReport::default());
        }

        let merge = self.records.apply_remote_changes(&changes)?;

        // Cursor advances only after the merge has committed
        if let Some(newest) = changes.iter().map(|c| c.modified_at).max() {
            self.settings.set_value(
                &self.cursor_key(),
                &newest.to_rfc3339_opts(SecondsFormat::Micros, true),
            )?;
        }

        self.finish(None, None)?;
        tracing::info!(
            entity = %self.entity,
            fetched = changes.len(),
            applied = merge.applied(),
            conflicts = merge.conflicts,
            "Pull finished"
        );

        Ok(PullReport {
            skipped: false,
            fetched: changes.len(),
            merge,
        })
    }

    fn finish(&self, last_sync: Option<DateTime<Utc>>, last_error: Option<String>) -> Result<()> {
        self.records
            .record_sync_result(self.entity, last_sync, last_error.as_deref())?;
        let pending_count = self
            .records
            .count_with_status(Some(self.entity), &[SyncStatus::Pending, SyncStatus::Failed])?;

        self.publish(|s| {
            s.is_syncing = false;
            s.pending_count = pending_count;
            if last_sync.is_some() {
                s.last_sync = last_sync;
            }
            s.last_error = last_error;
        });
        Ok(())
    }

    /// End a run that failed after claiming `in_flight`: release the claimed
    /// records to `failed` and surface the error. Best effort; the store may
    /// be the thing that is failing.
    fn abort(&self, in_flight: &[SyncableRecord], error: &SyncError) {
        let message = error.to_string();

        if !in_flight.is_empty() {
            let release: Vec<SyncUpdate> = in_flight
                .iter()
                .map(|r| SyncUpdate::failed(r, message.clone()))
                .collect();
            if let Err(e) = self.records.commit_sync_updates(&release) {
                tracing::error!(
                    entity = %self.entity,
                    records = in_flight.len(),
                    "Could not release in-flight records: {}",
                    e
                );
            }
        }

        if let Err(e) = self.finish(None, Some(message.clone())) {
            tracing::error!(entity = %self.entity, "Could not record sync failure: {}", e);
            self.publish(|s| {
                s.is_syncing = false;
                s.last_error = Some(message);
            });
        }
    }

    fn publish(&self, f: impl FnOnce(&mut EntitySyncState)) {
        self.state.send_modify(f);
    }
}
