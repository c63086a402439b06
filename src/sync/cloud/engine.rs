//! Cloud replication engine

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::{AccountStatus, CloudDatabase, CloudRecord};
use crate::error::{Result, SyncError};
use crate::retry::{retry_with_backoff, Backoff, RetryPolicy};
use crate::storage::{KeyValueStore, RecordStore};
use crate::sync::conflict::MergeSummary;
use crate::types::{
    CloudConfig, EntityType, LocalId, SyncChannel, SyncStatus, SyncUpdate, SyncableRecord,
};

const LAST_SYNC_KEY: &str = "cloud.last_sync";

/// Settings key holding the server change token of `zone`
pub fn change_token_key(zone: &str) -> String {
    format!("cloud.change_token.{}", zone)
}

/// Observable engine state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CloudSyncState {
    Idle,
    Syncing,
    Synced,
    Error { message: String },
    Disabled { reason: String },
}

/// One entry of the failure history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudSyncFailure {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub record_name: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSummary {
    pub attempted: usize,
    pub uploaded: usize,
    pub failed: usize,
    /// modify operations issued
    pub batches: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSummary {
    pub pages: usize,
    pub fetched: usize,
    /// Records that could not be decoded
    pub skipped: usize,
    pub interrupted: bool,
    pub merge: MergeSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudSyncReport {
    /// Another run was in flight
    pub skipped: bool,
    pub upload: UploadSummary,
    pub download: DownloadSummary,
    pub conflicts_resolved: usize,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Replicates every entity type to one cloud zone
pub struct CloudReplicationEngine {
    db: Arc<dyn CloudDatabase>,
    records: Arc<dyn RecordStore>,
    settings: Arc<dyn KeyValueStore>,
    config: CloudConfig,
    backoff: Backoff,
    in_flight: AtomicBool,
    cancelled: AtomicBool,
    /// Set when the provider reports quota exhaustion
    quota_halted: AtomicBool,
    provisioned: AtomicBool,
    state: watch::Sender<CloudSyncState>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    failures: Mutex<VecDeque<CloudSyncFailure>>,
}

impl CloudReplicationEngine {
    pub fn new(
        db: Arc<dyn CloudDatabase>,
        records: Arc<dyn RecordStore>,
        settings: Arc<dyn KeyValueStore>,
        config: CloudConfig,
    ) -> Result<Self> {
        let last_sync = settings
            .get_value(LAST_SYNC_KEY)?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let (state, _) = watch::channel(CloudSyncState::Idle);

        Ok(Self {
            db,
            records,
            settings,
            config,
            backoff: Backoff::api(),
            in_flight: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            quota_halted: AtomicBool::new(false),
            provisioned: AtomicBool::new(false),
            state,
            last_sync: RwLock::new(last_sync),
            failures: Mutex::new(VecDeque::new()),
        })
    }

    /// Override the backoff used for transient provider errors
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<CloudSyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> CloudSyncState {
        self.state.borrow().clone()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read()
    }

    /// Recent failures, oldest first
    pub fn failures(&self) -> Vec<CloudSyncFailure> {
        self.failures.lock().iter().cloned().collect()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_upload_halted(&self) -> bool {
        self.quota_halted.load(Ordering::SeqCst)
    }

    /// Clear the quota halt so the next upload contacts the provider again
    pub fn resume_uploads(&self) {
        if self.quota_halted.swap(false, Ordering::SeqCst) {
            tracing::info!("Cloud uploads resumed");
        }
    }

    /// Cancel in-flight work at the next batch boundary
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.state.send_if_modified(|s| {
            if matches!(s, CloudSyncState::Disabled { .. }) {
                return false;
            }
            *s = CloudSyncState::Idle;
            true
        });
    }

    fn token_key(&self) -> String {
        change_token_key(&self.config.zone_name)
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size.min(self.db.max_batch_size()).max(1)
    }

    fn try_begin(&self) -> Option<InFlight<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.cancelled.store(false, Ordering::SeqCst);
        Some(InFlight(&self.in_flight))
    }

    fn record_failure(&self, operation: &str, record_name: Option<&str>, message: impl Into<String>) {
        let mut failures = self.failures.lock();
        failures.push_back(CloudSyncFailure {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            record_name: record_name.map(str::to_string),
            message: message.into(),
        });
        while failures.len() > self.config.error_history {
            failures.pop_front();
        }
    }

    /// Check the account, provision the zone and run the initial sync.
    /// Returns `None` when the account is unusable.
    pub async fn start(&self) -> Result<Option<CloudSyncReport>> {
        let status = match self.db.account_status().await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Cloud account status unavailable: {}", e);
                self.record_failure("accountStatus", None, e.to_string());
                AccountStatus::CouldNotDetermine
            }
        };

        if let Some(reason) = status.disabled_reason() {
            tracing::info!(reason, "Cloud sync disabled");
            self.state.send_replace(CloudSyncState::Disabled {
                reason: reason.to_string(),
            });
            return Ok(None);
        }

        self.state.send_replace(CloudSyncState::Idle);
        self.run("initialSync").await.map(Some)
    }

    /// Create the zone (an existing zone counts as success) and the change
    /// subscription
    pub async fn provision(&self) -> Result<()> {
        let db = &self.db;
        let zone = self.config.zone_name.as_str();

        let created =
            retry_with_backoff(RetryPolicy::Standard, self.backoff, self.config.max_attempts, move |_| {
                db.save_zone(zone)
            })
            .await;
        match created {
            Ok(()) => tracing::info!(zone, "Cloud zone created"),
            Err(SyncError::ZoneAlreadyExists(_)) => tracing::debug!(zone, "Cloud zone exists"),
            Err(e) => {
                self.record_failure("createZone", None, e.to_string());
                return Err(match e {
                    SyncError::Zone(_) => e,
                    other => SyncError::Zone(other.to_string()),
                });
            }
        }

        let subscription = self.config.subscription_id.as_str();
        let subscribed =
            retry_with_backoff(RetryPolicy::Standard, self.backoff, self.config.max_attempts, move |_| {
                db.save_subscription(zone, subscription)
            })
            .await;
        if let Err(e) = subscribed {
            self.record_failure("setupSubscription", None, e.to_string());
            return Err(match e {
                SyncError::Subscription(_) => e,
                other => SyncError::Subscription(other.to_string()),
            });
        }

        self.provisioned.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Hand claimed records back as `failed` after a run-level error
    fn release(&self, in_flight: &[SyncableRecord], error: &SyncError) {
        let message = error.to_string();
        let release: Vec<SyncUpdate> = in_flight
            .iter()
            .map(|r| SyncUpdate::failed(r, message.clone()).on(SyncChannel::Cloud))
            .collect();
        if let Err(e) = self.records.commit_sync_updates(&release) {
            tracing::error!(
                records = in_flight.len(),
                "Could not release in-flight cloud records: {}",
                e
            );
        }
    }

    /// Push every record whose cloud copy is `pending`/`failed`, in batches
    ///
    /// Fails fast with `QuotaExceeded` while uploads are halted.
    pub async fn upload_pending(&self) -> Result<UploadSummary> {
        if self.is_upload_halted() {
            return Err(SyncError::QuotaExceeded);
        }

        let mut due = Vec::new();
        for entity in EntityType::ALL {
            due.extend(self.records.records_needing_sync_on(SyncChannel::Cloud, entity, None)?);
        }
        if due.is_empty() {
            return Ok(UploadSummary::default());
        }

        let ids: Vec<LocalId> = due.iter().map(|r| r.local_id).collect();
        let claimed: HashSet<LocalId> = self
            .records
            .claim_for_sync(SyncChannel::Cloud, &ids)?
            .into_iter()
            .collect();
        let records: Vec<_> = due
            .into_iter()
            .filter(|r| claimed.contains(&r.local_id))
            .collect();
        let mut summary = UploadSummary {
            attempted: records.len(),
            ..Default::default()
        };

        let db = &self.db;
        let zone = self.config.zone_name.as_str();
        let mut updates = Vec::with_capacity(records.len());
        let mut halted = false;
        let failed = |record: &SyncableRecord, message: &str| {
            SyncUpdate::failed(record, message).on(SyncChannel::Cloud)
        };

        for chunk in records.chunks(self.batch_size()) {
            if halted {
                updates.extend(chunk.iter().map(|r| failed(r, "cloud quota exceeded")));
                continue;
            }
            if self.cancelled.load(Ordering::SeqCst) {
                updates.extend(chunk.iter().map(|r| failed(r, "sync cancelled")));
                continue;
            }

            let batch: Vec<CloudRecord> = chunk.iter().map(CloudRecord::from_local).collect();
            let batch = &batch;
            summary.batches += 1;
            let result = retry_with_backoff(
                RetryPolicy::Standard,
                self.backoff,
                self.config.max_attempts,
                move |_| db.modify_records(zone, batch),
            )
            .await;

            // A result that raced with stop() is discarded
            if self.cancelled.load(Ordering::SeqCst) {
                tracing::debug!(size = chunk.len(), "Discarding cloud batch result after stop");
                updates.extend(chunk.iter().map(|r| failed(r, "sync cancelled")));
                continue;
            }
            let now = Utc::now();

            match result {
                Ok(results) => {
                    for record in chunk {
                        let name = record.local_id.to_string();
                        let outcome = results.iter().find(|(n, _)| *n == name).map(|(_, r)| r);
                        match outcome {
                            Some(Ok(())) => updates.push(
                                SyncUpdate::synced(record, Some(name), now).on(SyncChannel::Cloud),
                            ),
                            Some(Err(e)) => {
                                if matches!(e, SyncError::QuotaExceeded) {
                                    halted = true;
                                }
                                self.record_failure("upload", Some(&name), e.to_string());
                                updates.push(failed(record, &e.to_string()));
                            }
                            None => updates.push(failed(record, "no result for record")),
                        }
                    }
                }
                Err(SyncError::QuotaExceeded) => {
                    halted = true;
                    self.record_failure("upload", None, SyncError::QuotaExceeded.to_string());
                    updates.extend(chunk.iter().map(|r| failed(r, "cloud quota exceeded")));
                }
                Err(e) => {
                    tracing::warn!(size = chunk.len(), "Cloud upload batch failed: {}", e);
                    self.record_failure("upload", None, e.to_string());
                    let message = e.to_string();
                    updates.extend(chunk.iter().map(|r| failed(r, &message)));
                }
            }
        }

        summary.uploaded = updates
            .iter()
            .filter(|u| u.status == SyncStatus::Synced)
            .count();
        summary.failed = updates.len() - summary.uploaded;
        if let Err(e) = self.records.commit_sync_updates(&updates) {
            tracing::error!("Committing cloud upload results failed: {}", e);
            self.release(&records, &e);
            return Err(e);
        }

        tracing::info!(
            uploaded = summary.uploaded,
            failed = summary.failed,
            batches = summary.batches,
            "Cloud upload finished"
        );

        if halted {
            self.quota_halted.store(true, Ordering::SeqCst);
            tracing::error!("Cloud quota exceeded, uploads halted");
            return Err(SyncError::QuotaExceeded);
        }
        Ok(summary)
    }

    /// Fetch changes after the persisted token and merge them page by page
    pub async fn download_changes(&self) -> Result<DownloadSummary> {
        let key = self.token_key();
        let mut token = self.settings.get_value(&key)?;
        let mut summary = DownloadSummary::default();

        let db = &self.db;
        let zone = self.config.zone_name.as_str();
        let limit = self.batch_size();

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                summary.interrupted = true;
                break;
            }

            let since = token.as_deref();
            let page =
                retry_with_backoff(RetryPolicy::Standard, self.backoff, self.config.max_attempts, move |_| {
                    db.fetch_changes(zone, since, limit)
                })
                .await?;
            summary.pages += 1;
            summary.fetched += page.records.len();

            let mut remote = Vec::with_capacity(page.records.len());
            for record in &page.records {
                match record.to_remote() {
                    Ok(r) => remote.push(r),
                    Err(e) => {
                        tracing::warn!(record = %record.record_name, "Skipping cloud record: {}", e);
                        self.record_failure("download", Some(&record.record_name), e.to_string());
                        summary.skipped += 1;
                    }
                }
            }

            let merge = self.records.apply_remote_changes_on(SyncChannel::Cloud, &remote)?;
            summary.merge.absorb(merge);

            // Token moves only once the page is committed
            self.settings.set_value(&key, &page.token)?;
            token = Some(page.token);

            if !page.more_coming {
                break;
            }
        }

        tracing::info!(
            pages = summary.pages,
            fetched = summary.fetched,
            applied = summary.merge.applied(),
            conflicts = summary.merge.conflicts,
            "Cloud download finished"
        );
        Ok(summary)
    }

    /// Upload, download, then release conflicts back to `pending`
    pub async fn force_sync(&self) -> Result<CloudSyncReport> {
        self.run("forceSync").await
    }

    async fn run(&self, operation: &str) -> Result<CloudSyncReport> {
        if let CloudSyncState::Disabled { reason } = self.state() {
            return Err(SyncError::Config(format!("cloud sync disabled: {}", reason)));
        }
        let Some(_guard) = self.try_begin() else {
            tracing::debug!("Cloud sync already in flight");
            return Ok(CloudSyncReport {
                skipped: true,
                ..Default::default()
            });
        };

        self.state.send_replace(CloudSyncState::Syncing);
        match self.sync_once().await {
            Ok(report) => {
                if report.download.interrupted {
                    self.state.send_replace(CloudSyncState::Idle);
                } else {
                    let now = Utc::now();
                    *self.last_sync.write() = Some(now);
                    self.settings
                        .set_value(LAST_SYNC_KEY, &now.to_rfc3339_opts(SecondsFormat::Micros, true))?;
                    self.state.send_replace(CloudSyncState::Synced);
                }
                Ok(report)
            }
            Err(e) => {
                tracing::error!(operation, "Cloud sync failed: {}", e);
                self.record_failure(operation, None, e.to_string());
                self.state.send_replace(CloudSyncState::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn sync_once(&self) -> Result<CloudSyncReport> {
        if !self.provisioned.load(Ordering::SeqCst) {
            self.provision().await?;
        }

        // A failed upload does not hold back downloads
        let upload = self.upload_pending().await;
        let download = self.download_changes().await?;
        let conflicts_resolved = self.records.resolve_conflicts_on(SyncChannel::Cloud)?;
        let upload = upload?;

        Ok(CloudSyncReport {
            skipped: false,
            upload,
            download,
            conflicts_resolved,
        })
    }

    /// Forget the change token and mark every cloud copy `pending`
    pub async fn resync(&self) -> Result<usize> {
        self.settings.remove_value(&self.token_key())?;
        let reset = self.records.reset_channel(SyncChannel::Cloud)?;
        tracing::info!(records = reset, "Cloud sync reset");
        Ok(reset)
    }
}
