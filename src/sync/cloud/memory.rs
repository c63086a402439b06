//! In-process cloud database with an append-only change log

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AccountStatus, ChangeBatch, CloudDatabase, CloudRecord, RecordResult};
use crate::error::{Result, SyncError};

/// Failure returned by the next modify or fetch call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Network,
    Server,
    QuotaExceeded,
}

impl InjectedFailure {
    fn to_error(self) -> SyncError {
        match self {
            InjectedFailure::Network => SyncError::Network("connection reset".to_string()),
            InjectedFailure::Server => SyncError::Server {
                code: 503,
                message: "service unavailable".to_string(),
            },
            InjectedFailure::QuotaExceeded => SyncError::QuotaExceeded,
        }
    }
}

struct Inner {
    account: AccountStatus,
    zones: HashSet<String>,
    subscriptions: HashSet<(String, String)>,
    /// (zone, record); the token is an index into this log
    log: Vec<(String, CloudRecord)>,
    failures: VecDeque<InjectedFailure>,
    quota_exceeded: bool,
    rejected: HashMap<String, String>,
    modify_calls: usize,
}

/// Cloud database kept in memory. Modification times supplied by the client
/// are stored as given.
pub struct MemoryCloudDatabase {
    inner: Mutex<Inner>,
}

impl MemoryCloudDatabase {
    pub fn new() -> Self {
        Self::with_account(AccountStatus::Available)
    }

    pub fn with_account(account: AccountStatus) -> Self {
        Self {
            inner: Mutex::new(Inner {
                account,
                zones: HashSet::new(),
                subscriptions: HashSet::new(),
                log: Vec::new(),
                failures: VecDeque::new(),
                quota_exceeded: false,
                rejected: HashMap::new(),
                modify_calls: 0,
            }),
        }
    }

    pub fn set_account(&self, account: AccountStatus) {
        self.inner.lock().account = account;
    }

    /// Fail the next modify or fetch call
    pub fn inject_failure(&self, failure: InjectedFailure) {
        self.inner.lock().failures.push_back(failure);
    }

    /// While set, every modify call fails with `QuotaExceeded`
    pub fn set_quota_exceeded(&self, exceeded: bool) {
        self.inner.lock().quota_exceeded = exceeded;
    }

    /// Reject one record in every modify call
    pub fn reject_record(&self, record_name: impl Into<String>, message: impl Into<String>) {
        self.inner
            .lock()
            .rejected
            .insert(record_name.into(), message.into());
    }

    /// Write a record as another device would
    pub fn put_remote(&self, zone: &str, record: CloudRecord) {
        let mut inner = self.inner.lock();
        inner.zones.insert(zone.to_string());
        inner.log.push((zone.to_string(), record));
    }

    /// Latest version of every record in a zone
    pub fn records(&self, zone: &str) -> Vec<CloudRecord> {
        let inner = self.inner.lock();
        let mut latest: HashMap<&str, &CloudRecord> = HashMap::new();
        for (z, record) in &inner.log {
            if z == zone {
                latest.insert(record.record_name.as_str(), record);
            }
        }
        let mut records: Vec<CloudRecord> = latest.into_values().cloned().collect();
        records.sort_by(|a, b| a.record_name.cmp(&b.record_name));
        records
    }

    pub fn has_zone(&self, zone: &str) -> bool {
        self.inner.lock().zones.contains(zone)
    }

    pub fn has_subscription(&self, zone: &str, subscription_id: &str) -> bool {
        self.inner
            .lock()
            .subscriptions
            .contains(&(zone.to_string(), subscription_id.to_string()))
    }

    pub fn modify_calls(&self) -> usize {
        self.inner.lock().modify_calls
    }
}

impl Default for MemoryCloudDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn require_zone(inner: &Inner, zone: &str) -> Result<()> {
    if inner.zones.contains(zone) {
        Ok(())
    } else {
        Err(SyncError::Zone(format!("zone {} not found", zone)))
    }
}

#[async_trait]
impl CloudDatabase for MemoryCloudDatabase {
    async fn account_status(&self) -> Result<AccountStatus> {
        Ok(self.inner.lock().account)
    }

    async fn save_zone(&self, zone: &str) -> Result<()> {
        if self.inner.lock().zones.insert(zone.to_string()) {
            Ok(())
        } else {
            Err(SyncError::ZoneAlreadyExists(zone.to_string()))
        }
    }

    async fn save_subscription(&self, zone: &str, subscription_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        require_zone(&inner, zone)?;
        inner
            .subscriptions
            .insert((zone.to_string(), subscription_id.to_string()));
        Ok(())
    }

    async fn modify_records(
        &self,
        zone: &str,
        records: &[CloudRecord],
    ) -> Result<Vec<RecordResult>> {
        let mut inner = self.inner.lock();
        inner.modify_calls += 1;
        if let Some(failure) = inner.failures.pop_front() {
            return Err(failure.to_error());
        }
        if inner.quota_exceeded {
            return Err(SyncError::QuotaExceeded);
        }
        require_zone(&inner, zone)?;
        if records.len() > super::MAX_CLOUD_BATCH {
            return Err(SyncError::Validation {
                code: 400,
                message: format!("batch of {} exceeds limit", records.len()),
            });
        }

        let mut results = Vec::with_capacity(records.len());
        for record in records {
            if let Some(message) = inner.rejected.get(&record.record_name) {
                let err = SyncError::Validation {
                    code: 400,
                    message: message.clone(),
                };
                results.push((record.record_name.clone(), Err(err)));
                continue;
            }
            inner.log.push((zone.to_string(), record.clone()));
            results.push((record.record_name.clone(), Ok(())));
        }
        Ok(results)
    }

    async fn fetch_changes(
        &self,
        zone: &str,
        token: Option<&str>,
        limit: usize,
    ) -> Result<ChangeBatch> {
        let mut inner = self.inner.lock();
        if let Some(failure) = inner.failures.pop_front() {
            return Err(failure.to_error());
        }
        require_zone(&inner, zone)?;

        let start = match token {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|&i| i <= inner.log.len())
                .ok_or_else(|| SyncError::Decode(format!("invalid change token: {}", raw)))?,
            None => 0,
        };

        let limit = limit.max(1);
        let mut records = Vec::new();
        let mut end = start;
        for (i, (z, record)) in inner.log.iter().enumerate().skip(start) {
            if records.len() == limit {
                break;
            }
            end = i + 1;
            if z == zone {
                records.push(record.clone());
            }
        }
        // Nothing matched: skip to the end of the log
        if records.len() < limit {
            end = inner.log.len();
        }
        let more_coming = inner.log[end..].iter().any(|(z, _)| z == zone);

        Ok(ChangeBatch {
            records,
            token: end.to_string(),
            more_coming,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityType, SyncableRecord};
    use serde_json::json;

    fn cloud_record(n: i64) -> CloudRecord {
        CloudRecord::from_local(&SyncableRecord::new(EntityType::Metric, json!({"n": n})))
    }

    #[tokio::test]
    async fn test_zone_created_once() {
        let db = MemoryCloudDatabase::new();
        db.save_zone("HealthData").await.unwrap();
        assert!(matches!(
            db.save_zone("HealthData").await,
            Err(SyncError::ZoneAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_change_feed_pages() {
        let db = MemoryCloudDatabase::new();
        db.save_zone("HealthData").await.unwrap();
        let records: Vec<_> = (0..5).map(cloud_record).collect();
        db.modify_records("HealthData", &records).await.unwrap();

        let first = db.fetch_changes("HealthData", None, 3).await.unwrap();
        assert_eq!(first.records.len(), 3);
        assert!(first.more_coming);

        let second = db
            .fetch_changes("HealthData", Some(&first.token), 3)
            .await
            .unwrap();
        assert_eq!(second.records.len(), 2);
        assert!(!second.more_coming);

        let empty = db
            .fetch_changes("HealthData", Some(&second.token), 3)
            .await
            .unwrap();
        assert!(empty.records.is_empty());
        assert_eq!(empty.token, second.token);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let db = MemoryCloudDatabase::new();
        db.save_zone("HealthData").await.unwrap();
        db.inject_failure(InjectedFailure::Network);

        let records = vec![cloud_record(1)];
        assert!(matches!(
            db.modify_records("HealthData", &records).await,
            Err(SyncError::Network(_))
        ));
        assert!(db.modify_records("HealthData", &records).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejected_record_reported_individually() {
        let db = MemoryCloudDatabase::new();
        db.save_zone("HealthData").await.unwrap();
        let records = vec![cloud_record(1), cloud_record(2)];
        db.reject_record(records[1].record_name.clone(), "field too large");

        let results = db.modify_records("HealthData", &records).await.unwrap();
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
        assert_eq!(db.records("HealthData").len(), 1);
    }
}
