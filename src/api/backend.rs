//! Record sync over the backend API

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::endpoint::Endpoint;
use super::service::{ApiService, CachePolicy};
use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;
use crate::sync::conflict::RemoteRecord;
use crate::types::{EntityType, LocalId, SyncableRecord};

/// Per-record result of an upload
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    pub local_id: LocalId,
    /// Remote id on success, error message on failure
    pub result: std::result::Result<String, String>,
}

impl UploadOutcome {
    pub fn accepted(local_id: LocalId, remote_id: impl Into<String>) -> Self {
        Self {
            local_id,
            result: Ok(remote_id.into()),
        }
    }

    pub fn rejected(local_id: LocalId, error: impl Into<String>) -> Self {
        Self {
            local_id,
            result: Err(error.into()),
        }
    }
}

/// Remote side of the batch sync coordinator
#[async_trait]
pub trait BackendGateway: Send + Sync {
    /// Push one chunk; chunk-level failures are errors, per-record failures
    /// are outcomes
    async fn upload_batch(
        &self,
        entity: EntityType,
        records: &[SyncableRecord],
    ) -> Result<Vec<UploadOutcome>>;

    /// Remote changes since `since`
    async fn fetch_changes(
        &self,
        entity: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>>;
}

#[derive(Debug, Serialize)]
struct UploadItem<'a> {
    local_id: LocalId,
    remote_id: Option<&'a str>,
    owner_id: Option<LocalId>,
    timestamp: DateTime<Utc>,
    data: &'a Value,
}

#[derive(Debug, Deserialize)]
struct UploadResultItem {
    local_id: LocalId,
    #[serde(default)]
    remote_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    results: Vec<UploadResultItem>,
}

#[derive(Debug, Deserialize)]
struct ChangeItem {
    remote_id: String,
    #[serde(default)]
    local_id: Option<LocalId>,
    #[serde(default)]
    owner_id: Option<LocalId>,
    modified_at: DateTime<Utc>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    #[serde(default)]
    changes: Vec<Value>,
}

/// [`BackendGateway`] over [`ApiService`]
pub struct ApiBackend {
    api: Arc<ApiService>,
}

impl ApiBackend {
    pub fn new(api: Arc<ApiService>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl BackendGateway for ApiBackend {
    async fn upload_batch(
        &self,
        entity: EntityType,
        records: &[SyncableRecord],
    ) -> Result<Vec<UploadOutcome>> {
        let items: Vec<UploadItem<'_>> = records
            .iter()
            .map(|r| UploadItem {
                local_id: r.local_id,
                remote_id: r.remote_id.as_deref(),
                owner_id: r.owner_id,
                timestamp: r.timestamp,
                data: &r.payload,
            })
            .collect();

        let endpoint = Endpoint::UploadBatch {
            entity,
            body: json!({ "records": items }),
        };
        let response: UploadResponse = self
            .api
            .execute_json(&endpoint, CachePolicy::NetworkOnly, RetryPolicy::Standard)
            .await?;

        let mut by_id: HashMap<LocalId, UploadResultItem> = response
            .results
            .into_iter()
            .map(|item| (item.local_id, item))
            .collect();

        Ok(records
            .iter()
            .map(|record| match by_id.remove(&record.local_id) {
                Some(UploadResultItem {
                    error: Some(error), ..
                }) => UploadOutcome::rejected(record.local_id, error),
                Some(UploadResultItem {
                    remote_id: Some(remote_id),
                    ..
                }) => UploadOutcome::accepted(record.local_id, remote_id),
                Some(_) => UploadOutcome::rejected(record.local_id, "response missing remote_id"),
                None => UploadOutcome::rejected(record.local_id, "record missing from response"),
            })
            .collect())
    }

    async fn fetch_changes(
        &self,
        entity: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>> {
        let endpoint = Endpoint::FetchChanges { entity, since };
        let response: ChangesResponse = self
            .api
            .execute_json(&endpoint, CachePolicy::NetworkOnly, RetryPolicy::Standard)
            .await?;

        let mut changes = Vec::with_capacity(response.changes.len());
        for raw in response.changes {
            match serde_json::from_value::<ChangeItem>(raw) {
                Ok(item) => changes.push(RemoteRecord {
                    entity_type: entity,
                    remote_id: item.remote_id,
                    local_id: item.local_id,
                    owner_id: item.owner_id,
                    modified_at: item.modified_at,
                    payload: item.data,
                }),
                Err(e) => {
                    let err = SyncError::Decode(e.to_string());
                    tracing::warn!(entity = %entity, "Skipping undecodable change: {}", err);
                }
            }
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::service::tests::ScriptedTransport;
    use crate::api::transport::ApiResponse;
    use crate::retry::Backoff;
    use crate::types::ApiConfig;

    fn backend(transport: Arc<ScriptedTransport>) -> ApiBackend {
        let api = ApiService::new(transport, &ApiConfig::default()).with_backoff(Backoff::immediate());
        ApiBackend::new(Arc::new(api))
    }

    #[tokio::test]
    async fn test_upload_maps_per_record_outcomes() {
        let a = SyncableRecord::new(EntityType::Metric, json!({"v": 1}));
        let b = SyncableRecord::new(EntityType::Metric, json!({"v": 2}));
        let c = SyncableRecord::new(EntityType::Metric, json!({"v": 3}));

        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(ApiResponse::ok(json!({
            "results": [
                {"local_id": a.local_id, "remote_id": "r-a"},
                {"local_id": b.local_id, "error": "invalid unit"}
            ]
        }))));

        let outcomes = backend(transport.clone())
            .upload_batch(EntityType::Metric, &[a.clone(), b.clone(), c.clone()])
            .await
            .unwrap();

        assert_eq!(outcomes[0], UploadOutcome::accepted(a.local_id, "r-a"));
        assert_eq!(outcomes[1], UploadOutcome::rejected(b.local_id, "invalid unit"));
        assert!(outcomes[2].result.is_err());

        let requests = transport.requests.lock();
        assert_eq!(requests[0].path, "/health-data/batch");
        let body = requests[0].body.as_ref().unwrap();
        assert_eq!(body["records"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_changes_skips_bad_items() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(ApiResponse::ok(json!({
            "changes": [
                {"remote_id": "r-1", "modified_at": "2024-05-01T12:00:00Z", "data": {"v": 1}},
                {"remote_id": "r-2", "modified_at": "yesterday"}
            ]
        }))));

        let changes = backend(transport)
            .fetch_changes(EntityType::Insight, None)
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].remote_id, "r-1");
        assert_eq!(changes[0].entity_type, EntityType::Insight);
    }
}
