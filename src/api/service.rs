//! Request execution with cache and retry policies

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::cache::{CacheStatsResponse, ResponseCache};
use super::endpoint::Endpoint;
use super::transport::{ApiRequest, ApiResponse, HttpTransport};
use crate::error::{Result, SyncError};
use crate::retry::{retry_with_backoff, Backoff, RetryPolicy};
use crate::types::ApiConfig;

/// Where a response may come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Network, falling back to an unexpired cache entry
    #[default]
    NetworkFirst,
    /// Unexpired cache entry, else network
    CacheFirst,
    NetworkOnly,
    /// Cache only, even if expired
    CacheOnly,
}

/// Backend API client
pub struct ApiService {
    transport: Arc<dyn HttpTransport>,
    cache: ResponseCache,
    backoff: Backoff,
    max_attempts: u32,
}

impl ApiService {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &ApiConfig) -> Self {
        Self {
            transport,
            cache: ResponseCache::new(config.cache_ttl(), config.cache_max_entries),
            backoff: Backoff::from_millis(config.retry_base_ms, config.retry_max_ms),
            max_attempts: config.max_retries.max(1),
        }
    }

    /// Replace the retry delays (tests use [`Backoff::immediate`])
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Execute an endpoint under the given cache and retry policies
    pub async fn execute(
        &self,
        endpoint: &Endpoint,
        cache_policy: CachePolicy,
        retry_policy: RetryPolicy,
    ) -> Result<ApiResponse> {
        let key = endpoint.cache_key();
        let cacheable = endpoint.method().is_read();

        match cache_policy {
            CachePolicy::CacheOnly => {
                return self
                    .cache
                    .get_any(&key)
                    .ok_or_else(|| SyncError::CacheMiss(key));
            }
            CachePolicy::CacheFirst if cacheable => {
                if let Some(response) = self.cache.get_fresh(&key) {
                    tracing::debug!(key = %key, "Serving cached response");
                    return Ok(response);
                }
            }
            _ => {}
        }

        match self.send_with_retry(endpoint, retry_policy).await {
            Ok(response) => {
                if cacheable {
                    self.cache.put(key, response.clone());
                }
                Ok(response)
            }
            Err(e) if cache_policy == CachePolicy::NetworkFirst && cacheable => {
                match self.cache.get_fresh(&key) {
                    Some(response) => {
                        tracing::warn!(key = %key, "Network failed, serving cached response: {}", e);
                        Ok(response)
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Execute and decode the JSON body
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        endpoint: &Endpoint,
        cache_policy: CachePolicy,
        retry_policy: RetryPolicy,
    ) -> Result<T> {
        let response = self.execute(endpoint, cache_policy, retry_policy).await?;
        serde_json::from_value(response.body)
            .map_err(|e| SyncError::Decode(format!("{}: {}", endpoint.path(), e)))
    }

    /// Execute several endpoints concurrently; results keep input order
    pub async fn batch(&self, endpoints: &[Endpoint]) -> Vec<Result<ApiResponse>> {
        let calls = endpoints
            .iter()
            .map(|e| self.execute(e, CachePolicy::default(), RetryPolicy::default()));
        futures::future::join_all(calls).await
    }

    async fn send_with_retry(
        &self,
        endpoint: &Endpoint,
        retry_policy: RetryPolicy,
    ) -> Result<ApiResponse> {
        let request = ApiRequest::from(endpoint);
        let request = &request;
        let transport = &self.transport;

        retry_with_backoff(retry_policy, self.backoff, self.max_attempts, |_| async move {
            let response = transport.send(request).await?;
            if response.is_success() {
                Ok(response)
            } else {
                Err(SyncError::from_status(
                    response.status,
                    error_message(&response.body),
                ))
            }
        })
        .await
    }

    pub fn invalidate(&self, endpoint: &Endpoint) {
        self.cache.invalidate(&endpoint.cache_key());
    }

    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStatsResponse {
        self.cache.stats()
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }
}

/// Best-effort message from an error body
fn error_message(body: &Value) -> String {
    ["detail", "message", "error"]
        .iter()
        .find_map(|field| body.get(*field).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| match body {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Replays scripted results and records every request
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        pub responses: Mutex<VecDeque<Result<ApiResponse>>>,
        pub requests: Mutex<Vec<ApiRequest>>,
    }

    impl ScriptedTransport {
        pub fn push(&self, response: Result<ApiResponse>) {
            self.responses.lock().push_back(response);
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
            self.requests.lock().push(request.clone());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(ApiResponse::ok(Value::Null)))
        }
    }

    fn service(transport: Arc<ScriptedTransport>, ttl_ms: u64) -> ApiService {
        let config = ApiConfig::default();
        let mut service = ApiService::new(transport, &config).with_backoff(Backoff::immediate());
        service.cache = ResponseCache::new(Duration::from_millis(ttl_ms), 100);
        service
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(ApiResponse { status: 503, body: json!({"detail": "busy"}) }));
        transport.push(Err(SyncError::Network("reset".into())));
        transport.push(Ok(ApiResponse::ok(json!({"ok": true}))));

        let api = service(transport.clone(), 60_000);
        let response = api
            .execute(&Endpoint::GetProfile, CachePolicy::NetworkOnly, RetryPolicy::Standard)
            .await
            .unwrap();
        assert_eq!(response.body, json!({"ok": true}));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_validation_error_not_retried() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(ApiResponse { status: 422, body: json!({"detail": "bad age"}) }));

        let api = service(transport.clone(), 60_000);
        let err = api
            .execute(
                &Endpoint::UpdateProfile { body: json!({}) },
                CachePolicy::NetworkOnly,
                RetryPolicy::Standard,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation { code: 422, ref message } if message == "bad age"));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_attempts_bounded_by_max_retries() {
        let transport = Arc::new(ScriptedTransport::default());
        for _ in 0..5 {
            transport.push(Ok(ApiResponse { status: 500, body: Value::Null }));
        }

        let api = service(transport.clone(), 60_000);
        let err = api
            .execute(&Endpoint::GetProfile, CachePolicy::NetworkOnly, RetryPolicy::Standard)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Server { code: 500, .. }));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_auth_retried_only_with_include_auth() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(ApiResponse { status: 401, body: Value::Null }));
        transport.push(Ok(ApiResponse::ok(json!(1))));

        let api = service(transport.clone(), 60_000);
        let response = api
            .execute(&Endpoint::GetProfile, CachePolicy::NetworkOnly, RetryPolicy::IncludeAuth)
            .await
            .unwrap();
        assert_eq!(response.body, json!(1));

        transport.push(Ok(ApiResponse { status: 401, body: Value::Null }));
        let err = api
            .execute(&Endpoint::GetProfile, CachePolicy::NetworkOnly, RetryPolicy::Standard)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized(_)));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_cache_first_skips_network() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(ApiResponse::ok(json!({"v": 1}))));

        let api = service(transport.clone(), 60_000);
        api.execute(&Endpoint::GetProfile, CachePolicy::NetworkFirst, RetryPolicy::None)
            .await
            .unwrap();
        let cached = api
            .execute(&Endpoint::GetProfile, CachePolicy::CacheFirst, RetryPolicy::None)
            .await
            .unwrap();
        assert_eq!(cached.body, json!({"v": 1}));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_network_first_falls_back_to_fresh_cache() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(ApiResponse::ok(json!({"v": 1}))));
        transport.push(Err(SyncError::Network("offline".into())));

        let api = service(transport.clone(), 60_000);
        api.execute(&Endpoint::GetProfile, CachePolicy::NetworkFirst, RetryPolicy::None)
            .await
            .unwrap();
        let fallback = api
            .execute(&Endpoint::GetProfile, CachePolicy::NetworkFirst, RetryPolicy::None)
            .await
            .unwrap();
        assert_eq!(fallback.body, json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_stale_entry_only_served_cache_only() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(ApiResponse::ok(json!({"v": 1}))));

        let api = service(transport.clone(), 10);
        api.execute(&Endpoint::GetProfile, CachePolicy::NetworkFirst, RetryPolicy::None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        transport.push(Err(SyncError::Network("offline".into())));
        assert!(api
            .execute(&Endpoint::GetProfile, CachePolicy::NetworkFirst, RetryPolicy::None)
            .await
            .is_err());

        transport.push(Err(SyncError::Network("offline".into())));
        assert!(api
            .execute(&Endpoint::GetProfile, CachePolicy::NetworkOnly, RetryPolicy::None)
            .await
            .is_err());

        let stale = api
            .execute(&Endpoint::GetProfile, CachePolicy::CacheOnly, RetryPolicy::None)
            .await
            .unwrap();
        assert_eq!(stale.body, json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_cache_only_miss_and_posts_not_cached() {
        let transport = Arc::new(ScriptedTransport::default());
        let api = service(transport.clone(), 60_000);
        let endpoint = Endpoint::SubmitAnalysis { body: json!({}) };
        api.execute(&endpoint, CachePolicy::NetworkFirst, RetryPolicy::None)
            .await
            .unwrap();

        assert!(matches!(
            api.execute(&endpoint, CachePolicy::CacheOnly, RetryPolicy::None).await,
            Err(SyncError::CacheMiss(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(ApiResponse::ok(json!("first"))));
        transport.push(Ok(ApiResponse { status: 404, body: Value::Null }));

        let api = service(transport.clone(), 60_000);
        let results = api
            .batch(&[
                Endpoint::GetAnalysis { id: "a".into() },
                Endpoint::GetAnalysis { id: "b".into() },
            ])
            .await;
        assert_eq!(results.len(), 2);
        // join_all polls in order, so scripted responses line up with inputs
        assert_eq!(results[0].as_ref().unwrap().body, json!("first"));
        assert!(results[1].is_err());
    }
}
