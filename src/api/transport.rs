//! HTTP transport seam

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::endpoint::{Endpoint, Method};
use crate::error::Result;

/// A fully resolved request
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl From<&Endpoint> for ApiRequest {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            method: endpoint.method(),
            path: endpoint.path(),
            body: endpoint.body().cloned(),
        }
    }
}

/// Status and decoded JSON body (`Null` when empty)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one request; any status is returned as a response, only transport
/// failures are errors
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

#[cfg(feature = "http")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "http")]
mod reqwest_transport {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::{ApiRequest, ApiResponse, HttpTransport};
    use crate::api::endpoint::Method;
    use crate::auth::AuthProvider;
    use crate::error::{Result, SyncError};
    use crate::types::ApiConfig;

    /// `reqwest` transport with bearer auth
    pub struct ReqwestTransport {
        client: reqwest::Client,
        base_url: String,
        auth: Arc<dyn AuthProvider>,
    }

    impl ReqwestTransport {
        pub fn new(config: &ApiConfig, auth: Arc<dyn AuthProvider>) -> Result<Self> {
            let client = reqwest::Client::builder()
                .connect_timeout(config.request_timeout())
                .timeout(config.resource_timeout())
                .user_agent(concat!("vitalsync/", env!("CARGO_PKG_VERSION")))
                .build()?;

            Ok(Self {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                auth,
            })
        }
    }

    #[async_trait]
    impl HttpTransport for ReqwestTransport {
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
            let url = format!("{}{}", self.base_url, request.path);
            let mut builder = match request.method {
                Method::Get => self.client.get(&url),
                Method::Post => self.client.post(&url),
                Method::Put => self.client.put(&url),
                Method::Delete => self.client.delete(&url),
            };

            if let Some(token) = self.auth.current_token().await? {
                builder = builder.bearer_auth(token);
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    SyncError::Network(e.to_string())
                } else {
                    SyncError::Http(e)
                }
            })?;

            let status = response.status().as_u16();
            let bytes = response.bytes().await?;
            let body = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                })
            };

            tracing::debug!(method = %request.method, path = %request.path, status, "HTTP response");
            Ok(ApiResponse { status, body })
        }
    }
}
