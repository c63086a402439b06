//! Backend API access
//!
//! Endpoints are a closed sum type. Calls go through [`ApiService`], which
//! applies the retry policy and the TTL response cache on top of an
//! [`HttpTransport`].

mod backend;
mod cache;
mod endpoint;
mod service;
mod transport;

pub use backend::{ApiBackend, BackendGateway, UploadOutcome};
pub use cache::{CacheStatsResponse, ResponseCache};
pub use endpoint::{Endpoint, Method};
pub use service::{ApiService, CachePolicy};
#[cfg(feature = "http")]
pub use transport::ReqwestTransport;
pub use transport::{ApiRequest, ApiResponse, HttpTransport};
