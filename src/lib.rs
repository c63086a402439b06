//! Vitalsync - offline-first sync for health records
//!
//! Keeps a local SQLite store consistent with a backend API, a cloud record
//! database and a real-time channel, while queueing writes made offline.

pub mod api;
pub mod auth;
pub mod engine;
pub mod error;
pub mod queue;
pub mod realtime;
pub mod retry;
pub mod storage;
pub mod sync;
pub mod types;

pub use engine::{Submission, SyncEngine, SyncEngineBuilder};
pub use error::{ErrorKind, Result, SyncError};
pub use storage::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
