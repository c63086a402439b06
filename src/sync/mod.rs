//! Record synchronization channels
//!
//! The backend channel pushes and pulls one entity type at a time through a
//! [`BatchSyncCoordinator`]. The cloud channel replicates every entity type
//! into a private record zone. Both merge remote data with the
//! last-write-wins rule in [`conflict`].

pub mod cloud;
pub mod conflict;
pub mod coordinator;

pub use cloud::{
    AccountStatus, CloudDatabase, CloudRecord, CloudReplicationEngine, CloudSyncFailure,
    CloudSyncReport, CloudSyncState, MemoryCloudDatabase,
};
pub use conflict::{MergeSummary, RemoteRecord, Resolution};
pub use coordinator::{BatchSyncCoordinator, PullReport, SyncReport};
