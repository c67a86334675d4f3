//! The Small KDS - kitchen order reconciliation engine
//!
//! Merges live table snapshots, local optimistic writes, durable handoff
//! records and cross-context broadcasts into one consistent projection of
//! active orders for kitchen display views.

pub mod backing_store;
pub mod batch_status;
pub mod broadcast;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod error;
pub mod handoff_cache;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod projection;
pub mod remote;
pub mod retry;
pub mod snapshot;
pub mod state;

#[cfg(test)]
mod test_support;

pub use backing_store::{BackingStore, WatchCallback, WatchHandle};
pub use batch_status::{compute_batch_status, resolve_batch_status, BatchProgress};
pub use broadcast::{BroadcastBus, BroadcastMessage, CrossTabBroadcaster, MessageKind};
pub use config::{EngineConfig, RestConfig};
pub use coordinator::{RemoteWriteCoordinator, TransitionOutcome};
pub use engine::ReconciliationEngine;
pub use error::{StorageError, StoreError, WriteError, WriteResult};
pub use handoff_cache::DurableHandoffCache;
pub use model::{BatchStatus, HandoffRecord, HandoffStatus, JobStatus, Row, Table};
pub use projection::{OrderView, ProjectionBuilder, TabCounts, ViewKind};
pub use remote::RestBackingStore;
pub use retry::{with_retry, RetryPolicy};
pub use snapshot::RawSnapshotStore;
