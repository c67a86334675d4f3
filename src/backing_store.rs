//! Contract of the remote backing store the engine reads from and writes to.
//!
//! The store pushes complete table contents through `watch` and accepts
//! single-record `update`/`insert` calls. Records cross this boundary as
//! canonical rows; adapters translate to their own wire format.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::model::{Row, Table};

/// Receives the full current row set of a table every time it changes.
pub type WatchCallback = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Subscribe to full-snapshot pushes for `table`.
    fn watch(&self, table: Table, callback: WatchCallback) -> Result<WatchHandle, StoreError>;

    /// Update an existing record. Versioned tables reject a `version` that is
    /// not the stored version plus one with `StoreError::Conflict`.
    async fn update(&self, table: Table, record: Row) -> Result<Row, StoreError>;

    async fn insert(&self, table: Table, record: Row) -> Result<Row, StoreError>;

    /// Point lookup by row key.
    async fn read(&self, table: Table, key: &str) -> Result<Option<Row>, StoreError>;
}

/// Keeps a subscription alive; dropping it or calling `stop` ends it.
#[derive(Debug)]
pub struct WatchHandle {
    table: Table,
    token: CancellationToken,
}

impl WatchHandle {
    pub fn new(table: Table, token: CancellationToken) -> Self {
        Self { table, token }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
