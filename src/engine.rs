//! One reconciliation engine instance.
//!
//! Owns the snapshot store, the durable handoff cache, the write
//! coordinator and the cross-context broadcaster. Several engines can run
//! side by side in one process (one per display), each with its own state.

use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backing_store::{BackingStore, WatchCallback, WatchHandle};
use crate::broadcast::{apply_message, BroadcastBus, BroadcastMessage, CrossTabBroadcaster};
use crate::config::EngineConfig;
use crate::coordinator::RemoteWriteCoordinator;
use crate::db::DbState;
use crate::error::StoreError;
use crate::handoff_cache::{DurableHandoffCache, SqliteHandoffStorage};
use crate::logging;
use crate::model::Table;
use crate::projection::{
    count_tabs, filter_view, station_ids, OrderView, ProjectionBuilder, TabCounts, ViewKind,
};
use crate::remote::RestBackingStore;
use crate::snapshot::{RawSnapshotStore, ReplaceSummary};
use crate::state::EngineState;

/// Last projection, valid while both revisions are unchanged.
struct Memo {
    revisions: (u64, u64),
    orders: Arc<Vec<OrderView>>,
}

pub struct ReconciliationEngine {
    config: EngineConfig,
    store: Arc<dyn BackingStore>,
    state: Arc<EngineState>,
    broadcaster: Arc<CrossTabBroadcaster>,
    coordinator: RemoteWriteCoordinator,
    memo: Mutex<Option<Memo>>,
    watches: Mutex<Vec<WatchHandle>>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn BackingStore>,
        config: EngineConfig,
        bus: BroadcastBus,
        handoffs: DurableHandoffCache,
    ) -> Self {
        let state = Arc::new(EngineState::new(RawSnapshotStore::new(), handoffs));
        let broadcaster = Arc::new(CrossTabBroadcaster::new(
            bus,
            &config.channel_name,
            &config.origin,
        ));
        let coordinator = RemoteWriteCoordinator::new(
            store.clone(),
            state.clone(),
            broadcaster.clone(),
            config.retry,
        );
        info!(
            channel = %config.channel_name,
            source = %broadcaster.source(),
            max_retries = config.retry.max_retries,
            "Reconciliation engine created"
        );
        Self {
            config,
            store,
            state,
            broadcaster,
            coordinator,
            memo: Mutex::new(None),
            watches: Mutex::new(Vec::new()),
        }
    }

    /// Engine whose handoff cache is persisted in `db`.
    pub fn with_database(
        store: Arc<dyn BackingStore>,
        config: EngineConfig,
        bus: BroadcastBus,
        db: Arc<DbState>,
    ) -> Self {
        let handoffs = DurableHandoffCache::open(
            Box::new(SqliteHandoffStorage::new(db)),
            config.handoff_retention(),
        );
        Self::new(store, config, bus, handoffs)
    }

    /// Load config from `db` and the environment and talk to the configured
    /// REST backend.
    pub fn connect(db: Arc<DbState>, bus: BroadcastBus) -> Result<Self> {
        let config = {
            let conn = db.conn.lock().unwrap_or_else(PoisonError::into_inner);
            EngineConfig::load(&conn)
        };
        let rest = config
            .rest_ready()
            .context("REST backing store is not configured (rest_url / rest_key)")?;
        let store = RestBackingStore::new(rest).context("create REST backing store")?;
        info!(about = %logging::about_info(), "Connecting engine");
        Ok(Self::with_database(Arc::new(store), config, bus, db))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &RemoteWriteCoordinator {
        &self.coordinator
    }

    pub fn broadcaster(&self) -> &CrossTabBroadcaster {
        &self.broadcaster
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Subscribe to every table. Existing subscriptions are replaced.
    pub fn attach_watches(&self) -> Result<usize, StoreError> {
        let mut handles = Vec::with_capacity(Table::ALL.len());
        for table in Table::ALL {
            let state = self.state.clone();
            let callback: WatchCallback = Arc::new(move |rows: Vec<Value>| {
                let summary = state.update_snapshots(|s| s.replace(table, &rows));
                log_replace(table, summary);
            });
            handles.push(self.store.watch(table, callback)?);
        }
        let count = handles.len();
        *self.watches.lock().unwrap_or_else(PoisonError::into_inner) = handles;
        info!(tables = count, "Watching backing store");
        Ok(count)
    }

    pub fn detach_watches(&self) {
        let handles: Vec<WatchHandle> = std::mem::take(
            &mut *self.watches.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in &handles {
            handle.stop();
        }
        debug!(stopped = handles.len(), "Watches detached");
    }

    /// Replace one table with a full row set from the backing store.
    pub fn ingest(&self, table: Table, rows: &[Value]) -> ReplaceSummary {
        let summary = self.state.update_snapshots(|s| s.replace(table, rows));
        log_replace(table, summary);
        summary
    }

    /// Apply a message from another context. Own echoes and messages on
    /// other channels are dropped.
    pub fn apply_broadcast(&self, message: &BroadcastMessage) -> bool {
        if !self.broadcaster.accepts(message) {
            return false;
        }
        let changed = self
            .state
            .update_both(|snapshots, handoffs| apply_message(message, snapshots, handoffs));
        debug!(kind = ?message.kind, changed, "Broadcast applied");
        changed
    }

    /// Apply bus messages until `cancel` fires or the bus closes.
    pub fn spawn_broadcast_listener(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.broadcaster.subscribe();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(message) => {
                        engine.apply_broadcast(&message);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Broadcast listener lagged, continuing");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Broadcast listener stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Projection
    // -----------------------------------------------------------------------

    /// Current order views, rebuilt only when state changed since the last call.
    pub fn project(&self) -> Arc<Vec<OrderView>> {
        let revisions = self.state.revisions();
        {
            let memo = self.memo.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(memo) = memo.as_ref().filter(|m| m.revisions == revisions) {
                return memo.orders.clone();
            }
        }

        let (revisions, orders) = self.state.read_both(|snapshots, handoffs| {
            let orders = ProjectionBuilder::new(snapshots, handoffs).build();
            ((snapshots.revision(), handoffs.revision()), Arc::new(orders))
        });
        debug!(orders = orders.len(), ?revisions, "Projection rebuilt");
        *self.memo.lock().unwrap_or_else(PoisonError::into_inner) = Some(Memo {
            revisions,
            orders: orders.clone(),
        });
        orders
    }

    pub fn view(&self, kind: &ViewKind) -> Vec<OrderView> {
        filter_view(&self.project(), kind)
    }

    pub fn tab_counts(&self) -> TabCounts {
        let orders = self.project();
        let stations = self.state.read_snapshots(|s| station_ids(s, &orders));
        count_tabs(&orders, stations.iter().map(String::as_str))
    }

    /// Ticks after every state change; re-project on change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.state.subscribe()
    }
}

impl Drop for ReconciliationEngine {
    fn drop(&mut self) {
        self.detach_watches();
    }
}

fn log_replace(table: Table, summary: ReplaceSummary) {
    if summary.dropped > 0 {
        warn!(table = %table, dropped = summary.dropped, "Rows without a key were dropped");
    }
    debug!(
        table = %table,
        accepted = summary.accepted,
        patches_cleared = summary.patches_cleared,
        "Snapshot replaced"
    );
}
