//! State owned by one engine instance.
//!
//! Locks are held only for synchronous work, never across an `.await`.
//! When both are needed, `snapshots` is locked before `handoffs`.

use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use crate::handoff_cache::DurableHandoffCache;
use crate::snapshot::RawSnapshotStore;

pub struct EngineState {
    snapshots: Mutex<RawSnapshotStore>,
    handoffs: Mutex<DurableHandoffCache>,
    changes: watch::Sender<u64>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new(RawSnapshotStore::new(), DurableHandoffCache::in_memory())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic mid-update leaves plain data behind; keep serving it.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EngineState {
    pub fn new(snapshots: RawSnapshotStore, handoffs: DurableHandoffCache) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            snapshots: Mutex::new(snapshots),
            handoffs: Mutex::new(handoffs),
            changes,
        }
    }

    pub fn read_snapshots<R>(&self, f: impl FnOnce(&RawSnapshotStore) -> R) -> R {
        f(&lock(&self.snapshots))
    }

    /// Mutate the snapshot store and notify subscribers.
    pub fn update_snapshots<R>(&self, f: impl FnOnce(&mut RawSnapshotStore) -> R) -> R {
        let result = f(&mut lock(&self.snapshots));
        self.notify();
        result
    }

    pub fn read_handoffs<R>(&self, f: impl FnOnce(&DurableHandoffCache) -> R) -> R {
        f(&lock(&self.handoffs))
    }

    pub fn update_handoffs<R>(&self, f: impl FnOnce(&mut DurableHandoffCache) -> R) -> R {
        let result = f(&mut lock(&self.handoffs));
        self.notify();
        result
    }

    /// Mutate both stores as one step.
    pub fn update_both<R>(
        &self,
        f: impl FnOnce(&mut RawSnapshotStore, &mut DurableHandoffCache) -> R,
    ) -> R {
        let result = {
            let mut snapshots = lock(&self.snapshots);
            let mut handoffs = lock(&self.handoffs);
            f(&mut snapshots, &mut handoffs)
        };
        self.notify();
        result
    }

    pub fn read_both<R>(&self, f: impl FnOnce(&RawSnapshotStore, &DurableHandoffCache) -> R) -> R {
        let snapshots = lock(&self.snapshots);
        let handoffs = lock(&self.handoffs);
        f(&snapshots, &handoffs)
    }

    /// (snapshot revision, cache revision).
    pub fn revisions(&self) -> (u64, u64) {
        self.read_both(|s, h| (s.revision(), h.revision()))
    }

    /// Receiver that ticks after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|tick| *tick = tick.wrapping_add(1));
    }
}
