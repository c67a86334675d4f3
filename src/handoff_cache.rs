//! Durable per-order handoff dispositions.
//!
//! Remembers which orders reached `assembled`/`served` so a lagging or reset
//! feed cannot make them look unfinished again. Persistence is best-effort:
//! when storage fails the cache keeps working in memory for the session.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{self, DbState};
use crate::error::StorageError;
use crate::model::{order_key, HandoffRecord};

/// `local_settings` category shared with the config overrides.
pub const SETTINGS_CATEGORY: &str = "kitchen";
/// `local_settings` key holding the persisted handoff map.
pub const CACHE_SETTING_KEY: &str = "handoff_cache";

pub type HandoffMap = BTreeMap<String, HandoffRecord>;

/// Where the cache is persisted.
pub trait HandoffStorage: Send {
    fn load(&self) -> Result<HandoffMap, StorageError>;
    fn save(&self, entries: &HandoffMap) -> Result<(), StorageError>;
}

/// Stores the map as one JSON object in `local_settings`.
pub struct SqliteHandoffStorage {
    db: Arc<DbState>,
    key: String,
}

impl SqliteHandoffStorage {
    pub fn new(db: Arc<DbState>) -> Self {
        Self {
            db,
            key: CACHE_SETTING_KEY.to_string(),
        }
    }

    pub fn with_key(db: Arc<DbState>, key: &str) -> Self {
        Self {
            db,
            key: key.to_string(),
        }
    }
}

impl HandoffStorage for SqliteHandoffStorage {
    fn load(&self) -> Result<HandoffMap, StorageError> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        match db::get_setting(&conn, SETTINGS_CATEGORY, &self.key) {
            Some(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
            _ => Ok(HandoffMap::new()),
        }
    }

    fn save(&self, entries: &HandoffMap) -> Result<(), StorageError> {
        let payload = serde_json::to_string(entries)?;
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        db::set_setting(&conn, SETTINGS_CATEGORY, &self.key, &payload)?;
        Ok(())
    }
}

pub struct DurableHandoffCache {
    entries: HandoffMap,
    storage: Option<Box<dyn HandoffStorage>>,
    revision: u64,
}

impl Default for DurableHandoffCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for DurableHandoffCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableHandoffCache")
            .field("entries", &self.entries)
            .field("durable", &self.storage.is_some())
            .field("revision", &self.revision)
            .finish()
    }
}

impl DurableHandoffCache {
    /// Session-only cache.
    pub fn in_memory() -> Self {
        Self {
            entries: HandoffMap::new(),
            storage: None,
            revision: 0,
        }
    }

    /// Load from `storage`, dropping records older than `retention`.
    pub fn open(storage: Box<dyn HandoffStorage>, retention: ChronoDuration) -> Self {
        Self::open_at(storage, retention, Utc::now())
    }

    pub fn open_at(
        storage: Box<dyn HandoffStorage>,
        retention: ChronoDuration,
        now: DateTime<Utc>,
    ) -> Self {
        let mut cache = Self::in_memory();
        match storage.load() {
            Ok(loaded) => {
                let cutoff = now - retention;
                let total = loaded.len();
                for (key, record) in loaded {
                    if !record.should_persist() {
                        continue;
                    }
                    if record.resolved_at().is_some_and(|at| at < cutoff) {
                        continue;
                    }
                    cache.entries.insert(order_key(&key), record);
                }
                info!(
                    loaded = total,
                    kept = cache.entries.len(),
                    "Durable handoff cache loaded"
                );
                cache.storage = Some(storage);
                if cache.entries.len() != total {
                    cache.persist();
                }
            }
            Err(StorageError::Corrupt(e)) => {
                // Start clean; the next save overwrites the bad payload.
                warn!(error = %e, "Durable handoff cache payload unreadable, starting empty");
                cache.storage = Some(storage);
            }
            Err(e) => {
                warn!(error = %e, "Durable handoff cache unavailable, using memory only");
            }
        }
        cache
    }

    pub fn get(&self, order_id: &str) -> Option<&HandoffRecord> {
        self.entries.get(&order_key(order_id))
    }

    /// Store a terminal disposition, or forget the order if `record` is not
    /// terminal any more.
    pub fn put(&mut self, order_id: &str, record: HandoffRecord) {
        let key = order_key(order_id);
        if key.is_empty() {
            return;
        }
        if record.should_persist() {
            if self.entries.get(&key) == Some(&record) {
                return;
            }
            self.entries.insert(key, record);
        } else if self.entries.remove(&key).is_none() {
            return;
        }
        self.revision += 1;
        self.persist();
    }

    /// Apply a record from another context, keeping whichever is newer.
    /// Returns `true` when the cache changed.
    pub fn absorb(&mut self, order_id: &str, record: HandoffRecord) -> bool {
        let newer = match self.get(order_id) {
            Some(existing) => record.resolved_at() > existing.resolved_at(),
            None => true,
        };
        if !newer {
            debug!(order_id, "ignoring handoff record not newer than cache");
            return false;
        }
        let before = self.revision;
        self.put(order_id, record);
        self.revision != before
    }

    /// Merge a feed-provided map with the cache.
    ///
    /// Keys present on one side only are taken as-is. For keys on both
    /// sides the record with the later resolved timestamp wins; ties, and
    /// incoming records without any timestamp, favour the cache.
    pub fn merge_incoming(&self, incoming: &HandoffMap) -> HandoffMap {
        let mut merged = self.entries.clone();
        for (raw_key, record) in incoming {
            let key = order_key(raw_key);
            match merged.get(&key) {
                Some(cached) if record.resolved_at() <= cached.resolved_at() => {}
                _ => {
                    merged.insert(key, record.clone());
                }
            }
        }
        merged
    }

    pub fn entries(&self) -> &HandoffMap {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// `true` once storage has failed and the cache lives in memory only.
    pub fn is_degraded(&self) -> bool {
        self.storage.is_none()
    }

    fn persist(&mut self) {
        let Some(storage) = self.storage.as_ref() else {
            return;
        };
        if let Err(e) = storage.save(&self.entries) {
            warn!(error = %e, "Durable handoff cache write failed, continuing in memory only");
            self.storage = None;
        }
    }
}
