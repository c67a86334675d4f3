//! Latest known rows per table.
//!
//! Feeds deliver complete current state, so `replace` swaps a table's rows
//! wholesale instead of merging (merging would resurrect deleted rows).
//! Local writes are layered on top as pending patches: the confirmed rows
//! stay exactly as the last push delivered them, and each patch is dropped
//! once a push confirms it or it grows stale.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::model::{BatchStatus, Row, Table};
use crate::normalize::{self, parse_timestamp};

/// Default lifetime of an unconfirmed patch.
pub const DEFAULT_PATCH_TTL_SECS: i64 = 120;

/// A local value not yet confirmed by an authoritative push.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPatch {
    pub fields: Row,
    pub applied_at: DateTime<Utc>,
}

impl PendingPatch {
    fn version(&self) -> Option<i64> {
        self.fields.get("version").and_then(Value::as_i64)
    }

    /// Whether `row` (fresh from a push) already reflects this patch.
    fn is_confirmed_by(&self, table: Table, row: &Row) -> bool {
        if table.is_versioned() {
            if let (Some(patched), Some(current)) =
                (self.version(), row.get("version").and_then(Value::as_i64))
            {
                return current >= patched;
            }
        }
        let fields_match = self
            .fields
            .iter()
            .all(|(key, value)| row.get(key).unwrap_or(&Value::Null) == value);
        if fields_match {
            return true;
        }
        // The server saw a later change than ours; its state wins.
        row.get("updated_at")
            .and_then(parse_timestamp)
            .is_some_and(|server_at| server_at >= self.applied_at)
    }
}

/// Summary of one `replace` call, mostly for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaceSummary {
    pub accepted: usize,
    pub dropped: usize,
    pub patches_cleared: usize,
}

#[derive(Debug, Clone)]
pub struct RawSnapshotStore {
    tables: BTreeMap<Table, BTreeMap<String, Row>>,
    patches: BTreeMap<(Table, String), PendingPatch>,
    status_floor: BTreeMap<String, BatchStatus>,
    revision: u64,
    patch_ttl: ChronoDuration,
}

impl Default for RawSnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSnapshotStore {
    pub fn new() -> Self {
        Self::with_patch_ttl(ChronoDuration::seconds(DEFAULT_PATCH_TTL_SECS))
    }

    pub fn with_patch_ttl(patch_ttl: ChronoDuration) -> Self {
        Self {
            tables: BTreeMap::new(),
            patches: BTreeMap::new(),
            status_floor: BTreeMap::new(),
            revision: 0,
            patch_ttl,
        }
    }

    /// Monotonic counter bumped by every mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Replace a table's full row set.
    pub fn replace(&mut self, table: Table, rows: &[Value]) -> ReplaceSummary {
        self.replace_at(table, rows, Utc::now())
    }

    pub fn replace_at(&mut self, table: Table, rows: &[Value], now: DateTime<Utc>) -> ReplaceSummary {
        let mut summary = ReplaceSummary::default();
        let mut next = BTreeMap::new();
        for raw in rows {
            match normalize::canonical_row(table, raw) {
                Some(row) => {
                    if let Some(key) = normalize::row_key(table, &row) {
                        next.insert(key.to_string(), row);
                        summary.accepted += 1;
                    }
                }
                None => summary.dropped += 1,
            }
        }

        if table == Table::Batches {
            for (id, row) in &next {
                if let Some(status) = row.get("status").and_then(Value::as_str) {
                    self.raise_floor(id, BatchStatus::parse(status));
                }
            }
        }

        // Every replace also sweeps expired patches of other tables, so a
        // table that is never refreshed cannot pin its patches.
        let ttl = self.patch_ttl;
        let before = self.patches.len();
        self.patches.retain(|(patch_table, key), patch| {
            if *patch_table == table {
                if let Some(row) = next.get(key) {
                    if patch.is_confirmed_by(table, row) {
                        return false;
                    }
                }
            }
            now - patch.applied_at <= ttl
        });
        summary.patches_cleared = before - self.patches.len();

        if table == Table::Batches {
            let patches = &self.patches;
            let before = self.status_floor.len();
            self.status_floor.retain(|id, _| {
                next.contains_key(id) || patches.contains_key(&(Table::Batches, id.clone()))
            });
            let forgotten = before - self.status_floor.len();
            if forgotten > 0 {
                debug!(forgotten, "dropped status floors of batches gone from the feed");
            }
        }

        self.tables.insert(table, next);
        self.revision += 1;
        debug!(
            table = %table,
            accepted = summary.accepted,
            dropped = summary.dropped,
            patches_cleared = summary.patches_cleared,
            "snapshot replaced"
        );
        summary
    }

    /// Whether the table has been delivered at least once.
    pub fn has_table(&self, table: Table) -> bool {
        self.tables.contains_key(&table)
    }

    /// Row as last confirmed by a push, without local patches.
    pub fn confirmed_row(&self, table: Table, key: &str) -> Option<&Row> {
        self.tables.get(&table).and_then(|rows| rows.get(key))
    }

    /// Freshest known row: confirmed values overlaid with any pending patch.
    pub fn row(&self, table: Table, key: &str) -> Option<Row> {
        let confirmed = self.confirmed_row(table, key);
        let patch = self.patches.get(&(table, key.to_string()));
        match (confirmed, patch) {
            (Some(row), Some(patch)) => Some(overlay(row, &patch.fields)),
            (Some(row), None) => Some(row.clone()),
            (None, Some(patch)) => Some(patch.fields.clone()),
            (None, None) => None,
        }
    }

    /// All rows of a table (patched), ordered by key.
    pub fn rows(&self, table: Table) -> Vec<Row> {
        let mut keys: Vec<&String> = self
            .tables
            .get(&table)
            .map(|rows| rows.keys().collect())
            .unwrap_or_default();
        for (patch_table, key) in self.patches.keys() {
            if *patch_table == table {
                keys.push(key);
            }
        }
        keys.sort();
        keys.dedup();
        keys.into_iter()
            .filter_map(|key| self.row(table, key))
            .collect()
    }

    /// Typed view of a table; rows that fail to decode are skipped.
    pub fn typed<T: DeserializeOwned>(&self, table: Table) -> Vec<T> {
        self.rows(table)
            .iter()
            .filter_map(|row| normalize::decode(table, row))
            .collect()
    }

    pub fn typed_row<T: DeserializeOwned>(&self, table: Table, key: &str) -> Option<T> {
        self.row(table, key)
            .and_then(|row| normalize::decode(table, &row))
    }

    /// Layer `fields` over the row until a push confirms them.
    pub fn apply_patch(&mut self, table: Table, key: &str, fields: Row) {
        self.apply_patch_at(table, key, fields, Utc::now());
    }

    pub fn apply_patch_at(&mut self, table: Table, key: &str, mut fields: Row, now: DateTime<Utc>) {
        fields.insert(table.key_field().to_string(), Value::String(key.to_string()));
        if table == Table::Batches {
            if let Some(status) = fields.get("status").and_then(Value::as_str) {
                let status = BatchStatus::parse(status);
                self.raise_floor(key, status);
            }
        }
        let entry = self
            .patches
            .entry((table, key.to_string()))
            .or_insert_with(|| PendingPatch {
                fields: Row::new(),
                applied_at: now,
            });
        for (field, value) in fields {
            entry.fields.insert(field, value);
        }
        entry.applied_at = now;
        self.revision += 1;
    }

    pub fn pending_patch(&self, table: Table, key: &str) -> Option<&PendingPatch> {
        self.patches.get(&(table, key.to_string()))
    }

    pub fn pending_patch_count(&self) -> usize {
        self.patches.len()
    }

    /// Drop every patch older than the TTL. Returns how many were dropped.
    pub fn expire_patches_at(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = self.patch_ttl;
        let before = self.patches.len();
        self.patches.retain(|_, patch| now - patch.applied_at <= ttl);
        let expired = before - self.patches.len();
        if expired > 0 {
            self.revision += 1;
        }
        expired
    }

    /// Highest handoff-stage status ever observed for a batch.
    pub fn status_floor(&self, batch_id: &str) -> Option<BatchStatus> {
        self.status_floor.get(batch_id).copied()
    }

    /// Remember a handoff-stage status so later feed regressions do not show.
    pub fn raise_floor(&mut self, batch_id: &str, status: BatchStatus) {
        if !status.is_handoff_stage() {
            return;
        }
        let slot = self
            .status_floor
            .entry(batch_id.to_string())
            .or_insert(status);
        if status > *slot {
            *slot = status;
        }
    }
}

fn overlay(base: &Row, patch: &Row) -> Row {
    let mut merged = base.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
