//! Scriptable in-memory backing store for unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backing_store::{BackingStore, WatchCallback, WatchHandle};
use crate::error::StoreError;
use crate::model::{Row, Table};
use crate::normalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Update,
    Insert,
    Read,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: Op,
    pub table: Table,
    pub key: String,
    pub record: Option<Row>,
}

impl Call {
    pub fn version(&self) -> Option<i64> {
        self.record
            .as_ref()
            .and_then(|r| r.get("version"))
            .and_then(Value::as_i64)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.record.as_ref().and_then(|r| r.get(name))
    }
}

#[derive(Default)]
struct Inner {
    rows: BTreeMap<Table, BTreeMap<String, Row>>,
    failures: VecDeque<(Op, Option<Table>, StoreError)>,
    calls: Vec<Call>,
    watchers: Vec<(Table, WatchCallback, CancellationToken)>,
}

/// Enforces the versioning contract on versioned tables and returns queued
/// failures before touching its rows.
#[derive(Default)]
pub struct FakeStore {
    inner: Mutex<Inner>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put server-side rows without notifying watchers.
    pub fn seed(&self, table: Table, rows: &[Value]) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.rows.entry(table).or_default();
        for raw in rows {
            if let Some(row) = normalize::canonical_row(table, raw) {
                let key = normalize::row_key(table, &row).unwrap().to_string();
                entry.insert(key, row);
            }
        }
    }

    /// Queue a failure for the next call of kind `op`.
    pub fn fail_next(&self, op: Op, error: StoreError) {
        self.inner.lock().unwrap().failures.push_back((op, None, error));
    }

    /// Queue a failure for the next call of kind `op` on `table` only.
    pub fn fail_next_on(&self, op: Op, table: Table, error: StoreError) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .push_back((op, Some(table), error));
    }

    pub fn fail_times(&self, op: Op, error: StoreError, times: usize) {
        for _ in 0..times {
            self.fail_next(op, error.clone());
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn calls_of(&self, op: Op, table: Table) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == op && c.table == table)
            .collect()
    }

    pub fn server_row(&self, table: Table, key: &str) -> Option<Row> {
        self.inner
            .lock()
            .unwrap()
            .rows
            .get(&table)
            .and_then(|rows| rows.get(key))
            .cloned()
    }

    /// Deliver the server rows of `table` to every live watcher.
    pub fn push(&self, table: Table) {
        let (rows, callbacks) = {
            let inner = self.inner.lock().unwrap();
            let rows: Vec<Value> = inner
                .rows
                .get(&table)
                .map(|rows| rows.values().cloned().map(Value::Object).collect())
                .unwrap_or_default();
            let callbacks: Vec<WatchCallback> = inner
                .watchers
                .iter()
                .filter(|(t, _, token)| *t == table && !token.is_cancelled())
                .map(|(_, cb, _)| cb.clone())
                .collect();
            (rows, callbacks)
        };
        for callback in callbacks {
            callback(rows.clone());
        }
    }

    fn record_call(&self, op: Op, table: Table, key: &str, record: Option<&Row>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call {
            op,
            table,
            key: key.to_string(),
            record: record.cloned(),
        });
        let matches = |(o, t, _): &(Op, Option<Table>, StoreError)| {
            *o == op && t.map_or(true, |t| t == table)
        };
        if let Some(pos) = inner.failures.iter().position(matches) {
            if let Some((_, _, error)) = inner.failures.remove(pos) {
                return Err(error);
            }
        }
        Ok(())
    }
}

fn key_of(table: Table, record: &Row) -> String {
    normalize::row_key(table, record).unwrap_or_default().to_string()
}

fn version_of(row: &Row) -> Option<i64> {
    row.get("version").and_then(Value::as_i64)
}

#[async_trait]
impl BackingStore for FakeStore {
    fn watch(&self, table: Table, callback: WatchCallback) -> Result<WatchHandle, StoreError> {
        let token = CancellationToken::new();
        self.inner
            .lock()
            .unwrap()
            .watchers
            .push((table, callback, token.clone()));
        Ok(WatchHandle::new(table, token))
    }

    async fn update(&self, table: Table, record: Row) -> Result<Row, StoreError> {
        let key = key_of(table, &record);
        self.record_call(Op::Update, table, &key, Some(&record))?;
        let mut inner = self.inner.lock().unwrap();
        let Some(existing) = inner.rows.get_mut(&table).and_then(|rows| rows.get_mut(&key)) else {
            return Err(StoreError::NotFound {
                table: table.name().into(),
                id: key,
            });
        };
        if table.is_versioned() {
            let current = version_of(existing).unwrap_or(0);
            if version_of(&record) != Some(current + 1) {
                return Err(StoreError::Conflict {
                    table: table.name().into(),
                    id: key,
                    current_version: Some(current),
                });
            }
        }
        for (field, value) in record {
            existing.insert(field, value);
        }
        Ok(existing.clone())
    }

    async fn insert(&self, table: Table, record: Row) -> Result<Row, StoreError> {
        let key = key_of(table, &record);
        self.record_call(Op::Insert, table, &key, Some(&record))?;
        let mut inner = self.inner.lock().unwrap();
        let rows = inner.rows.entry(table).or_default();
        if let Some(existing) = rows.get(&key) {
            return Err(StoreError::Conflict {
                table: table.name().into(),
                id: key,
                current_version: version_of(existing),
            });
        }
        rows.insert(key, record.clone());
        Ok(record)
    }

    async fn read(&self, table: Table, key: &str) -> Result<Option<Row>, StoreError> {
        self.record_call(Op::Read, table, key, None)?;
        Ok(self.server_row(table, key))
    }
}
