//! Cross-context change bus.
//!
//! Every engine attached to the same [`BroadcastBus`] sees the changes the
//! others make locally. Messages carry absolute values ("status is X as of
//! T"), so applying one twice or out of order is harmless: a patch older
//! than what the receiver already knows is ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::handoff_cache::DurableHandoffCache;
use crate::model::{BatchStatus, HandoffRecord, HandoffStatus, Row, Table};
use crate::normalize::{self, parse_timestamp};
use crate::snapshot::RawSnapshotStore;

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "job:update")]
    JobUpdate,
    #[serde(rename = "handoff:update")]
    HandoffUpdate,
    #[serde(rename = "delivery:update")]
    DeliveryUpdate,
    #[serde(rename = "orders:payload")]
    OrdersPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    pub channel: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub origin: String,
    pub source: String,
    pub meta: MessageMeta,
}

impl BroadcastMessage {
    /// Whichever of `id`, `jobId`, `orderId` the message carries.
    pub fn target(&self) -> Option<&str> {
        self.id
            .as_deref()
            .or(self.job_id.as_deref())
            .or(self.order_id.as_deref())
    }
}

/// Shared channel; clone it into every engine that should see the others.
#[derive(Clone)]
pub struct BroadcastBus {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.sender.subscribe()
    }

    pub fn send(&self, message: BroadcastMessage) -> usize {
        // No receivers is normal for a single context.
        self.sender.send(message).unwrap_or(0)
    }
}

pub struct CrossTabBroadcaster {
    bus: BroadcastBus,
    channel: String,
    origin: String,
    source: String,
}

impl CrossTabBroadcaster {
    pub fn new(bus: BroadcastBus, channel: &str, origin: &str) -> Self {
        Self {
            bus,
            channel: channel.to_string(),
            origin: origin.to_string(),
            source: Uuid::new_v4().to_string(),
        }
    }

    /// Per-instance tag stamped on every published message.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.bus.subscribe()
    }

    pub fn publish_job(&self, job_id: &str, payload: Value) -> BroadcastMessage {
        let mut message = self.message(MessageKind::JobUpdate, payload);
        message.job_id = Some(job_id.to_string());
        self.send(message)
    }

    /// `payload` carries `batchId`; the order id keys the receiver's cache.
    pub fn publish_handoff(&self, order_id: Option<&str>, payload: Value) -> BroadcastMessage {
        let mut message = self.message(MessageKind::HandoffUpdate, payload);
        message.order_id = order_id.map(str::to_string);
        self.send(message)
    }

    pub fn publish_delivery(&self, batch_id: &str, payload: Value) -> BroadcastMessage {
        let mut message = self.message(MessageKind::DeliveryUpdate, payload);
        message.id = Some(batch_id.to_string());
        self.send(message)
    }

    /// Relay rows of any table: `{"table": name, "rows": [..]}`.
    pub fn publish_rows(&self, table: Table, rows: Vec<Row>) -> BroadcastMessage {
        let rows: Vec<Value> = rows.into_iter().map(Value::Object).collect();
        let payload = json!({ "table": table.name(), "rows": rows });
        self.send(self.message(MessageKind::OrdersPayload, payload))
    }

    /// Whether `message` should be applied here. Self-echoes and messages
    /// for another channel are discarded.
    pub fn accepts(&self, message: &BroadcastMessage) -> bool {
        if message.source == self.source {
            debug!(kind = ?message.kind, "discarding self-originated broadcast");
            return false;
        }
        if message.meta.channel != self.channel {
            trace!(channel = %message.meta.channel, "ignoring broadcast for other channel");
            return false;
        }
        true
    }

    fn message(&self, kind: MessageKind, payload: Value) -> BroadcastMessage {
        BroadcastMessage {
            kind,
            id: None,
            job_id: None,
            order_id: None,
            payload,
            origin: self.origin.clone(),
            source: self.source.clone(),
            meta: MessageMeta {
                channel: self.channel.clone(),
                published_at: Utc::now(),
            },
        }
    }

    fn send(&self, message: BroadcastMessage) -> BroadcastMessage {
        let receivers = self.bus.send(message.clone());
        trace!(kind = ?message.kind, receivers, "broadcast published");
        message
    }
}

/// Apply a message received from another context. Returns `true` when
/// anything changed.
pub fn apply_message(
    message: &BroadcastMessage,
    snapshots: &mut RawSnapshotStore,
    handoffs: &mut DurableHandoffCache,
) -> bool {
    let payload = &message.payload;
    match message.kind {
        MessageKind::JobUpdate => {
            let Some(job_id) = message.target() else {
                return false;
            };
            let mut changed = apply_fields(snapshots, Table::Jobs, job_id, payload);
            if let Some(details) = payload.get("details").and_then(Value::as_array) {
                for detail in details {
                    changed |= apply_keyed(snapshots, Table::JobDetails, detail);
                }
            }
            changed
        }
        MessageKind::HandoffUpdate => {
            let mut changed = false;
            if let Some(batch_id) = payload.get("batchId").and_then(Value::as_str) {
                changed |= apply_fields(snapshots, Table::Batches, batch_id, payload);
            }
            if let Some(order_id) = message.order_id.as_deref() {
                let record = handoff_record(payload);
                if record.should_persist() {
                    changed |= handoffs.absorb(order_id, record);
                }
            }
            changed
        }
        MessageKind::DeliveryUpdate => {
            let Some(batch_id) = message.target() else {
                return false;
            };
            let mut changed = false;
            if let Some(batch) = payload.get("batch").filter(|v| v.is_object()) {
                changed |= apply_fields(snapshots, Table::Batches, batch_id, batch);
            }
            if let Some(assignment) = payload.get("assignment").filter(|v| v.is_object()) {
                changed |= apply_fields(snapshots, Table::Deliveries, batch_id, assignment);
            }
            if let Some(settlement) = payload.get("settlement").filter(|v| v.is_object()) {
                changed |= apply_fields(snapshots, Table::Settlements, batch_id, settlement);
            }
            changed
        }
        MessageKind::OrdersPayload => {
            let table = payload
                .get("table")
                .and_then(Value::as_str)
                .and_then(Table::from_name);
            let Some(table) = table else {
                debug!("orders payload without a known table");
                return false;
            };
            let mut changed = false;
            for row in payload
                .get("rows")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                changed |= apply_keyed(snapshots, table, row);
            }
            changed
        }
    }
}

fn handoff_record(payload: &Value) -> HandoffRecord {
    let status = payload
        .get("handoffStatus")
        .and_then(Value::as_str)
        .map(HandoffStatus::parse)
        .unwrap_or_default();
    let ts = |key: &str| payload.get(key).and_then(parse_timestamp);
    HandoffRecord {
        status,
        updated_at: ts("updatedAt"),
        assembled_at: ts("assembledAt"),
        served_at: ts("servedAt"),
    }
}

fn apply_keyed(snapshots: &mut RawSnapshotStore, table: Table, raw: &Value) -> bool {
    let fields = normalize::canonical_fields(table, raw);
    match normalize::row_key(table, &fields).map(str::to_string) {
        Some(key) => apply_row_patch(snapshots, table, &key, fields),
        None => false,
    }
}

fn apply_fields(snapshots: &mut RawSnapshotStore, table: Table, key: &str, raw: &Value) -> bool {
    let fields = normalize::canonical_fields(table, raw);
    apply_row_patch(snapshots, table, key, fields)
}

/// Layer a remote patch unless the local row is already newer or equal.
pub(crate) fn apply_row_patch(
    snapshots: &mut RawSnapshotStore,
    table: Table,
    key: &str,
    mut fields: Row,
) -> bool {
    fields.remove(table.key_field());
    if fields.is_empty() {
        return false;
    }
    if let Some(current) = snapshots.row(table, key) {
        if is_stale(table, key, &current, &fields, snapshots) {
            debug!(table = %table, key, "ignoring stale broadcast patch");
            return false;
        }
        if fields
            .iter()
            .all(|(name, value)| current.get(name) == Some(value))
        {
            return false;
        }
    }
    snapshots.apply_patch(table, key, fields);
    true
}

fn is_stale(
    table: Table,
    key: &str,
    current: &Row,
    patch: &Row,
    snapshots: &RawSnapshotStore,
) -> bool {
    let int = |row: &Row, name: &str| row.get(name).and_then(Value::as_i64);
    if let (Some(have), Some(got)) = (int(current, "version"), int(patch, "version")) {
        if got < have {
            return true;
        }
    }
    let ts = |row: &Row| row.get("updated_at").and_then(parse_timestamp);
    if let (Some(have), Some(got)) = (ts(current), ts(patch)) {
        if got < have {
            return true;
        }
    }
    if table == Table::Batches {
        if let Some(got) = patch.get("status").and_then(Value::as_str) {
            let got = BatchStatus::parse(got);
            let have = current
                .get("status")
                .and_then(Value::as_str)
                .map(BatchStatus::parse)
                .max(snapshots.status_floor(key));
            if have.is_some_and(|have| got < have) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Batch, Job, JobStatus};
    use chrono::TimeZone;

    fn t(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, min, 0).unwrap()
    }

    #[tokio::test]
    async fn test_self_echo_is_discarded() {
        let bus = BroadcastBus::new();
        let a = CrossTabBroadcaster::new(bus.clone(), "kds-sync", "kds");
        let b = CrossTabBroadcaster::new(bus.clone(), "kds-sync", "kds");
        let mut loopback = a.subscribe();

        a.publish_job("j1", json!({"status": "ready"}));
        let received = loopback.recv().await.expect("message");

        assert!(!a.accepts(&received));
        assert!(b.accepts(&received));

        // Discarded means nothing is applied to a's state.
        let mut snapshots = RawSnapshotStore::new();
        let mut cache = DurableHandoffCache::in_memory();
        if a.accepts(&received) {
            apply_message(&received, &mut snapshots, &mut cache);
        }
        assert_eq!(snapshots.pending_patch_count(), 0);
    }

    #[test]
    fn test_other_channel_is_ignored() {
        let bus = BroadcastBus::new();
        let a = CrossTabBroadcaster::new(bus.clone(), "kds-a", "kds");
        let b = CrossTabBroadcaster::new(bus, "kds-b", "kds");
        let message = a.publish_job("j1", json!({}));
        assert!(!b.accepts(&message));
    }

    #[test]
    fn test_wire_format() {
        let bus = BroadcastBus::new();
        let a = CrossTabBroadcaster::new(bus, "kds-sync", "kds");
        let message = a.publish_handoff(Some("ord-1"), json!({"batchId": "b1", "status": "assembled"}));
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire["type"], "handoff:update");
        assert_eq!(wire["orderId"], "ord-1");
        assert!(wire.get("jobId").is_none());
        assert_eq!(wire["meta"]["channel"], "kds-sync");
        assert_eq!(wire["source"], a.source());
        assert_eq!(wire["origin"], "kds");

        let back: BroadcastMessage = serde_json::from_value(wire).unwrap();
        assert_eq!(back.target(), Some("ord-1"));
    }

    #[test]
    fn test_job_update_applies_absolute_values_idempotently() {
        let mut snapshots = RawSnapshotStore::new();
        let mut cache = DurableHandoffCache::in_memory();
        snapshots.replace(Table::Jobs, &[json!({"id": "j1", "status": "queued"})]);

        let bus = BroadcastBus::new();
        let other = CrossTabBroadcaster::new(bus, "kds-sync", "kds");
        let message = other.publish_job(
            "j1",
            json!({
                "status": "ready",
                "updatedAt": "2026-03-01T12:05:00Z",
                "details": [{"id": "d1", "jobOrderId": "j1", "status": "ready"}]
            }),
        );

        assert!(apply_message(&message, &mut snapshots, &mut cache));
        assert!(!apply_message(&message, &mut snapshots, &mut cache));

        let job: Job = snapshots.typed_row(Table::Jobs, "j1").unwrap();
        assert_eq!(job.status, JobStatus::Ready);
        assert_eq!(snapshots.rows(Table::JobDetails).len(), 1);
    }

    #[test]
    fn test_older_patch_does_not_overwrite_newer_row() {
        let mut snapshots = RawSnapshotStore::new();
        snapshots.replace(
            Table::Jobs,
            &[json!({"id": "j1", "status": "ready", "updated_at": "2026-03-01T12:10:00Z"})],
        );
        let fields = normalize::canonical_fields(
            Table::Jobs,
            &json!({"status": "in_progress", "updatedAt": "2026-03-01T12:01:00Z"}),
        );
        assert!(!apply_row_patch(&mut snapshots, Table::Jobs, "j1", fields));
    }

    #[test]
    fn test_handoff_update_never_lowers_batch_and_fills_cache() {
        let mut snapshots = RawSnapshotStore::new();
        let mut cache = DurableHandoffCache::in_memory();
        snapshots.replace(Table::Batches, &[json!({"id": "b1", "status": "served", "version": 5})]);

        let bus = BroadcastBus::new();
        let other = CrossTabBroadcaster::new(bus, "kds-sync", "kds");
        let late = other.publish_handoff(
            Some("ORD-1"),
            json!({
                "batchId": "b1",
                "status": "assembled",
                "handoffStatus": "assembled",
                "version": 4,
                "updatedAt": t(1).to_rfc3339(),
                "assembledAt": t(1).to_rfc3339()
            }),
        );
        apply_message(&late, &mut snapshots, &mut cache);

        let batch: Batch = snapshots.typed_row(Table::Batches, "b1").unwrap();
        assert_eq!(batch.status, BatchStatus::Served);
        assert_eq!(cache.get("ord-1").unwrap().status, HandoffStatus::Assembled);
    }

    #[test]
    fn test_orders_payload_patches_rows_of_named_table() {
        let mut snapshots = RawSnapshotStore::new();
        let mut cache = DurableHandoffCache::in_memory();
        let bus = BroadcastBus::new();
        let other = CrossTabBroadcaster::new(bus, "kds-sync", "kds");
        let mut row = Row::new();
        row.insert("id".into(), json!("o1"));
        row.insert("fulfillment_stage".into(), json!("served"));
        row.insert("version".into(), json!(2));
        let message = other.publish_rows(Table::Orders, vec![row]);
        assert!(apply_message(&message, &mut snapshots, &mut cache));
        assert_eq!(snapshots.row(Table::Orders, "o1").unwrap()["fulfillment_stage"], "served");
    }
}
