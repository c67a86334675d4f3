//! Ingestion boundary: maps upstream rows onto the canonical schema.
//!
//! Feeds spell the same field several ways (`stationId`, `station_id`,
//! `kitchen_station_id`, ...) and disagree on value types (numeric ids,
//! numeric strings, epoch millis vs ISO timestamps). Each table declares its
//! canonical fields with their accepted spellings once; everything past this
//! module reads canonical keys only.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::model::{Row, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    /// String or number, stored as a trimmed non-empty string.
    Id,
    Text,
    /// Lower-cased status token.
    Status,
    Int,
    Float,
    Timestamp,
}

struct FieldSpec {
    name: &'static str,
    aliases: &'static [&'static str],
    kind: FieldKind,
}

const fn field(
    name: &'static str,
    aliases: &'static [&'static str],
    kind: FieldKind,
) -> FieldSpec {
    FieldSpec {
        name,
        aliases,
        kind,
    }
}

use FieldKind::{Float, Id, Int, Status, Text, Timestamp};

const JOB_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "job_id", "jobId", "job_order_id", "jobOrderId"], Id),
    field("order_id", &["order_id", "orderId"], Id),
    field("batch_id", &["batch_id", "batchId", "order_batch_id", "orderBatchId"], Id),
    field("station_id", &["station_id", "stationId", "kitchen_station_id", "kitchenStationId"], Id),
    field("status", &["status", "job_status", "jobStatus"], Status),
    field("progress_state", &["progress_state", "progressState"], Text),
    field("total_items", &["total_items", "totalItems"], Int),
    field("completed_items", &["completed_items", "completedItems"], Int),
    field("remaining_items", &["remaining_items", "remainingItems"], Int),
    field("created_at", &["created_at", "createdAt", "inserted_at"], Timestamp),
    field("accepted_at", &["accepted_at", "acceptedAt"], Timestamp),
    field("started_at", &["started_at", "startedAt"], Timestamp),
    field("ready_at", &["ready_at", "readyAt"], Timestamp),
    field("completed_at", &["completed_at", "completedAt"], Timestamp),
    field("updated_at", &["updated_at", "updatedAt"], Timestamp),
];

const JOB_DETAIL_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "detail_id", "detailId"], Id),
    field("job_order_id", &["job_order_id", "jobOrderId", "job_id", "jobId"], Id),
    field("item_id", &["item_id", "itemId", "menu_item_id", "menuItemId"], Id),
    field("quantity", &["quantity", "qty"], Int),
    field("status", &["status", "item_status", "itemStatus"], Status),
    field("prep_notes", &["prep_notes", "prepNotes", "notes"], Text),
    field("updated_at", &["updated_at", "updatedAt"], Timestamp),
];

const BATCH_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "batch_id", "batchId"], Id),
    field("order_id", &["order_id", "orderId"], Id),
    field("batch_type", &["batch_type", "batchType", "type"], Status),
    field("status", &["status", "batch_status", "batchStatus"], Status),
    field("version", &["version"], Int),
    field("created_at", &["created_at", "createdAt"], Timestamp),
    field("assembled_at", &["assembled_at", "assembledAt"], Timestamp),
    field("served_at", &["served_at", "servedAt"], Timestamp),
    field("updated_at", &["updated_at", "updatedAt"], Timestamp),
];

const ORDER_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "order_id", "orderId"], Id),
    field("order_number", &["order_number", "orderNumber", "number"], Text),
    field("service_mode", &["service_mode", "serviceMode", "order_type", "orderType"], Status),
    field("table_label", &["table_label", "tableLabel", "table_number", "tableNumber"], Text),
    field("customer_name", &["customer_name", "customerName"], Text),
    field("status", &["status"], Status),
    field("fulfillment_stage", &["fulfillment_stage", "fulfillmentStage"], Status),
    field("version", &["version"], Int),
    field("created_at", &["created_at", "createdAt"], Timestamp),
    field("updated_at", &["updated_at", "updatedAt"], Timestamp),
];

const ORDER_LINE_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "line_id", "lineId"], Id),
    field("order_id", &["order_id", "orderId"], Id),
    field("item_id", &["item_id", "itemId", "menu_item_id", "menuItemId"], Id),
    field("quantity", &["quantity", "qty"], Int),
    field("status", &["status"], Status),
    field("version", &["version"], Int),
    field("updated_at", &["updated_at", "updatedAt"], Timestamp),
];

const DELIVERY_FIELDS: &[FieldSpec] = &[
    field("batch_id", &["batch_id", "batchId"], Id),
    field("driver_id", &["driver_id", "driverId"], Id),
    field("status", &["status"], Status),
    field("assigned_at", &["assigned_at", "assignedAt"], Timestamp),
    field("updated_at", &["updated_at", "updatedAt"], Timestamp),
];

const SETTLEMENT_FIELDS: &[FieldSpec] = &[
    field("batch_id", &["batch_id", "batchId"], Id),
    field("driver_id", &["driver_id", "driverId"], Id),
    field("amount", &["amount", "total", "total_amount", "totalAmount"], Float),
    field("status", &["status"], Status),
    field("settled_at", &["settled_at", "settledAt"], Timestamp),
    field("updated_at", &["updated_at", "updatedAt"], Timestamp),
];

const DRIVER_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "driver_id", "driverId"], Id),
    field("name", &["name", "full_name", "fullName", "display_name"], Text),
    field("phone", &["phone", "phone_number", "phoneNumber"], Text),
    field("vehicle_id", &["vehicle_id", "vehicleId"], Id),
];

const STATION_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "station_id", "stationId"], Id),
    field("code", &["code", "station_code"], Text),
    field("name_ar", &["name_ar", "nameAr"], Text),
    field("name_en", &["name_en", "nameEn", "name"], Text),
    field("station_type", &["station_type", "stationType", "type"], Status),
    field("sequence", &["sequence", "display_order", "displayOrder", "sort_order"], Int),
    field("theme_color", &["theme_color", "themeColor", "color"], Text),
];

const MENU_ITEM_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "item_id", "itemId"], Id),
    field("code", &["code", "sku"], Text),
    field("name", &["name", "name_en", "nameEn", "title"], Text),
    field("category_id", &["category_id", "categoryId"], Id),
    field("section_id", &["section_id", "sectionId"], Id),
];

const HANDOFF_FIELDS: &[FieldSpec] = &[
    field("order_id", &["order_id", "orderId", "id"], Id),
    field("status", &["status", "handoff_status", "handoffStatus"], Status),
    field("updated_at", &["updated_at", "updatedAt"], Timestamp),
    field("assembled_at", &["assembled_at", "assembledAt"], Timestamp),
    field("served_at", &["served_at", "servedAt"], Timestamp),
];

fn schema(table: Table) -> &'static [FieldSpec] {
    match table {
        Table::Jobs => JOB_FIELDS,
        Table::JobDetails => JOB_DETAIL_FIELDS,
        Table::Batches => BATCH_FIELDS,
        Table::Orders => ORDER_FIELDS,
        Table::OrderLines => ORDER_LINE_FIELDS,
        Table::Deliveries => DELIVERY_FIELDS,
        Table::Settlements => SETTLEMENT_FIELDS,
        Table::Drivers => DRIVER_FIELDS,
        Table::Stations => STATION_FIELDS,
        Table::MenuItems => MENU_ITEM_FIELDS,
        Table::Handoffs => HANDOFF_FIELDS,
    }
}

/// Canonicalize whatever known fields `raw` carries, without requiring the
/// row key. Used for partial patches (broadcast payloads, write patches).
pub fn canonical_fields(table: Table, raw: &Value) -> Row {
    let mut row = Row::new();
    let Some(obj) = raw.as_object() else {
        return row;
    };
    for spec in schema(table) {
        let present = spec
            .aliases
            .iter()
            .find_map(|alias| obj.get(*alias).filter(|v| !v.is_null()));
        let Some(value) = present else {
            // An explicit null under the canonical name clears the field.
            if obj.get(spec.name).is_some_and(Value::is_null) {
                row.insert(spec.name.to_string(), Value::Null);
            }
            continue;
        };
        if let Some(coerced) = coerce(spec.kind, value) {
            row.insert(spec.name.to_string(), coerced);
        }
    }
    row
}

/// Canonicalize a full row. Rows without a usable key are rejected.
pub fn canonical_row(table: Table, raw: &Value) -> Option<Row> {
    let row = canonical_fields(table, raw);
    let has_key = row
        .get(table.key_field())
        .and_then(Value::as_str)
        .is_some_and(|k| !k.is_empty());
    if !has_key {
        debug!(table = %table, "dropping row without key");
        return None;
    }
    Some(row)
}

/// Row key (`id`, `batch_id` or `order_id` depending on the table).
pub fn row_key(table: Table, row: &Row) -> Option<&str> {
    row.get(table.key_field()).and_then(Value::as_str)
}

/// Decode a canonical row into its typed model.
pub fn decode<T: DeserializeOwned>(table: Table, row: &Row) -> Option<T> {
    match serde_json::from_value(Value::Object(row.clone())) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(table = %table, error = %e, "skipping undecodable row");
            None
        }
    }
}

fn coerce(kind: FieldKind, value: &Value) -> Option<Value> {
    match kind {
        Id => id_string(value).map(Value::String),
        Text => match value {
            Value::String(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| Value::String(trimmed.to_string()))
            }
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
        Status => value
            .as_str()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .map(Value::String),
        Int => int_value(value).map(Value::from),
        Float => float_value(value).and_then(|f| serde_json::Number::from_f64(f).map(Value::Number)),
        Timestamp => parse_timestamp(value).map(|ts| Value::String(format_timestamp(ts))),
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(|f| f.round() as i64))
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn float_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

/// Accepts RFC 3339, SQLite `YYYY-MM-DD HH:MM:SS[.fff]` (UTC), and epoch
/// seconds or milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => {
            let raw = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            if raw.abs() >= 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(ts) = DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(ts.with_timezone(&Utc));
    }
    None
}

/// Canonical timestamp spelling (RFC 3339, millisecond precision, `Z`).
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Job, JobStatus};
    use serde_json::json;

    #[test]
    fn test_job_aliases_collapse_to_canonical_fields() {
        let raw = json!({
            "jobId": 42,
            "orderId": "ord-1",
            "batchId": " b-1 ",
            "kitchen_station_id": "grill",
            "status": "Preparing",
            "totalItems": "3",
            "createdAt": "2026-03-01 12:00:00",
            "unrelated": { "nested": true }
        });
        let row = canonical_row(Table::Jobs, &raw).expect("row");
        assert_eq!(row["id"], "42");
        assert_eq!(row["batch_id"], "b-1");
        assert_eq!(row["station_id"], "grill");
        assert_eq!(row["status"], "preparing");
        assert_eq!(row["total_items"], 3);
        assert_eq!(row["created_at"], "2026-03-01T12:00:00.000Z");
        assert!(row.get("unrelated").is_none());

        let job: Job = decode(Table::Jobs, &row).expect("decode");
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.total_items, Some(3));
    }

    #[test]
    fn test_first_alias_wins_when_both_spellings_present() {
        let raw = json!({ "id": "s1", "station_id": "a", "stationId": "b" });
        let row = canonical_fields(Table::Jobs, &raw);
        assert_eq!(row["station_id"], "a");
    }

    #[test]
    fn test_row_without_key_is_rejected() {
        assert!(canonical_row(Table::Jobs, &json!({ "status": "ready" })).is_none());
        assert!(canonical_row(Table::Jobs, &json!({ "id": "   " })).is_none());
        assert!(canonical_row(Table::Jobs, &json!("not an object")).is_none());
        let delivery = canonical_row(Table::Deliveries, &json!({ "batchId": "b1" }));
        assert!(delivery.is_some());
    }

    #[test]
    fn test_timestamp_formats() {
        let iso = parse_timestamp(&json!("2026-03-01T12:00:00+02:00")).unwrap();
        assert_eq!(format_timestamp(iso), "2026-03-01T10:00:00.000Z");
        let millis = parse_timestamp(&json!(1_772_366_400_000_i64)).unwrap();
        let secs = parse_timestamp(&json!(1_772_366_400_i64)).unwrap();
        assert_eq!(millis, secs);
        assert!(parse_timestamp(&json!("yesterday")).is_none());
    }

    #[test]
    fn test_explicit_null_clears_canonical_field() {
        let row = canonical_fields(Table::Deliveries, &json!({ "driver_id": null }));
        assert_eq!(row.get("driver_id"), Some(&Value::Null));
    }
}
