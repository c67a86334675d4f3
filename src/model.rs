//! Canonical data model.
//!
//! Every upstream row is mapped onto these shapes once, at the ingestion
//! boundary (see `normalize`). Business logic only ever sees canonical
//! snake_case fields and parsed status enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A raw-but-canonicalized table row.
pub type Row = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Logical tables fed by the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Jobs,
    JobDetails,
    Batches,
    Orders,
    OrderLines,
    Deliveries,
    Settlements,
    Drivers,
    Stations,
    MenuItems,
    Handoffs,
}

impl Table {
    pub const ALL: [Table; 11] = [
        Table::Jobs,
        Table::JobDetails,
        Table::Batches,
        Table::Orders,
        Table::OrderLines,
        Table::Deliveries,
        Table::Settlements,
        Table::Drivers,
        Table::Stations,
        Table::MenuItems,
        Table::Handoffs,
    ];

    /// Remote table name.
    pub fn name(self) -> &'static str {
        match self {
            Table::Jobs => "job_order_headers",
            Table::JobDetails => "job_order_details",
            Table::Batches => "order_batches",
            Table::Orders => "orders",
            Table::OrderLines => "order_items",
            Table::Deliveries => "delivery_assignments",
            Table::Settlements => "delivery_settlements",
            Table::Drivers => "drivers",
            Table::Stations => "stations",
            Table::MenuItems => "menu_items",
            Table::Handoffs => "order_handoffs",
        }
    }

    pub fn from_name(name: &str) -> Option<Table> {
        let wanted = name.trim();
        Table::ALL.into_iter().find(|t| t.name() == wanted)
    }

    /// Tables whose rows carry an optimistic-concurrency `version`.
    pub fn is_versioned(self) -> bool {
        matches!(self, Table::Orders | Table::OrderLines | Table::Batches)
    }

    /// Canonical field that identifies a row within the table.
    pub fn key_field(self) -> &'static str {
        match self {
            Table::Deliveries | Table::Settlements => "batch_id",
            Table::Handoffs => "order_id",
            _ => "id",
        }
    }

    /// Reference tables are read-only master data.
    pub fn is_reference(self) -> bool {
        matches!(self, Table::Drivers | Table::Stations | Table::MenuItems)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Generates `as_str`, lenient `parse`, `Display` and string serde impls for
/// a status-like enum. Unknown spellings map to the declared fallback.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident, fallback = $fallback:ident {
            $($variant:ident => $canonical:literal $(| $alias:literal)*),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $canonical),+
                }
            }

            pub fn parse(raw: &str) -> Self {
                let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
                match normalized.as_str() {
                    $($canonical $(| $alias)* => $name::$variant,)+
                    _ => $name::$fallback,
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::$fallback
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = Option::<String>::deserialize(deserializer)?;
                Ok(raw.as_deref().map($name::parse).unwrap_or_default())
            }
        }
    };
}

string_enum! {
    /// Status of a job or a job detail line. Declaration order is the
    /// progression order used for "maximum status" comparisons.
    JobStatus, fallback = Queued {
        Queued => "queued" | "pending" | "new" | "accepted" | "waiting",
        InProgress => "in_progress" | "preparing" | "cooking" | "started" | "working",
        Ready => "ready" | "done" | "prepared",
        Completed => "completed" | "complete" | "served" | "closed",
        Cancelled => "cancelled" | "canceled" | "void" | "voided",
    }
}

impl JobStatus {
    pub fn is_ready(self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Completed)
    }
}

string_enum! {
    /// Batch lifecycle. Monotonic in declaration order.
    BatchStatus, fallback = Queued {
        Queued => "queued" | "pending" | "new",
        Cooking => "cooking" | "in_progress" | "preparing" | "started",
        Ready => "ready" | "prepared",
        Assembled => "assembled" | "packed" | "bagged",
        Served => "served" | "picked_up" | "completed",
        Delivered => "delivered",
        Settled => "settled" | "closed" | "paid",
    }
}

impl BatchStatus {
    /// Statuses reached only through explicit operator actions. Once a batch
    /// is here its status is never recomputed from job data.
    pub fn is_handoff_stage(self) -> bool {
        self >= BatchStatus::Assembled
    }

    pub fn handoff_status(self) -> HandoffStatus {
        match self {
            BatchStatus::Queued | BatchStatus::Cooking => HandoffStatus::Pending,
            BatchStatus::Ready => HandoffStatus::Ready,
            BatchStatus::Assembled => HandoffStatus::Assembled,
            BatchStatus::Served | BatchStatus::Delivered | BatchStatus::Settled => {
                HandoffStatus::Served
            }
        }
    }
}

string_enum! {
    /// Per-order handoff disposition.
    HandoffStatus, fallback = Pending {
        Pending => "pending" | "queued" | "cooking",
        Ready => "ready",
        Assembled => "assembled",
        Served => "served" | "delivered" | "completed",
    }
}

impl HandoffStatus {
    pub fn batch_status(self) -> BatchStatus {
        match self {
            HandoffStatus::Pending => BatchStatus::Queued,
            HandoffStatus::Ready => BatchStatus::Ready,
            HandoffStatus::Assembled => BatchStatus::Assembled,
            HandoffStatus::Served => BatchStatus::Served,
        }
    }
}

string_enum! {
    StationType, fallback = Prep {
        Prep => "prep" | "kitchen" | "station",
        Expo => "expo" | "expeditor" | "pass",
    }
}

string_enum! {
    BatchType, fallback = Initial {
        Initial => "initial" | "original",
        Addition => "addition" | "add_on" | "addon",
    }
}

string_enum! {
    DeliveryStatus, fallback = Assigned {
        Assigned => "assigned" | "pending",
        OutForDelivery => "out_for_delivery" | "picked_up" | "en_route",
        Delivered => "delivered",
        Cancelled => "cancelled" | "canceled",
    }
}

string_enum! {
    ServiceMode, fallback = DineIn {
        DineIn => "dine_in" | "dinein" | "table",
        Takeaway => "takeaway" | "pickup" | "take_away",
        Delivery => "delivery",
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Station {
    pub id: String,
    pub code: Option<String>,
    pub name_ar: Option<String>,
    pub name_en: Option<String>,
    pub station_type: StationType,
    pub sequence: i64,
    pub theme_color: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MenuItem {
    pub id: String,
    pub code: Option<String>,
    pub name: Option<String>,
    pub category_id: Option<String>,
    pub section_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderHeader {
    pub id: String,
    pub order_number: Option<String>,
    pub service_mode: ServiceMode,
    pub table_label: Option<String>,
    pub customer_name: Option<String>,
    pub status: Option<String>,
    pub fulfillment_stage: Option<String>,
    pub version: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderLine {
    pub id: String,
    pub order_id: Option<String>,
    pub item_id: Option<String>,
    pub quantity: i64,
    pub status: JobStatus,
    pub version: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One (order x station) unit of work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    pub id: String,
    pub order_id: Option<String>,
    pub batch_id: Option<String>,
    pub station_id: Option<String>,
    pub status: JobStatus,
    pub progress_state: Option<String>,
    pub total_items: Option<i64>,
    pub completed_items: Option<i64>,
    pub remaining_items: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDetail {
    pub id: String,
    pub job_order_id: Option<String>,
    pub item_id: Option<String>,
    pub quantity: i64,
    pub status: JobStatus,
    pub prep_notes: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Batch {
    pub id: String,
    pub order_id: Option<String>,
    pub batch_type: BatchType,
    pub status: BatchStatus,
    pub version: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub assembled_at: Option<DateTime<Utc>>,
    pub served_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Cached per-order handoff disposition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandoffRecord {
    pub status: HandoffStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assembled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub served_at: Option<DateTime<Utc>>,
}

impl HandoffRecord {
    pub fn new(status: HandoffStatus, at: DateTime<Utc>) -> Self {
        Self {
            status,
            updated_at: Some(at),
            assembled_at: (status >= HandoffStatus::Assembled).then_some(at),
            served_at: (status == HandoffStatus::Served).then_some(at),
        }
    }

    /// Latest of the record's timestamps; the merge rule compares on this.
    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        [self.updated_at, self.assembled_at, self.served_at]
            .into_iter()
            .flatten()
            .max()
    }

    /// Only terminal dispositions are worth remembering across reloads.
    pub fn should_persist(&self) -> bool {
        matches!(
            self.status,
            HandoffStatus::Assembled | HandoffStatus::Served
        )
    }
}

/// A handoff row as delivered by the server feed (`order_handoffs`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffRow {
    pub order_id: String,
    pub status: HandoffStatus,
    pub updated_at: Option<DateTime<Utc>>,
    pub assembled_at: Option<DateTime<Utc>>,
    pub served_at: Option<DateTime<Utc>>,
}

impl From<HandoffRow> for HandoffRecord {
    fn from(row: HandoffRow) -> Self {
        HandoffRecord {
            status: row.status,
            updated_at: row.updated_at,
            assembled_at: row.assembled_at,
            served_at: row.served_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryAssignment {
    pub batch_id: String,
    pub driver_id: Option<String>,
    pub status: DeliveryStatus,
    pub assigned_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettlement {
    pub batch_id: String,
    pub driver_id: Option<String>,
    pub amount: Option<f64>,
    pub status: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Driver {
    pub id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub vehicle_id: Option<String>,
}

/// Normalized key for per-order maps (durable cache, feed handoff map).
pub fn order_key(order_id: &str) -> String {
    order_id.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_aliases_parse() {
        assert_eq!(JobStatus::parse("Preparing"), JobStatus::InProgress);
        assert_eq!(JobStatus::parse("in-progress"), JobStatus::InProgress);
        assert_eq!(JobStatus::parse("DONE"), JobStatus::Ready);
        assert_eq!(JobStatus::parse("mystery"), JobStatus::Queued);
        assert_eq!(BatchStatus::parse("picked_up"), BatchStatus::Served);
        assert_eq!(ServiceMode::parse("dine-in"), ServiceMode::DineIn);
    }

    #[test]
    fn test_batch_status_order_is_lifecycle_order() {
        assert!(BatchStatus::Queued < BatchStatus::Cooking);
        assert!(BatchStatus::Ready < BatchStatus::Assembled);
        assert!(BatchStatus::Delivered < BatchStatus::Settled);
        assert!(!BatchStatus::Ready.is_handoff_stage());
        assert!(BatchStatus::Assembled.is_handoff_stage());
        assert!(BatchStatus::Settled.is_handoff_stage());
    }

    #[test]
    fn test_handoff_record_resolved_at_takes_latest() {
        let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 0).unwrap();
        let record = HandoffRecord {
            status: HandoffStatus::Served,
            updated_at: Some(t1),
            assembled_at: Some(t1),
            served_at: Some(t2),
        };
        assert_eq!(record.resolved_at(), Some(t2));
        assert!(record.should_persist());
        assert!(!HandoffRecord::new(HandoffStatus::Ready, t1).should_persist());
    }

    #[test]
    fn test_handoff_record_json_shape() {
        let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let json = serde_json::to_value(HandoffRecord::new(HandoffStatus::Assembled, t1)).unwrap();
        assert_eq!(json["status"], "assembled");
        assert!(json.get("updatedAt").is_some());
        assert!(json.get("assembledAt").is_some());
        assert!(json.get("servedAt").is_none());
    }

    #[test]
    fn test_table_names_round_trip() {
        for table in Table::ALL {
            assert_eq!(Table::from_name(table.name()), Some(table));
        }
        assert!(Table::Batches.is_versioned());
        assert!(!Table::Jobs.is_versioned());
        assert_eq!(Table::Deliveries.key_field(), "batch_id");
    }
}
