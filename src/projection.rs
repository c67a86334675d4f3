//! Order view models built from the snapshot store and the handoff cache.
//!
//! One [`OrderView`] per batch. Jobs that predate batching (no `batch_id`)
//! are grouped per order instead. The builder reads only; calling it twice
//! on the same inputs yields identical output, sorted by creation time
//! (missing times last) and then by key.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::batch_status::{compute_batch_status, effective_job_status, resolve_batch_status, BatchProgress};
use crate::handoff_cache::{DurableHandoffCache, HandoffMap};
use crate::model::{
    order_key, Batch, BatchStatus, BatchType, DeliveryAssignment, DeliverySettlement,
    DeliveryStatus, Driver, HandoffRecord, HandoffRow, HandoffStatus, Job, JobDetail, JobStatus,
    MenuItem, OrderHeader, ServiceMode, Station, StationType, Table,
};
use crate::snapshot::RawSnapshotStore;

/// Station id used for jobs that name no station.
pub const UNASSIGNED_STATION: &str = "unassigned";

/// Named consumer views.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViewKind {
    Prep,
    Station(String),
    Expo,
    Handoff,
    Delivery,
    DeliveryPending,
}

impl ViewKind {
    pub fn name(&self) -> String {
        match self {
            ViewKind::Prep => "prep".into(),
            ViewKind::Station(id) => format!("station:{id}"),
            ViewKind::Expo => "expo".into(),
            ViewKind::Handoff => "handoff".into(),
            ViewKind::Delivery => "delivery".into(),
            ViewKind::DeliveryPending => "delivery-pending".into(),
        }
    }

    pub fn parse(raw: &str) -> Option<ViewKind> {
        let raw = raw.trim();
        if let Some(station) = raw.strip_prefix("station:") {
            let station = station.trim();
            return (!station.is_empty()).then(|| ViewKind::Station(station.to_string()));
        }
        match raw.to_ascii_lowercase().as_str() {
            "prep" => Some(ViewKind::Prep),
            "expo" => Some(ViewKind::Expo),
            "handoff" => Some(ViewKind::Handoff),
            "delivery" => Some(ViewKind::Delivery),
            "delivery-pending" | "delivery_pending" => Some(ViewKind::DeliveryPending),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemView {
    pub detail_id: String,
    pub item_id: Option<String>,
    pub label: String,
    pub quantity: i64,
    pub status: JobStatus,
    pub prep_notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub station_id: String,
    /// Status derived from the detail lines.
    pub status: JobStatus,
    /// Status as written on the job row.
    pub reported_status: JobStatus,
    pub total_items: i64,
    pub ready_items: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub items: Vec<ItemView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationGroup {
    pub station_id: String,
    pub label: String,
    pub station_type: StationType,
    pub sequence: i64,
    pub theme_color: Option<String>,
    pub jobs: Vec<JobView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryView {
    pub driver_id: Option<String>,
    pub driver_name: Option<String>,
    pub driver_phone: Option<String>,
    pub status: DeliveryStatus,
    pub assigned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    /// Batch id, or `order:<id>` for jobs without a batch.
    pub key: String,
    pub batch_id: Option<String>,
    pub order_id: Option<String>,
    pub order_number: Option<String>,
    pub batch_type: BatchType,
    pub service_mode: ServiceMode,
    pub table_label: Option<String>,
    pub customer_name: Option<String>,
    pub status: BatchStatus,
    pub handoff_status: HandoffStatus,
    pub progress: BatchProgress,
    pub total_items: i64,
    pub ready_items: i64,
    pub stations: Vec<StationGroup>,
    pub delivery: Option<DeliveryView>,
    pub settlement: Option<DeliverySettlement>,
    pub created_at: Option<DateTime<Utc>>,
    pub assembled_at: Option<DateTime<Utc>>,
    pub served_at: Option<DateTime<Utc>>,
    pub version: Option<i64>,
}

impl OrderView {
    /// Still in the kitchen (not yet at a handoff stage).
    pub fn is_active(&self) -> bool {
        !self.status.is_handoff_stage()
    }

    fn has_open_job_at(&self, station_id: &str) -> bool {
        self.stations
            .iter()
            .filter(|group| group.station_id == station_id)
            .flat_map(|group| group.jobs.iter())
            .any(|job| !job.status.is_ready() && job.status != JobStatus::Cancelled)
    }

    fn awaits_driver(&self) -> bool {
        self.delivery
            .as_ref()
            .map_or(true, |d| d.status == DeliveryStatus::Cancelled)
    }
}

/// Badge counts per named view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabCounts {
    pub prep: usize,
    pub expo: usize,
    pub handoff: usize,
    pub delivery: usize,
    pub delivery_pending: usize,
    pub stations: BTreeMap<String, usize>,
}

impl TabCounts {
    pub fn get(&self, kind: &ViewKind) -> usize {
        match kind {
            ViewKind::Prep => self.prep,
            ViewKind::Station(id) => self.stations.get(id).copied().unwrap_or(0),
            ViewKind::Expo => self.expo,
            ViewKind::Handoff => self.handoff,
            ViewKind::Delivery => self.delivery,
            ViewKind::DeliveryPending => self.delivery_pending,
        }
    }
}

/// Whether `order` belongs in the named view.
///
/// - `prep`: still cooking (`queued`/`cooking`).
/// - `station:<id>`: active, with an unfinished job at that station.
/// - `expo`: every active batch.
/// - `handoff`: `assembled`, without a settlement.
/// - `delivery`: delivery orders at `assembled`/`served`.
/// - `delivery-pending`: the `delivery` subset without an active driver.
pub fn matches_view(order: &OrderView, kind: &ViewKind) -> bool {
    let out_for_delivery = order.service_mode == ServiceMode::Delivery
        && matches!(order.status, BatchStatus::Assembled | BatchStatus::Served);
    match kind {
        ViewKind::Prep => order.status < BatchStatus::Ready,
        ViewKind::Station(id) => order.is_active() && order.has_open_job_at(id),
        ViewKind::Expo => order.is_active(),
        ViewKind::Handoff => order.status == BatchStatus::Assembled && order.settlement.is_none(),
        ViewKind::Delivery => out_for_delivery,
        ViewKind::DeliveryPending => out_for_delivery && order.awaits_driver(),
    }
}

pub fn filter_view(orders: &[OrderView], kind: &ViewKind) -> Vec<OrderView> {
    orders
        .iter()
        .filter(|order| matches_view(order, kind))
        .cloned()
        .collect()
}

/// Counts for every fixed view plus each station in `station_ids`.
pub fn count_tabs<'a>(
    orders: &[OrderView],
    station_ids: impl IntoIterator<Item = &'a str>,
) -> TabCounts {
    let count = |kind: &ViewKind| orders.iter().filter(|o| matches_view(o, kind)).count();
    let mut stations = BTreeMap::new();
    for id in station_ids {
        stations.insert(id.to_string(), count(&ViewKind::Station(id.to_string())));
    }
    TabCounts {
        prep: count(&ViewKind::Prep),
        expo: count(&ViewKind::Expo),
        handoff: count(&ViewKind::Handoff),
        delivery: count(&ViewKind::Delivery),
        delivery_pending: count(&ViewKind::DeliveryPending),
        stations,
    }
}

/// Stations from the reference table plus any that only appear on jobs.
pub fn station_ids(snapshots: &RawSnapshotStore, orders: &[OrderView]) -> Vec<String> {
    let mut ids: Vec<String> = snapshots
        .typed::<Station>(Table::Stations)
        .into_iter()
        .map(|s| s.id)
        .collect();
    for order in orders {
        for group in &order.stations {
            ids.push(group.station_id.clone());
        }
    }
    ids.sort();
    ids.dedup();
    ids
}

#[derive(Default)]
struct Group<'a> {
    batch_id: Option<String>,
    order_id: Option<String>,
    jobs: Vec<&'a Job>,
}

/// Reference and per-order tables, indexed for one build.
struct Lookups {
    details_by_job: BTreeMap<String, Vec<JobDetail>>,
    batches: BTreeMap<String, Batch>,
    orders: BTreeMap<String, OrderHeader>,
    stations: BTreeMap<String, Station>,
    items: BTreeMap<String, MenuItem>,
    deliveries: BTreeMap<String, DeliveryAssignment>,
    settlements: BTreeMap<String, DeliverySettlement>,
    drivers: BTreeMap<String, Driver>,
    handoffs: HandoffMap,
}

pub struct ProjectionBuilder<'a> {
    snapshots: &'a RawSnapshotStore,
    handoffs: &'a DurableHandoffCache,
}

impl<'a> ProjectionBuilder<'a> {
    pub fn new(snapshots: &'a RawSnapshotStore, handoffs: &'a DurableHandoffCache) -> Self {
        Self { snapshots, handoffs }
    }

    pub fn build(&self) -> Vec<OrderView> {
        let lookups = self.lookups();
        let jobs: Vec<Job> = self.snapshots.typed(Table::Jobs);

        let mut groups: BTreeMap<String, Group<'_>> = BTreeMap::new();
        for job in &jobs {
            let key = match (&job.batch_id, &job.order_id) {
                (Some(batch_id), _) => batch_id.clone(),
                (None, Some(order_id)) => format!("order:{order_id}"),
                (None, None) => format!("job:{}", job.id),
            };
            let group = groups.entry(key).or_default();
            group.batch_id = group.batch_id.take().or_else(|| job.batch_id.clone());
            group.order_id = group.order_id.take().or_else(|| job.order_id.clone());
            group.jobs.push(job);
        }
        for batch in lookups.batches.values() {
            let group = groups.entry(batch.id.clone()).or_default();
            group.batch_id = Some(batch.id.clone());
            if batch.order_id.is_some() {
                group.order_id = batch.order_id.clone();
            }
        }

        let mut views: Vec<OrderView> = groups
            .into_iter()
            .map(|(key, group)| self.order_view(key, group, &lookups))
            .collect();
        views.sort_by(|a, b| {
            let a_key = (a.created_at.is_none(), a.created_at, &a.key);
            let b_key = (b.created_at.is_none(), b.created_at, &b.key);
            a_key.cmp(&b_key)
        });
        views
    }

    pub fn view(&self, kind: &ViewKind) -> Vec<OrderView> {
        filter_view(&self.build(), kind)
    }

    /// Badge counts, including every known station.
    pub fn tab_counts(&self) -> TabCounts {
        let orders = self.build();
        let station_ids = station_ids(self.snapshots, &orders);
        count_tabs(&orders, station_ids.iter().map(String::as_str))
    }

    fn lookups(&self) -> Lookups {
        let s = self.snapshots;
        let mut details_by_job: BTreeMap<String, Vec<JobDetail>> = BTreeMap::new();
        for detail in s.typed::<JobDetail>(Table::JobDetails) {
            if let Some(job_id) = detail.job_order_id.clone() {
                details_by_job.entry(job_id).or_default().push(detail);
            }
        }
        let feed_handoffs: HandoffMap = s
            .typed::<HandoffRow>(Table::Handoffs)
            .into_iter()
            .map(|row| (order_key(&row.order_id), HandoffRecord::from(row)))
            .collect();

        Lookups {
            details_by_job,
            batches: index(s.typed::<Batch>(Table::Batches), |b: &Batch| b.id.clone()),
            orders: index(s.typed::<OrderHeader>(Table::Orders), |o: &OrderHeader| o.id.clone()),
            stations: index(s.typed::<Station>(Table::Stations), |st: &Station| st.id.clone()),
            items: index(s.typed::<MenuItem>(Table::MenuItems), |i: &MenuItem| i.id.clone()),
            deliveries: index(s.typed::<DeliveryAssignment>(Table::Deliveries), |d: &DeliveryAssignment| {
                d.batch_id.clone()
            }),
            settlements: index(s.typed::<DeliverySettlement>(Table::Settlements), |d: &DeliverySettlement| {
                d.batch_id.clone()
            }),
            drivers: index(s.typed::<Driver>(Table::Drivers), |d: &Driver| d.id.clone()),
            handoffs: self.handoffs.merge_incoming(&feed_handoffs),
        }
    }

    fn order_view(&self, key: String, group: Group<'_>, lookups: &Lookups) -> OrderView {
        let batch = group.batch_id.as_ref().and_then(|id| lookups.batches.get(id));
        let order = group.order_id.as_ref().and_then(|id| lookups.orders.get(id));

        let job_views: Vec<JobView> = group
            .jobs
            .iter()
            .map(|job| {
                let details = lookups
                    .details_by_job
                    .get(&job.id)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                job_view(job, details, &lookups.items)
            })
            .collect();

        let progress = compute_batch_status(job_views.iter().map(|j| j.status));
        let total_items: i64 = job_views.iter().map(|j| j.total_items).sum();
        let ready_items: i64 = job_views.iter().map(|j| j.ready_items).sum();

        let created_at = batch
            .and_then(|b| b.created_at)
            .or_else(|| group.jobs.iter().filter_map(|j| j.created_at).min())
            .or_else(|| order.and_then(|o| o.created_at));

        let floor = group
            .batch_id
            .as_deref()
            .and_then(|id| self.snapshots.status_floor(id));
        // Only cancelled jobs left: the batch row keeps its own status.
        let from_jobs = (progress.total_jobs > 0).then_some(progress.status);
        let mut status = match (batch, &group.batch_id) {
            (Some(batch), _) => resolve_batch_status(Some(batch.status), floor, from_jobs),
            (None, Some(_)) => resolve_batch_status(None, floor, from_jobs),
            (None, None) => legacy_status(total_items, ready_items, progress.status),
        };

        // Handoff records are per order, so they only stand in for batches
        // the feed has no row for, and never lower a status.
        let record = group
            .order_id
            .as_deref()
            .filter(|_| batch.is_none())
            .and_then(|id| lookups.handoffs.get(&order_key(id)))
            .filter(|record| match (created_at, record.resolved_at()) {
                (Some(created), Some(resolved)) => created <= resolved,
                _ => true,
            });
        if let Some(record) = record {
            status = status.max(record.status.batch_status());
        }

        let delivery = group
            .batch_id
            .as_ref()
            .and_then(|id| lookups.deliveries.get(id))
            .map(|assignment| {
                let driver = assignment
                    .driver_id
                    .as_ref()
                    .and_then(|id| lookups.drivers.get(id));
                DeliveryView {
                    driver_id: assignment.driver_id.clone(),
                    driver_name: driver.and_then(|d| d.name.clone()),
                    driver_phone: driver.and_then(|d| d.phone.clone()),
                    status: assignment.status,
                    assigned_at: assignment.assigned_at,
                }
            });
        let settlement = group
            .batch_id
            .as_ref()
            .and_then(|id| lookups.settlements.get(id))
            .cloned();

        let record_in_view = record.filter(|_| status.is_handoff_stage());
        OrderView {
            key,
            batch_id: group.batch_id.clone(),
            order_id: group.order_id.clone(),
            order_number: order.and_then(|o| o.order_number.clone()),
            batch_type: batch.map(|b| b.batch_type).unwrap_or_default(),
            service_mode: order.map(|o| o.service_mode).unwrap_or_default(),
            table_label: order.and_then(|o| o.table_label.clone()),
            customer_name: order.and_then(|o| o.customer_name.clone()),
            status,
            handoff_status: status.handoff_status(),
            progress,
            total_items,
            ready_items,
            stations: station_groups(job_views, &lookups.stations),
            delivery,
            settlement,
            created_at,
            assembled_at: batch
                .and_then(|b| b.assembled_at)
                .or_else(|| record_in_view.and_then(|r| r.assembled_at)),
            served_at: batch
                .and_then(|b| b.served_at)
                .or_else(|| record_in_view.and_then(|r| r.served_at)),
            version: batch.map(|b| b.version),
        }
    }
}

fn index<T>(rows: Vec<T>, key: impl Fn(&T) -> String) -> BTreeMap<String, T> {
    rows.into_iter().map(|row| (key(&row), row)).collect()
}

/// Status for jobs that were never batched: item counts decide.
fn legacy_status(total_items: i64, ready_items: i64, from_jobs: BatchStatus) -> BatchStatus {
    if total_items <= 0 {
        return from_jobs;
    }
    if ready_items >= total_items {
        BatchStatus::Ready
    } else if ready_items > 0 || from_jobs > BatchStatus::Queued {
        BatchStatus::Cooking
    } else {
        BatchStatus::Queued
    }
}

fn job_view(job: &Job, details: &[JobDetail], items: &BTreeMap<String, MenuItem>) -> JobView {
    let refs: Vec<&JobDetail> = details.iter().collect();
    let status = effective_job_status(job, &refs);
    let active: Vec<&JobDetail> = details
        .iter()
        .filter(|d| d.status != JobStatus::Cancelled)
        .collect();

    let (total_items, detail_ready) = if active.is_empty() {
        let total = job.total_items.unwrap_or(0).max(0);
        (total, job.completed_items.unwrap_or(0).clamp(0, total))
    } else {
        let total = active.iter().map(|d| d.quantity.max(1)).sum();
        let ready = active
            .iter()
            .filter(|d| d.status.is_ready())
            .map(|d| d.quantity.max(1))
            .sum();
        (total, ready)
    };
    let ready_items = if status.is_ready() {
        total_items
    } else {
        detail_ready
    };

    JobView {
        id: job.id.clone(),
        station_id: job
            .station_id
            .clone()
            .unwrap_or_else(|| UNASSIGNED_STATION.to_string()),
        status,
        reported_status: job.status,
        total_items,
        ready_items,
        created_at: job.created_at,
        started_at: job.started_at,
        ready_at: job.ready_at,
        items: details
            .iter()
            .map(|detail| ItemView {
                detail_id: detail.id.clone(),
                item_id: detail.item_id.clone(),
                label: item_label(detail, items),
                quantity: detail.quantity,
                status: detail.status,
                prep_notes: detail.prep_notes.clone(),
            })
            .collect(),
    }
}

fn item_label(detail: &JobDetail, items: &BTreeMap<String, MenuItem>) -> String {
    let item = detail.item_id.as_ref().and_then(|id| items.get(id));
    item.and_then(|i| i.name.clone())
        .or_else(|| item.and_then(|i| i.code.clone()))
        .or_else(|| detail.item_id.clone())
        .unwrap_or_else(|| detail.id.clone())
}

fn station_label(station: Option<&Station>, id: &str) -> String {
    station
        .and_then(|s| {
            s.name_en
                .clone()
                .or_else(|| s.name_ar.clone())
                .or_else(|| s.code.clone())
        })
        .unwrap_or_else(|| id.to_string())
}

fn station_groups(jobs: Vec<JobView>, stations: &BTreeMap<String, Station>) -> Vec<StationGroup> {
    let mut by_station: BTreeMap<String, Vec<JobView>> = BTreeMap::new();
    for job in jobs {
        by_station.entry(job.station_id.clone()).or_default().push(job);
    }
    let mut groups: Vec<StationGroup> = by_station
        .into_iter()
        .map(|(station_id, mut jobs)| {
            jobs.sort_by(|a, b| {
                (a.created_at.is_none(), a.created_at, &a.id)
                    .cmp(&(b.created_at.is_none(), b.created_at, &b.id))
            });
            let station = stations.get(&station_id);
            StationGroup {
                label: station_label(station, &station_id),
                station_type: station.map(|s| s.station_type).unwrap_or_default(),
                sequence: station.map_or(i64::MAX, |s| s.sequence),
                theme_color: station.and_then(|s| s.theme_color.clone()),
                station_id,
                jobs,
            }
        })
        .collect();
    groups.sort_by(|a, b| (a.sequence, &a.station_id).cmp(&(b.sequence, &b.station_id)));
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{json, Value};

    fn t(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, min, 0).unwrap()
    }

    fn iso(min: u32) -> String {
        t(min).to_rfc3339()
    }

    fn store(tables: &[(Table, Vec<Value>)]) -> RawSnapshotStore {
        let mut snapshots = RawSnapshotStore::new();
        for (table, rows) in tables {
            snapshots.replace(*table, rows);
        }
        snapshots
    }

    fn build(snapshots: &RawSnapshotStore, cache: &DurableHandoffCache) -> Vec<OrderView> {
        ProjectionBuilder::new(snapshots, cache).build()
    }

    fn kitchen() -> RawSnapshotStore {
        store(&[
            (
                Table::Stations,
                vec![
                    json!({"id": "grill", "name_en": "Grill", "sequence": 2}),
                    json!({"id": "cold", "nameAr": "بارد", "sequence": 1}),
                    json!({"id": "pass", "code": "EXP", "type": "expo", "sequence": 9}),
                ],
            ),
            (
                Table::MenuItems,
                vec![
                    json!({"id": "m1", "name": "Burger"}),
                    json!({"id": "m2", "code": "SAL-01"}),
                ],
            ),
            (
                Table::Orders,
                vec![json!({"id": "o1", "order_number": "A-17", "service_mode": "delivery", "version": 1})],
            ),
            (
                Table::Batches,
                vec![json!({"id": "b1", "order_id": "o1", "status": "cooking", "version": 2, "created_at": iso(0)})],
            ),
            (
                Table::Jobs,
                vec![
                    json!({"id": "j1", "order_id": "o1", "batch_id": "b1", "station_id": "grill", "status": "in_progress"}),
                    json!({"id": "j2", "order_id": "o1", "batch_id": "b1", "station_id": "cold", "status": "ready"}),
                    json!({"id": "j3", "order_id": "o1", "batch_id": "b1", "station_id": "cold", "status": "ready"}),
                ],
            ),
            (
                Table::JobDetails,
                vec![
                    json!({"id": "d1", "job_order_id": "j1", "item_id": "m1", "quantity": 2, "status": "in_progress"}),
                    json!({"id": "d2", "job_order_id": "j2", "item_id": "m2", "quantity": 1, "status": "ready"}),
                    json!({"id": "d3", "job_order_id": "j3", "item_id": "m9", "quantity": 1, "status": "ready"}),
                ],
            ),
        ])
    }

    #[test]
    fn test_batch_view_aggregates_jobs_and_items() {
        let snapshots = kitchen();
        let cache = DurableHandoffCache::in_memory();
        let views = build(&snapshots, &cache);
        assert_eq!(views.len(), 1);
        let view = &views[0];

        assert_eq!(view.key, "b1");
        assert_eq!(view.order_number.as_deref(), Some("A-17"));
        assert_eq!(view.status, BatchStatus::Cooking);
        assert_eq!(view.progress.progress, 67);
        assert_eq!(view.total_items, 4);
        assert_eq!(view.ready_items, 2);

        let stations: Vec<(&str, &str)> = view
            .stations
            .iter()
            .map(|g| (g.station_id.as_str(), g.label.as_str()))
            .collect();
        assert_eq!(stations, vec![("cold", "بارد"), ("grill", "Grill")]);

        let labels: Vec<&str> = view.stations[0]
            .jobs
            .iter()
            .flat_map(|j| j.items.iter().map(|i| i.label.as_str()))
            .collect();
        assert_eq!(labels, vec!["SAL-01", "m9"]);
        assert_eq!(view.stations[1].jobs[0].items[0].label, "Burger");
    }

    #[test]
    fn test_projection_is_deterministic() {
        let snapshots = kitchen();
        let mut cache = DurableHandoffCache::in_memory();
        cache.put("o1", HandoffRecord::new(HandoffStatus::Assembled, t(30)));

        let first = build(&snapshots, &cache);
        let second = build(&snapshots, &cache);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_assembled_batch_is_never_recomputed_from_jobs() {
        let mut snapshots = kitchen();
        let cache = DurableHandoffCache::in_memory();
        snapshots.replace(
            Table::Batches,
            &[json!({"id": "b1", "order_id": "o1", "status": "assembled", "version": 3})],
        );
        assert_eq!(build(&snapshots, &cache)[0].status, BatchStatus::Assembled);

        // A lagging feed regresses the batch row and reopens a job.
        snapshots.replace(
            Table::Batches,
            &[json!({"id": "b1", "order_id": "o1", "status": "cooking", "version": 2})],
        );
        snapshots.replace(
            Table::Jobs,
            &[json!({"id": "j1", "order_id": "o1", "batch_id": "b1", "status": "queued"})],
        );
        snapshots.replace(Table::JobDetails, &[]);
        let view = &build(&snapshots, &cache)[0];
        assert_eq!(view.status, BatchStatus::Assembled);
        assert_eq!(view.handoff_status, HandoffStatus::Assembled);
    }

    #[test]
    fn test_durable_assembled_survives_pending_feed() {
        let snapshots = store(&[
            (
                Table::Jobs,
                vec![json!({"id": "j1", "order_id": "o7", "batch_id": "b7", "status": "ready"})],
            ),
            (Table::Handoffs, vec![json!({"orderId": "o7", "status": "pending"})]),
        ]);
        let mut cache = DurableHandoffCache::in_memory();
        cache.put("o7", HandoffRecord::new(HandoffStatus::Assembled, t(1)));

        let view = &build(&snapshots, &cache)[0];
        assert_eq!(view.status, BatchStatus::Assembled);
        assert_eq!(view.assembled_at, Some(t(1)));
    }

    #[test]
    fn test_handoff_record_does_not_cover_later_addition() {
        let snapshots = store(&[(
            Table::Jobs,
            vec![
                json!({"id": "j1", "order_id": "o1", "batch_id": "b1", "status": "ready", "created_at": iso(0)}),
                json!({"id": "j2", "order_id": "o1", "batch_id": "b2", "status": "queued", "created_at": iso(20)}),
            ],
        )]);
        let mut cache = DurableHandoffCache::in_memory();
        cache.put("o1", HandoffRecord::new(HandoffStatus::Served, t(10)));

        let views = build(&snapshots, &cache);
        assert_eq!(views[0].key, "b1");
        assert_eq!(views[0].status, BatchStatus::Served);
        assert_eq!(views[1].key, "b2");
        assert_eq!(views[1].status, BatchStatus::Queued);
    }

    #[test]
    fn test_handoff_record_never_overrides_a_batch_row() {
        let snapshots = store(&[
            (
                Table::Batches,
                vec![
                    json!({"id": "b1", "order_id": "o1", "status": "served", "created_at": iso(0)}),
                    json!({"id": "b2", "order_id": "o1", "batch_type": "addition", "status": "cooking", "created_at": iso(5)}),
                    json!({"id": "b3", "order_id": "o1", "batch_type": "addition", "status": "assembled", "created_at": iso(6)}),
                ],
            ),
            (
                Table::Jobs,
                vec![json!({"id": "j2", "order_id": "o1", "batch_id": "b2", "status": "in_progress"})],
            ),
        ]);
        let mut cache = DurableHandoffCache::in_memory();
        cache.put("o1", HandoffRecord::new(HandoffStatus::Served, t(7)));

        let views = build(&snapshots, &cache);
        let status = |key: &str| views.iter().find(|v| v.key == key).map(|v| v.status);
        assert_eq!(status("b1"), Some(BatchStatus::Served));
        assert_eq!(status("b2"), Some(BatchStatus::Cooking));
        assert_eq!(status("b3"), Some(BatchStatus::Assembled));

        let builder = ProjectionBuilder::new(&snapshots, &cache);
        let keys = |kind: ViewKind| -> Vec<String> {
            builder.view(&kind).into_iter().map(|v| v.key).collect()
        };
        assert_eq!(keys(ViewKind::Expo), vec!["b2"]);
        assert_eq!(keys(ViewKind::Prep), vec!["b2"]);
        assert_eq!(keys(ViewKind::Handoff), vec!["b3"]);
    }

    #[test]
    fn test_cancelled_job_does_not_hold_batch_back() {
        let snapshots = store(&[
            (
                Table::Batches,
                vec![
                    json!({"id": "b1", "status": "cooking", "created_at": iso(0)}),
                    json!({"id": "b2", "status": "cooking", "created_at": iso(1)}),
                ],
            ),
            (
                Table::Jobs,
                vec![
                    json!({"id": "j1", "batch_id": "b1", "status": "ready"}),
                    json!({"id": "j2", "batch_id": "b1", "status": "cancelled"}),
                    json!({"id": "j3", "batch_id": "b2", "status": "cancelled"}),
                ],
            ),
        ]);
        let cache = DurableHandoffCache::in_memory();
        let views = build(&snapshots, &cache);

        assert_eq!(views[0].key, "b1");
        assert_eq!(views[0].status, BatchStatus::Ready);
        assert_eq!(views[0].progress.progress, 100);
        assert!(!matches_view(&views[0], &ViewKind::Prep));

        // Nothing left to cook: the batch row decides.
        assert_eq!(views[1].key, "b2");
        assert_eq!(views[1].status, BatchStatus::Cooking);
    }

    #[test]
    fn test_legacy_jobs_group_by_order_and_compare_items() {
        let snapshots = store(&[(
            Table::Jobs,
            vec![
                json!({"id": "j1", "order_id": "o5", "status": "queued", "total_items": 3, "completed_items": 3}),
                json!({"id": "j2", "order_id": "o5", "status": "queued", "total_items": 1, "completed_items": 1}),
            ],
        )]);
        let cache = DurableHandoffCache::in_memory();
        let views = build(&snapshots, &cache);
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].key, "order:o5");
        assert_eq!(views[0].batch_id, None);
        assert_eq!(views[0].total_items, 4);
        assert_eq!(views[0].status, BatchStatus::Ready);
    }

    #[test]
    fn test_jobs_before_batch_row_use_resolver() {
        let snapshots = store(&[(
            Table::Jobs,
            vec![
                json!({"id": "j1", "batch_id": "b3", "status": "ready"}),
                json!({"id": "j2", "batch_id": "b3", "status": "queued"}),
            ],
        )]);
        let cache = DurableHandoffCache::in_memory();
        let view = &build(&snapshots, &cache)[0];
        assert_eq!(view.status, BatchStatus::Cooking);
        assert_eq!(view.progress.progress, 50);
    }

    #[test]
    fn test_views_and_tab_counts() {
        let snapshots = store(&[
            (Table::Stations, vec![json!({"id": "grill", "sequence": 1})]),
            (
                Table::Orders,
                vec![
                    json!({"id": "o1", "service_mode": "dine_in"}),
                    json!({"id": "o2", "service_mode": "delivery"}),
                    json!({"id": "o3", "service_mode": "delivery"}),
                ],
            ),
            (
                Table::Batches,
                vec![
                    json!({"id": "b1", "order_id": "o1", "status": "cooking", "created_at": iso(1)}),
                    json!({"id": "b2", "order_id": "o2", "status": "assembled", "created_at": iso(2)}),
                    json!({"id": "b3", "order_id": "o3", "status": "assembled", "created_at": iso(3)}),
                ],
            ),
            (
                Table::Jobs,
                vec![json!({"id": "j1", "batch_id": "b1", "station_id": "grill", "status": "in_progress"})],
            ),
            (Table::Deliveries, vec![json!({"batch_id": "b3", "driver_id": "drv", "status": "assigned"})]),
            (Table::Settlements, vec![json!({"batch_id": "b3", "amount": 10})]),
        ]);
        let cache = DurableHandoffCache::in_memory();
        let builder = ProjectionBuilder::new(&snapshots, &cache);

        let keys = |kind: ViewKind| -> Vec<String> {
            builder.view(&kind).into_iter().map(|v| v.key).collect()
        };
        assert_eq!(keys(ViewKind::Prep), vec!["b1"]);
        assert_eq!(keys(ViewKind::Station("grill".into())), vec!["b1"]);
        assert_eq!(keys(ViewKind::Expo), vec!["b1"]);
        assert_eq!(keys(ViewKind::Handoff), vec!["b2"]);
        assert_eq!(keys(ViewKind::Delivery), vec!["b2", "b3"]);
        assert_eq!(keys(ViewKind::DeliveryPending), vec!["b2"]);

        let counts = builder.tab_counts();
        assert_eq!(counts.prep, 1);
        assert_eq!(counts.handoff, 1);
        assert_eq!(counts.delivery, 2);
        assert_eq!(counts.delivery_pending, 1);
        assert_eq!(counts.get(&ViewKind::Station("grill".into())), 1);
    }

    #[test]
    fn test_sort_by_created_then_key_with_missing_last() {
        let snapshots = store(&[(
            Table::Batches,
            vec![
                json!({"id": "b-late", "created_at": iso(9)}),
                json!({"id": "b-none"}),
                json!({"id": "b-early", "created_at": iso(1)}),
                json!({"id": "a-early", "created_at": iso(1)}),
            ],
        )]);
        let cache = DurableHandoffCache::in_memory();
        let keys: Vec<String> = build(&snapshots, &cache).into_iter().map(|v| v.key).collect();
        assert_eq!(keys, vec!["a-early", "b-early", "b-late", "b-none"]);
    }

    #[test]
    fn test_view_kind_names_parse_back() {
        for kind in [
            ViewKind::Prep,
            ViewKind::Station("grill".into()),
            ViewKind::Expo,
            ViewKind::Handoff,
            ViewKind::Delivery,
            ViewKind::DeliveryPending,
        ] {
            assert_eq!(ViewKind::parse(&kind.name()), Some(kind));
        }
        assert_eq!(ViewKind::parse("station:"), None);
    }

    #[test]
    fn test_partial_tables_still_project() {
        let snapshots = store(&[(Table::JobDetails, vec![json!({"id": "d1", "job_order_id": "jx"})])]);
        let cache = DurableHandoffCache::in_memory();
        assert!(build(&snapshots, &cache).is_empty());
    }
}
