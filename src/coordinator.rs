//! Remote writes for operator actions.
//!
//! Each logical transition is one or more single-record writes. A write to a
//! versioned table carries `current + 1`, where `current` comes from the
//! freshest snapshot. Transient failures are retried with backoff, a version
//! conflict triggers one re-read and one corrected retry, and an update that
//! misses the remote row falls back to inserting the full known record.
//!
//! The snapshot is patched only after a write succeeds. A transition that
//! fails part way keeps the patches of the writes that did succeed.

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::backing_store::BackingStore;
use crate::batch_status::{compute_batch_status, effective_job_status, resolve_batch_status};
use crate::broadcast::CrossTabBroadcaster;
use crate::error::{StoreError, WriteError, WriteResult};
use crate::model::{
    Batch, BatchStatus, DeliveryAssignment, DeliverySettlement, DeliveryStatus, HandoffRecord,
    HandoffStatus, Job, JobDetail, JobStatus, OrderHeader, OrderLine, Row, Table,
};
use crate::normalize::{self, format_timestamp};
use crate::retry::{with_retry, RetryPolicy};
use crate::state::EngineState;

/// Result of a transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The target was already at (or past) the requested state.
    AlreadyApplied,
}

pub struct RemoteWriteCoordinator {
    store: Arc<dyn BackingStore>,
    state: Arc<EngineState>,
    broadcaster: Arc<CrossTabBroadcaster>,
    policy: RetryPolicy,
}

fn fields(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

fn version_of(row: &Row) -> Option<i64> {
    row.get("version").and_then(Value::as_i64)
}

fn failed(table: Table, key: &str, attempts: u32, source: StoreError) -> WriteError {
    WriteError::WriteFailed {
        table: table.name().to_string(),
        id: key.to_string(),
        attempts,
        source,
    }
}

fn unknown(table: Table, key: &str) -> WriteError {
    WriteError::UnknownRecord {
        table: table.name().to_string(),
        id: key.to_string(),
    }
}

fn invalid(entity: &'static str, id: &str, from: impl ToString, to: impl ToString) -> WriteError {
    WriteError::InvalidTransition {
        entity,
        id: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// Strip everything that is not a known field of `table`.
fn sanitize(table: Table, key: &str, patch: Row) -> WriteResult<Row> {
    if key.trim().is_empty() {
        return Err(WriteError::MalformedPayload {
            table: table.name().to_string(),
            reason: "missing record key".into(),
        });
    }
    let mut clean = normalize::canonical_fields(table, &Value::Object(patch.clone()));
    let stripped: Vec<&String> = patch.keys().filter(|k| !clean.contains_key(*k)).collect();
    if !stripped.is_empty() {
        debug!(table = %table, key, ?stripped, "stripped unknown fields from write");
    }
    clean.remove(table.key_field());
    clean.remove("version");
    if clean.is_empty() {
        return Err(WriteError::MalformedPayload {
            table: table.name().to_string(),
            reason: "no writable fields".into(),
        });
    }
    Ok(clean)
}

/// Whether `current` already shows what `patch` asks for. Timestamps and
/// version are ignored; batch status compares by lifecycle order.
fn already_applied(table: Table, current: &Row, patch: &Row) -> bool {
    let mut compared = 0;
    for (name, wanted) in patch {
        if name == "version" || name.ends_with("_at") {
            continue;
        }
        compared += 1;
        let have = current.get(name);
        let same = if table == Table::Batches && name == "status" {
            match (have.and_then(Value::as_str), wanted.as_str()) {
                (Some(have), Some(wanted)) => BatchStatus::parse(have) >= BatchStatus::parse(wanted),
                _ => false,
            }
        } else {
            have == Some(wanted)
        };
        if !same {
            return false;
        }
    }
    compared > 0
}

impl RemoteWriteCoordinator {
    pub fn new(
        store: Arc<dyn BackingStore>,
        state: Arc<EngineState>,
        broadcaster: Arc<CrossTabBroadcaster>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            state,
            broadcaster,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    // -----------------------------------------------------------------------
    // Single-record writes
    // -----------------------------------------------------------------------

    /// Update one record, returning the record as sent (or as found, when a
    /// conflict re-read shows the change already landed).
    pub async fn write(&self, table: Table, key: &str, patch: Row) -> WriteResult<Row> {
        let patch = sanitize(table, key, patch)?;
        let mut attempts = 0u32;
        let result = self.write_inner(table, key, &patch, &mut attempts).await;
        match result {
            Ok(row) => {
                info!(
                    table = %table,
                    key,
                    version = ?version_of(&row),
                    attempts,
                    "remote write applied"
                );
                self.state
                    .update_snapshots(|s| s.apply_patch(table, key, row.clone()));
                Ok(row)
            }
            Err(e) => {
                error!(table = %table, key, attempts, error = %e, "remote write failed");
                Err(failed(table, key, attempts, e))
            }
        }
    }

    /// Insert a record this engine owns; an existing row is updated instead.
    pub async fn create(&self, table: Table, key: &str, patch: Row) -> WriteResult<Row> {
        let clean = sanitize(table, key, patch)?;
        let mut record = clean.clone();
        record.insert(table.key_field().to_string(), Value::String(key.to_string()));
        if table.is_versioned() {
            record.insert("version".into(), Value::from(1));
        }
        let mut attempts = 0u32;
        let inserted = self.insert_with_retry(table, &record, &mut attempts).await;
        match inserted {
            Ok(_) => {
                info!(table = %table, key, attempts, "remote record created");
                self.state
                    .update_snapshots(|s| s.apply_patch(table, key, record.clone()));
                Ok(record)
            }
            Err(StoreError::Conflict { .. }) => {
                info!(table = %table, key, "record already exists remotely, updating instead");
                self.write(table, key, clean).await
            }
            Err(e) => {
                error!(table = %table, key, attempts, error = %e, "remote insert failed");
                Err(failed(table, key, attempts, e))
            }
        }
    }

    async fn write_inner(
        &self,
        table: Table,
        key: &str,
        patch: &Row,
        attempts: &mut u32,
    ) -> Result<Row, StoreError> {
        let known = self.state.read_snapshots(|s| s.row(table, key));

        let mut current_version = known.as_ref().and_then(version_of);
        if table.is_versioned() && current_version.is_none() {
            // Not in any snapshot yet: one point read for the version.
            current_version = self
                .read_with_retry(table, key, attempts)
                .await?
                .as_ref()
                .and_then(version_of);
        }

        let mut record = patch.clone();
        record.insert(table.key_field().to_string(), Value::String(key.to_string()));
        if table.is_versioned() {
            record.insert(
                "version".into(),
                Value::from(current_version.unwrap_or(0) + 1),
            );
        }

        let first = self.update_with_retry(table, &record, attempts).await;
        match first {
            Ok(_) => Ok(record),
            Err(StoreError::Conflict { current_version, .. }) if table.is_versioned() => {
                warn!(
                    table = %table,
                    key,
                    sent = ?version_of(&record),
                    server = ?current_version,
                    "version conflict, re-reading"
                );
                let Some(fresh) = self.read_with_retry(table, key, attempts).await? else {
                    return self.insert_fallback(table, key, known, record, attempts).await;
                };
                if already_applied(table, &fresh, patch) {
                    info!(table = %table, key, "conflicting write already reflected remotely");
                    return Ok(fresh);
                }
                let next = version_of(&fresh).or(current_version).unwrap_or(0) + 1;
                record.insert("version".into(), Value::from(next));
                self.update_with_retry(table, &record, attempts).await?;
                Ok(record)
            }
            Err(StoreError::NotFound { .. }) => {
                self.insert_fallback(table, key, known, record, attempts).await
            }
            Err(e) => Err(e),
        }
    }

    async fn insert_fallback(
        &self,
        table: Table,
        key: &str,
        known: Option<Row>,
        record: Row,
        attempts: &mut u32,
    ) -> Result<Row, StoreError> {
        warn!(table = %table, key, "update target missing remotely, inserting full record");
        let mut full = known.unwrap_or_default();
        for (name, value) in record {
            full.insert(name, value);
        }
        self.insert_with_retry(table, &full, attempts).await?;
        Ok(full)
    }

    async fn update_with_retry(
        &self,
        table: Table,
        record: &Row,
        attempts: &mut u32,
    ) -> Result<Row, StoreError> {
        let mut made = 0;
        let result = with_retry(&self.policy, "update", |n| {
            made = n;
            self.store.update(table, record.clone())
        })
        .await;
        *attempts += made;
        result.map_err(|f| f.error)
    }

    async fn insert_with_retry(
        &self,
        table: Table,
        record: &Row,
        attempts: &mut u32,
    ) -> Result<Row, StoreError> {
        let mut made = 0;
        let result = with_retry(&self.policy, "insert", |n| {
            made = n;
            self.store.insert(table, record.clone())
        })
        .await;
        *attempts += made;
        result.map_err(|f| f.error)
    }

    async fn read_with_retry(
        &self,
        table: Table,
        key: &str,
        attempts: &mut u32,
    ) -> Result<Option<Row>, StoreError> {
        let mut made = 0;
        let result = with_retry(&self.policy, "read", |n| {
            made = n;
            self.store.read(table, key)
        })
        .await;
        *attempts += made;
        result
            .map(|row| row.and_then(|raw| normalize::canonical_row(table, &Value::Object(raw))))
            .map_err(|f| f.error)
    }

    // -----------------------------------------------------------------------
    // Snapshot lookups
    // -----------------------------------------------------------------------

    fn job(&self, job_id: &str) -> WriteResult<Job> {
        self.state
            .read_snapshots(|s| s.typed_row(Table::Jobs, job_id))
            .ok_or_else(|| unknown(Table::Jobs, job_id))
    }

    /// Batch row plus the status the projection shows for it.
    fn batch(&self, batch_id: &str) -> WriteResult<(Batch, BatchStatus)> {
        self.state
            .read_snapshots(|s| {
                let batch = s.typed_row::<Batch>(Table::Batches, batch_id)?;
                let details: Vec<JobDetail> = s.typed(Table::JobDetails);
                let progress = compute_batch_status(
                    s.typed::<Job>(Table::Jobs)
                        .iter()
                        .filter(|job| job.batch_id.as_deref() == Some(batch_id))
                        .map(|job| {
                            let own: Vec<&JobDetail> = details
                                .iter()
                                .filter(|d| d.job_order_id.as_deref() == Some(job.id.as_str()))
                                .collect();
                            effective_job_status(job, &own)
                        }),
                );
                let from_jobs = (progress.total_jobs > 0).then_some(progress.status);
                let status =
                    resolve_batch_status(Some(batch.status), s.status_floor(batch_id), from_jobs);
                Some((batch, status))
            })
            .ok_or_else(|| unknown(Table::Batches, batch_id))
    }

    fn record_handoff(&self, batch: &Batch, status: HandoffStatus) -> HandoffRecord {
        let now = Utc::now();
        let Some(order_id) = batch.order_id.as_deref() else {
            return HandoffRecord::new(status, now);
        };
        self.state.update_handoffs(|cache| {
            let mut record = cache.get(order_id).cloned().unwrap_or_default();
            // A sibling batch already went further; its timestamps stay put.
            if record.status > status {
                return record;
            }
            record.status = status;
            record.updated_at = Some(now);
            record.assembled_at = record.assembled_at.or(batch.assembled_at).or(Some(now));
            if status == HandoffStatus::Served {
                record.served_at = Some(now);
            }
            cache.put(order_id, record.clone());
            record
        })
    }

    fn publish_handoff(&self, batch_id: &str, order_id: Option<&str>, row: &Row, record: &HandoffRecord) {
        let mut payload = json!({
            "batchId": batch_id,
            "status": row.get("status").cloned().unwrap_or(Value::Null),
            "version": row.get("version").cloned().unwrap_or(Value::Null),
            "handoffStatus": record.status.as_str(),
        });
        if let (Value::Object(map), Ok(Value::Object(times))) =
            (&mut payload, serde_json::to_value(record))
        {
            for (name, value) in times {
                if name != "status" {
                    map.insert(name, value);
                }
            }
        }
        self.broadcaster.publish_handoff(order_id, payload);
    }

    // -----------------------------------------------------------------------
    // Job transitions
    // -----------------------------------------------------------------------

    pub async fn start_job(&self, job_id: &str) -> WriteResult<TransitionOutcome> {
        let job = self.job(job_id)?;
        if job.status == JobStatus::Cancelled {
            return Err(invalid("job", job_id, job.status, JobStatus::InProgress));
        }
        if job.status >= JobStatus::InProgress {
            debug!(job_id, status = %job.status, "job already started");
            return Ok(TransitionOutcome::AlreadyApplied);
        }
        let now = format_timestamp(Utc::now());
        let row = self
            .write(
                Table::Jobs,
                job_id,
                fields(json!({
                    "status": JobStatus::InProgress.as_str(),
                    "started_at": now,
                    "updated_at": now,
                })),
            )
            .await?;
        self.broadcaster.publish_job(job_id, Value::Object(row));
        Ok(TransitionOutcome::Applied)
    }

    /// Mark the job and all of its unfinished detail lines ready.
    pub async fn finish_job(&self, job_id: &str) -> WriteResult<TransitionOutcome> {
        let job = self.job(job_id)?;
        if job.status == JobStatus::Cancelled {
            return Err(invalid("job", job_id, job.status, JobStatus::Ready));
        }
        let pending: Vec<JobDetail> = self.state.read_snapshots(|s| {
            s.typed::<JobDetail>(Table::JobDetails)
                .into_iter()
                .filter(|d| d.job_order_id.as_deref() == Some(job_id))
                .filter(|d| d.status != JobStatus::Cancelled && !d.status.is_ready())
                .collect()
        });
        let header_needed = !job.status.is_ready();
        if !header_needed && pending.is_empty() {
            return Ok(TransitionOutcome::AlreadyApplied);
        }

        let now = format_timestamp(Utc::now());
        let header = async {
            if !header_needed {
                return None;
            }
            Some(
                self.write(
                    Table::Jobs,
                    job_id,
                    fields(json!({
                        "status": JobStatus::Ready.as_str(),
                        "ready_at": now,
                        "updated_at": now,
                    })),
                )
                .await,
            )
        };
        let details = join_all(pending.iter().map(|detail| {
            self.write(
                Table::JobDetails,
                &detail.id,
                fields(json!({
                    "status": JobStatus::Ready.as_str(),
                    "updated_at": now,
                })),
            )
        }));
        let (header, details) = futures::join!(header, details);

        let mut first_error = None;
        let mut payload = Row::new();
        match header {
            Some(Ok(row)) => payload = row,
            Some(Err(e)) => first_error = Some(e),
            None => {}
        }
        let mut written_details = Vec::new();
        for result in details {
            match result {
                Ok(row) => written_details.push(Value::Object(row)),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if !payload.is_empty() || !written_details.is_empty() {
            payload.insert("details".into(), Value::Array(written_details));
            self.broadcaster.publish_job(job_id, Value::Object(payload));
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(TransitionOutcome::Applied),
        }
    }

    // -----------------------------------------------------------------------
    // Batch transitions
    // -----------------------------------------------------------------------

    /// requested -> batch write -> job completions in parallel -> durable
    /// cache -> broadcast.
    pub async fn mark_batch_assembled(&self, batch_id: &str) -> WriteResult<TransitionOutcome> {
        let (batch, status) = self.batch(batch_id)?;
        if status >= BatchStatus::Assembled {
            debug!(batch_id, status = %status, "batch already assembled");
            return Ok(TransitionOutcome::AlreadyApplied);
        }

        let now = format_timestamp(Utc::now());
        let row = self
            .write(
                Table::Batches,
                batch_id,
                fields(json!({
                    "status": BatchStatus::Assembled.as_str(),
                    "assembled_at": now,
                    "updated_at": now,
                })),
            )
            .await?;

        let open_jobs: Vec<Job> = self.state.read_snapshots(|s| {
            s.typed::<Job>(Table::Jobs)
                .into_iter()
                .filter(|j| j.batch_id.as_deref() == Some(batch_id))
                .filter(|j| !matches!(j.status, JobStatus::Completed | JobStatus::Cancelled))
                .collect()
        });
        let results = join_all(open_jobs.iter().map(|job| {
            self.write(
                Table::Jobs,
                &job.id,
                fields(json!({
                    "status": JobStatus::Completed.as_str(),
                    "completed_at": now,
                    "updated_at": now,
                })),
            )
        }))
        .await;

        let record = self.record_handoff(&batch, HandoffStatus::Assembled);
        self.publish_handoff(batch_id, batch.order_id.as_deref(), &row, &record);

        match results.into_iter().find_map(Result::err) {
            Some(e) => {
                warn!(batch_id, error = %e, "batch assembled but a job completion failed");
                Err(e)
            }
            None => Ok(TransitionOutcome::Applied),
        }
    }

    pub async fn mark_batch_served(&self, batch_id: &str) -> WriteResult<TransitionOutcome> {
        let (batch, status) = self.batch(batch_id)?;
        if status >= BatchStatus::Served {
            return Ok(TransitionOutcome::AlreadyApplied);
        }
        if status < BatchStatus::Ready {
            return Err(invalid("batch", batch_id, status, BatchStatus::Served));
        }

        let now = format_timestamp(Utc::now());
        let row = self
            .write(
                Table::Batches,
                batch_id,
                fields(json!({
                    "status": BatchStatus::Served.as_str(),
                    "served_at": now,
                    "updated_at": now,
                })),
            )
            .await?;
        let record = self.record_handoff(&batch, HandoffStatus::Served);
        self.publish_handoff(batch_id, batch.order_id.as_deref(), &row, &record);

        if let Some(order_id) = batch.order_id.as_deref() {
            if let Err(e) = self.complete_order_if_served(order_id).await {
                warn!(batch_id, order_id, error = %e, "batch served but order completion failed");
            }
        }
        Ok(TransitionOutcome::Applied)
    }

    /// Advance the order header once every batch of the order is served.
    /// Returns `true` when a write was made.
    pub async fn complete_order_if_served(&self, order_id: &str) -> WriteResult<bool> {
        let (all_served, order) = self.state.read_snapshots(|s| {
            let batches: Vec<Batch> = s
                .typed::<Batch>(Table::Batches)
                .into_iter()
                .filter(|b| b.order_id.as_deref() == Some(order_id))
                .collect();
            let all_served = !batches.is_empty()
                && batches.iter().all(|b| {
                    resolve_batch_status(Some(b.status), s.status_floor(&b.id), None)
                        >= BatchStatus::Served
                });
            (all_served, s.typed_row::<OrderHeader>(Table::Orders, order_id))
        });
        if !all_served {
            return Ok(false);
        }
        let Some(order) = order else {
            debug!(order_id, "order header not loaded, skipping completion");
            return Ok(false);
        };
        if order.fulfillment_stage.as_deref() == Some("served") {
            return Ok(false);
        }
        let row = self
            .write(
                Table::Orders,
                order_id,
                fields(json!({
                    "fulfillment_stage": "served",
                    "updated_at": format_timestamp(Utc::now()),
                })),
            )
            .await?;
        info!(order_id, "all batches served, order completed");
        self.broadcaster.publish_rows(Table::Orders, vec![row]);
        Ok(true)
    }

    pub async fn mark_batch_delivered(&self, batch_id: &str) -> WriteResult<TransitionOutcome> {
        let (batch, status) = self.batch(batch_id)?;
        if status >= BatchStatus::Delivered {
            return Ok(TransitionOutcome::AlreadyApplied);
        }
        if status < BatchStatus::Assembled {
            return Err(invalid("batch", batch_id, status, BatchStatus::Delivered));
        }

        let now = format_timestamp(Utc::now());
        let row = self
            .write(
                Table::Batches,
                batch_id,
                fields(json!({
                    "status": BatchStatus::Delivered.as_str(),
                    "updated_at": now,
                })),
            )
            .await?;
        self.record_handoff(&batch, HandoffStatus::Served);

        let assignment: Option<DeliveryAssignment> = self
            .state
            .read_snapshots(|s| s.typed_row(Table::Deliveries, batch_id));
        let mut payload = json!({ "batch": Value::Object(row) });
        let mut assignment_error = None;
        if assignment.is_some_and(|a| a.status != DeliveryStatus::Delivered) {
            match self
                .write(
                    Table::Deliveries,
                    batch_id,
                    fields(json!({
                        "status": DeliveryStatus::Delivered.as_str(),
                        "updated_at": now,
                    })),
                )
                .await
            {
                Ok(written) => payload["assignment"] = Value::Object(written),
                Err(e) => assignment_error = Some(e),
            }
        }
        self.broadcaster.publish_delivery(batch_id, payload);
        match assignment_error {
            Some(e) => Err(e),
            None => Ok(TransitionOutcome::Applied),
        }
    }

    pub async fn assign_driver(
        &self,
        batch_id: &str,
        driver_id: &str,
    ) -> WriteResult<TransitionOutcome> {
        let (_, status) = self.batch(batch_id)?;
        if status >= BatchStatus::Delivered {
            return Err(invalid("batch", batch_id, status, "assigned"));
        }
        let (driver_known, current) = self.state.read_snapshots(|s| {
            let known = !s.has_table(Table::Drivers) || s.row(Table::Drivers, driver_id).is_some();
            let current: Option<DeliveryAssignment> = s.typed_row(Table::Deliveries, batch_id);
            (known, current)
        });
        if !driver_known {
            return Err(unknown(Table::Drivers, driver_id));
        }
        if let Some(current) = &current {
            if current.driver_id.as_deref() == Some(driver_id)
                && current.status != DeliveryStatus::Cancelled
            {
                return Ok(TransitionOutcome::AlreadyApplied);
            }
        }

        let now = format_timestamp(Utc::now());
        let patch = fields(json!({
            "driver_id": driver_id,
            "status": DeliveryStatus::Assigned.as_str(),
            "assigned_at": now,
            "updated_at": now,
        }));
        let row = if current.is_some() {
            self.write(Table::Deliveries, batch_id, patch).await?
        } else {
            self.create(Table::Deliveries, batch_id, patch).await?
        };
        info!(batch_id, driver_id, "driver assigned");
        self.broadcaster
            .publish_delivery(batch_id, json!({ "assignment": Value::Object(row) }));
        Ok(TransitionOutcome::Applied)
    }

    /// Record the settlement and close the batch.
    pub async fn settle_delivery(
        &self,
        batch_id: &str,
        amount: Option<f64>,
    ) -> WriteResult<TransitionOutcome> {
        let (batch, status) = self.batch(batch_id)?;
        if status >= BatchStatus::Settled {
            return Ok(TransitionOutcome::AlreadyApplied);
        }
        if status < BatchStatus::Assembled {
            return Err(invalid("batch", batch_id, status, BatchStatus::Settled));
        }
        let (assignment, existing) = self.state.read_snapshots(|s| {
            (
                s.typed_row::<DeliveryAssignment>(Table::Deliveries, batch_id),
                s.typed_row::<DeliverySettlement>(Table::Settlements, batch_id),
            )
        });

        let now = format_timestamp(Utc::now());
        let mut patch = fields(json!({
            "status": "settled",
            "settled_at": now,
            "updated_at": now,
        }));
        if let Some(driver_id) = assignment.and_then(|a| a.driver_id) {
            patch.insert("driver_id".into(), Value::String(driver_id));
        }
        if let Some(amount) = amount {
            patch.insert("amount".into(), json!(amount));
        }
        let settlement = if existing.is_some() {
            self.write(Table::Settlements, batch_id, patch).await?
        } else {
            self.create(Table::Settlements, batch_id, patch).await?
        };

        let row = self
            .write(
                Table::Batches,
                batch_id,
                fields(json!({
                    "status": BatchStatus::Settled.as_str(),
                    "updated_at": now,
                })),
            )
            .await?;
        self.record_handoff(&batch, HandoffStatus::Served);
        info!(batch_id, ?amount, "delivery settled");
        self.broadcaster.publish_delivery(
            batch_id,
            json!({
                "settlement": Value::Object(settlement),
                "batch": Value::Object(row),
            }),
        );
        Ok(TransitionOutcome::Applied)
    }

    // -----------------------------------------------------------------------
    // Order lines
    // -----------------------------------------------------------------------

    pub async fn set_order_line_status(
        &self,
        line_id: &str,
        status: JobStatus,
    ) -> WriteResult<TransitionOutcome> {
        let line: OrderLine = self
            .state
            .read_snapshots(|s| s.typed_row(Table::OrderLines, line_id))
            .ok_or_else(|| unknown(Table::OrderLines, line_id))?;
        if line.status == status {
            return Ok(TransitionOutcome::AlreadyApplied);
        }
        let row = self
            .write(
                Table::OrderLines,
                line_id,
                fields(json!({
                    "status": status.as_str(),
                    "updated_at": format_timestamp(Utc::now()),
                })),
            )
            .await?;
        self.broadcaster.publish_rows(Table::OrderLines, vec![row]);
        Ok(TransitionOutcome::Applied)
    }
}
