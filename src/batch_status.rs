//! Pre-handoff status resolution for jobs and batches.
//!
//! Pure functions only. A batch that has already reached a handoff stage
//! (`assembled` and beyond) is never passed through [`compute_batch_status`]
//! to decide what it shows; see [`resolve_batch_status`].

use serde::Serialize;

use crate::model::{BatchStatus, Job, JobDetail, JobStatus};

/// Aggregate produced for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub status: BatchStatus,
    pub total_jobs: u32,
    pub ready_jobs: u32,
    pub cooking_jobs: u32,
    pub queued_jobs: u32,
    /// Percentage of ready jobs, rounded half up.
    pub progress: u8,
}

/// Aggregate job statuses into a pre-handoff batch status.
///
/// `ready` iff every job is ready, `cooking` iff any job is ready or in
/// progress, `queued` otherwise. Cancelled jobs are left out entirely. A
/// batch with no remaining jobs is `queued` at 0% with `total_jobs == 0`.
pub fn compute_batch_status<I>(statuses: I) -> BatchProgress
where
    I: IntoIterator<Item = JobStatus>,
{
    let mut total = 0u32;
    let mut ready = 0u32;
    let mut cooking = 0u32;
    for status in statuses {
        if status == JobStatus::Cancelled {
            continue;
        }
        total += 1;
        if status.is_ready() {
            ready += 1;
        } else if status == JobStatus::InProgress {
            cooking += 1;
        }
    }
    let queued = total - ready - cooking;

    let status = if total > 0 && ready == total {
        BatchStatus::Ready
    } else if ready + cooking > 0 {
        BatchStatus::Cooking
    } else {
        BatchStatus::Queued
    };

    BatchProgress {
        status,
        total_jobs: total,
        ready_jobs: ready,
        cooking_jobs: cooking,
        queued_jobs: queued,
        progress: percent(ready, total),
    }
}

/// Convenience over job headers, using each header's own status.
pub fn compute_for_jobs(jobs: &[Job]) -> BatchProgress {
    compute_batch_status(jobs.iter().map(|job| job.status))
}

/// Rounded percentage, `0` for an empty denominator.
pub fn percent(part: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let scaled = (u64::from(part) * 200 + u64::from(total)) / (u64::from(total) * 2);
    scaled.min(100) as u8
}

/// Effective status of a job given its detail lines.
///
/// `ready` iff every detail is ready or completed; otherwise the most
/// advanced detail status capped at `in_progress`. A header that already
/// says `completed` or `cancelled` wins, and a job with no details keeps its
/// header status.
pub fn effective_job_status(job: &Job, details: &[&JobDetail]) -> JobStatus {
    if matches!(job.status, JobStatus::Completed | JobStatus::Cancelled) {
        return job.status;
    }
    let active: Vec<JobStatus> = details
        .iter()
        .map(|d| d.status)
        .filter(|s| *s != JobStatus::Cancelled)
        .collect();
    if active.is_empty() {
        return job.status;
    }
    if active.iter().all(|s| s.is_ready()) {
        return JobStatus::Ready;
    }
    let from_details = if active.iter().any(|s| *s >= JobStatus::InProgress) {
        JobStatus::InProgress
    } else {
        JobStatus::Queued
    };
    from_details.max(job.status.min(JobStatus::InProgress))
}

/// Status a batch should display.
///
/// Handoff-stage statuses (persisted on the batch row, or remembered as a
/// floor) are authoritative. Before handoff the job aggregate governs, but
/// never below what the batch row itself already reports.
pub fn resolve_batch_status(
    persisted: Option<BatchStatus>,
    floor: Option<BatchStatus>,
    from_jobs: Option<BatchStatus>,
) -> BatchStatus {
    let known = persisted.max(floor);
    match known {
        Some(status) if status.is_handoff_stage() => status,
        _ => known.max(from_jobs).unwrap_or(BatchStatus::Queued),
    }
}
