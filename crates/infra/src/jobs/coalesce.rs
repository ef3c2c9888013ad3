//! Coalescing resolver: find an existing job a submission can reuse.

use futures::TryStreamExt;
use sqlx::PgPool;
use tracing::{debug, instrument};

use jobvault_core::{CoalesceSet, JobResult, JobSnapshot, JobSpecification};

use super::ledger;

/// The most recently queued job of `job_type_code` that is equivalent to
/// `spec` and whose status is in `coalesce`, if any. An empty set never
/// matches.
#[instrument(skip(pool, spec), err)]
pub async fn find_coalescable_job(
    pool: &PgPool,
    spec: &JobSpecification,
    job_type_code: &str,
    coalesce: CoalesceSet,
) -> JobResult<Option<JobSnapshot>> {
    if coalesce.is_empty() {
        return Ok(None);
    }

    let stream = ledger::stream_jobs_by_type_and_statuses(
        pool.clone(),
        job_type_code.to_string(),
        coalesce.statuses().to_vec(),
    )
    .try_filter(|job| {
        futures::future::ready(coalesce.contains(job.status()) && spec.is_equivalent(job))
    });

    futures::pin_mut!(stream);
    let found = stream.try_next().await?;

    if let Some(job) = &found {
        debug!(job_code = %job.code, status = %job.status(), "coalesced onto existing job");
    }
    Ok(found)
}
