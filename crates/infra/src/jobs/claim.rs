//! Claim coordinator.
//!
//! Workers race for queued jobs by locking `job_assignment` rows with
//! `FOR UPDATE ... SKIP LOCKED`. A row locked by one transaction is invisible
//! to every other claim attempt until that transaction ends, so N workers pick
//! N distinct jobs without waiting on each other. Ordering is oldest queued
//! first but only best effort under concurrent races.
//!
//! The same probe finds *dangling* jobs: a STARTED job whose assignment row
//! nobody holds has lost its worker, because a live worker keeps the row
//! locked through an [`ExecutionLease`] for as long as its runner executes.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use jobvault_core::{JobCode, JobError, JobResult, JobStatus};

use super::ledger::{self, status_predicate};
use super::map_sqlx_error;

/// Lock the oldest claimable QUEUED job's assignment row and return its code.
///
/// The row stays locked until `tx` ends. Within that same transaction the
/// caller must move the job to STARTED and commit, or roll back, promptly.
#[instrument(skip(tx), err)]
pub async fn try_claim_next_job(tx: &mut Transaction<'_, Postgres>) -> JobResult<Option<JobCode>> {
    let sql = format!(
        "SELECT ja.code \
         FROM job_assignment ja \
         JOIN job j ON j.code = ja.code \
         WHERE {} \
         ORDER BY j.queue_timestamp ASC, j.code ASC \
         LIMIT 1 \
         FOR UPDATE OF ja SKIP LOCKED",
        status_predicate(JobStatus::Queued)
    );

    let row = sqlx::query(&sql)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("try_claim_next_job", e))?;

    match row {
        Some(row) => {
            let code: Uuid = row
                .try_get("code")
                .map_err(|e| JobError::storage(format!("failed to read job code: {}", e)))?;
            debug!(job_code = %code, "claimed job assignment");
            Ok(Some(JobCode::from_uuid(code)))
        }
        None => Ok(None),
    }
}

/// Claim the next queued job and mark it STARTED in one short transaction.
///
/// Returns the code of the job this caller now owns, if any.
#[instrument(skip(pool), err)]
pub async fn claim_and_start_next_job(
    pool: &PgPool,
    now: DateTime<Utc>,
) -> JobResult<Option<JobCode>> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| map_sqlx_error("begin_transaction", e))?;

    let Some(code) = try_claim_next_job(&mut tx).await? else {
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))?;
        return Ok(None);
    };

    if !ledger::update_status(&mut tx, code, now, JobStatus::Started).await? {
        // claimed rows are QUEUED by construction; a no-op means the row moved
        // under us, so leave it alone
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))?;
        return Err(JobError::illegal_state(format!(
            "claimed job [{}] was already STARTED",
            code
        )));
    }

    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))?;

    Ok(Some(code))
}

/// STARTED jobs whose assignment row no live transaction holds.
///
/// Every returned row is locked by `tx` until it ends, so the caller can
/// recover those jobs without racing another sweeper.
#[instrument(skip(tx), err)]
pub async fn find_dangling_started_jobs(
    tx: &mut Transaction<'_, Postgres>,
) -> JobResult<Vec<JobCode>> {
    find_dangling_started_jobs_before(tx, None).await
}

/// Like [`find_dangling_started_jobs`] but limited to jobs started before
/// `started_before`, when given.
pub async fn find_dangling_started_jobs_before(
    tx: &mut Transaction<'_, Postgres>,
    started_before: Option<DateTime<Utc>>,
) -> JobResult<Vec<JobCode>> {
    let sql = format!(
        "SELECT ja.code \
         FROM job_assignment ja \
         JOIN job j ON j.code = ja.code \
         WHERE {} AND ($1::timestamptz IS NULL OR j.start_timestamp < $1) \
         ORDER BY j.start_timestamp ASC \
         FOR UPDATE OF ja SKIP LOCKED",
        status_predicate(JobStatus::Started)
    );

    let rows = sqlx::query(&sql)
        .bind(started_before)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("find_dangling_started_jobs", e))?;

    let mut codes = Vec::with_capacity(rows.len());
    for row in rows {
        let code: Uuid = row
            .try_get("code")
            .map_err(|e| JobError::storage(format!("failed to read job code: {}", e)))?;
        codes.push(JobCode::from_uuid(code));
    }

    if !codes.is_empty() {
        warn!(count = codes.len(), "found dangling started jobs");
    }
    Ok(codes)
}

/// Lock one job's assignment row without waiting.
///
/// Returns `false` when the row is missing or another transaction (a claim
/// or an execution lease) holds it.
pub(crate) async fn try_lock_assignment(
    tx: &mut Transaction<'_, Postgres>,
    code: JobCode,
) -> JobResult<bool> {
    let row = sqlx::query("SELECT code FROM job_assignment WHERE code = $1 FOR UPDATE SKIP LOCKED")
        .bind(code.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("try_lock_assignment", e))?;
    Ok(row.is_some())
}

/// Proof that this process is executing a job.
///
/// Holds the job's `job_assignment` row lock in its own otherwise idle
/// transaction. Dropping the lease rolls that transaction back and releases
/// the lock; [`ExecutionLease::release`] does the same but reports errors.
#[derive(Debug)]
pub struct ExecutionLease {
    code: JobCode,
    tx: Transaction<'static, Postgres>,
}

impl ExecutionLease {
    /// Lock the assignment row of `code`, waiting for a concurrent claim or
    /// sweep transaction to end first.
    #[instrument(skip(pool), fields(job_code = %code), err)]
    pub async fn acquire(pool: &PgPool, code: JobCode) -> JobResult<Self> {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query("SELECT code FROM job_assignment WHERE code = $1 FOR UPDATE")
            .bind(code.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("acquire_execution_lease", e))?;

        if row.is_none() {
            return Err(JobError::not_found(format!("job assignment [{}]", code)));
        }

        Ok(Self { code, tx })
    }

    pub fn job_code(&self) -> JobCode {
        self.code
    }

    pub async fn release(self) -> JobResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("release_execution_lease", e))
    }
}
