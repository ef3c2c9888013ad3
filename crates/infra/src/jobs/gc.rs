//! Expiry sweep and dangling job recovery.
//!
//! Database rows go first, inside one transaction per job; blobs are removed
//! after commit. A blob left behind by a crash in between has no `job_data`
//! row pointing at it and is picked up by the orphan blob pass.

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{info, instrument, warn};

use jobvault_core::{JobCode, JobDataCode, JobError, JobResult, JobStatus};

use super::claim::{self, try_lock_assignment};
use super::service::JobService;
use super::{data, ledger, map_sqlx_error};

/// Advisory lock serializing full sweeps across processes.
pub(crate) const SWEEP_LOCK_KEY: i64 = 0x6a76_6763_7377_6570;

/// What one [`clear_expired_jobs`] run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    /// Another process held the sweep lock; nothing was done.
    pub skipped: bool,
    pub dangling_failed: usize,
    pub completed_expired: usize,
    /// Jobs of any status whose expiry lies more than the maximum time to
    /// live in the past.
    pub stale_expired: usize,
    pub orphan_data: usize,
    pub orphan_blobs: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.dangling_failed
            + self.completed_expired
            + self.stale_expired
            + self.orphan_data
            + self.orphan_blobs
    }
}

fn cutoff(now: DateTime<Utc>, age: std::time::Duration) -> JobResult<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| JobError::validation(format!("age {age:?} is out of range")))
}

/// Fail STARTED jobs that lost their worker.
///
/// Only jobs started longer ago than the dangling grace period count, so a
/// job claimed a moment ago is not failed before its worker takes the lease.
#[instrument(skip(service), err)]
pub async fn recover_dangling_jobs(service: &JobService, now: DateTime<Utc>) -> JobResult<usize> {
    let started_before = cutoff(now, service.config().dangling_grace)?;

    let mut tx = service
        .pool()
        .begin()
        .await
        .map_err(|e| map_sqlx_error("begin_transaction", e))?;

    let codes = claim::find_dangling_started_jobs_before(&mut tx, Some(started_before)).await?;
    let mut failed = 0;
    for code in &codes {
        if ledger::update_status(&mut tx, *code, now, JobStatus::Failed).await? {
            warn!(job_code = %code, "failed dangling job");
            failed += 1;
        }
    }

    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))?;
    Ok(failed)
}

/// Delete terminal jobs whose expiry lies before `now`.
#[instrument(skip(service), err)]
pub async fn clear_completed_expired_jobs(service: &JobService, now: DateTime<Utc>) -> JobResult<usize> {
    let codes = {
        let mut conn = acquire(service).await?;
        ledger::find_completed_expired_jobs(&mut conn, now).await?
    };
    purge_all(service, &codes).await
}

/// Full sweep: dangling recovery, expired jobs, then orphaned data and blobs.
///
/// The orphan blob pass only considers keys that parse as a
/// [`JobDataCode`]; blobs other users keep under other keys are left alone.
///
/// At most one process sweeps at a time; the others get a report with
/// `skipped` set.
#[instrument(skip(service), err)]
pub async fn clear_expired_jobs(service: &JobService, now: DateTime<Utc>) -> JobResult<SweepReport> {
    let mut guard = service
        .pool()
        .begin()
        .await
        .map_err(|e| map_sqlx_error("begin_transaction", e))?;

    let locked: bool = sqlx::query("SELECT pg_try_advisory_xact_lock($1) AS locked")
        .bind(SWEEP_LOCK_KEY)
        .fetch_one(&mut *guard)
        .await
        .map_err(|e| map_sqlx_error("try_sweep_lock", e))?
        .try_get("locked")
        .map_err(|e| JobError::storage(format!("failed to read lock result: {}", e)))?;

    if !locked {
        info!("another process is sweeping; skipping");
        return Ok(SweepReport {
            skipped: true,
            ..SweepReport::default()
        });
    }

    let result = sweep(service, now).await;

    guard
        .rollback()
        .await
        .map_err(|e| map_sqlx_error("release_sweep_lock", e))?;

    let report = result?;
    if report.total() > 0 {
        info!(
            dangling_failed = report.dangling_failed,
            completed_expired = report.completed_expired,
            stale_expired = report.stale_expired,
            orphan_data = report.orphan_data,
            orphan_blobs = report.orphan_blobs,
            "expiry sweep done"
        );
    }
    Ok(report)
}

async fn sweep(service: &JobService, now: DateTime<Utc>) -> JobResult<SweepReport> {
    let max_ttl = service.config().max_ttl;
    let stale_cutoff = cutoff(now, max_ttl)?;

    let dangling_failed = recover_dangling_jobs(service, now).await?;
    let completed_expired = clear_completed_expired_jobs(service, now).await?;

    let stale = {
        let mut conn = acquire(service).await?;
        ledger::find_jobs_expired_before(&mut conn, stale_cutoff).await?
    };
    let stale_expired = purge_all(service, &stale).await?;

    let orphan_data = {
        let mut conn = acquire(service).await?;
        let codes = data::find_orphan_supplied_data(&mut conn, stale_cutoff).await?;
        data::delete_data(&mut conn, &codes).await?;
        codes
    };
    remove_blobs(service, &orphan_data).await;

    let orphan_blobs = {
        let mut keys = service.storage().keys(max_ttl).await?;
        // only keys shaped like job data codes are ours to reclaim
        keys.retain(|key| key.parse::<JobDataCode>().is_ok());
        let mut conn = acquire(service).await?;
        data::unreferenced_storage_codes(&mut conn, &keys).await?
    };
    let mut removed_blobs = 0;
    for key in &orphan_blobs {
        match service.storage().remove(key).await {
            Ok(true) => removed_blobs += 1,
            Ok(false) => {}
            Err(e) => warn!(key = %key, error = %e, "failed to remove orphan blob"),
        }
    }

    Ok(SweepReport {
        skipped: false,
        dangling_failed,
        completed_expired,
        stale_expired,
        orphan_data: orphan_data.len(),
        orphan_blobs: removed_blobs,
    })
}

/// Delete one job with its data rows and blobs.
///
/// Returns `false` for an unknown job. A job whose assignment row is locked
/// (being claimed or executed) is `IllegalState`.
#[instrument(skip(service), fields(job_code = %code), err)]
pub async fn purge_job(service: &JobService, code: JobCode) -> JobResult<bool> {
    let mut tx = service
        .pool()
        .begin()
        .await
        .map_err(|e| map_sqlx_error("begin_transaction", e))?;

    if !try_lock_assignment(&mut tx, code).await? {
        let exists = ledger::get_job(&mut tx, code).await?.is_some();
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))?;
        return if exists {
            Err(JobError::illegal_state(format!("job [{}] is running", code)))
        } else {
            Ok(false)
        };
    }

    let data_codes = data::find_all_data_codes(&mut tx, code).await?;
    data::delete_data(&mut tx, &data_codes).await?;
    let deleted = ledger::delete_job(&mut tx, code).await?;

    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))?;

    remove_blobs(service, &data_codes).await;
    Ok(deleted)
}

async fn purge_all(service: &JobService, codes: &[JobCode]) -> JobResult<usize> {
    let mut purged = 0;
    for code in codes {
        match purge_job(service, *code).await {
            Ok(true) => purged += 1,
            Ok(false) => {}
            Err(JobError::IllegalState(msg)) => {
                warn!(job_code = %code, reason = %msg, "expired job left for the next sweep");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(purged)
}

async fn remove_blobs(service: &JobService, codes: &[JobDataCode]) {
    for code in codes {
        if let Err(e) = service.storage().remove(&code.storage_key()).await {
            warn!(data_code = %code, error = %e, "failed to remove blob; left for the orphan sweep");
        }
    }
}

async fn acquire(service: &JobService) -> JobResult<sqlx::pool::PoolConnection<sqlx::Postgres>> {
    service
        .pool()
        .acquire()
        .await
        .map_err(|e| map_sqlx_error("acquire_connection", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_total_ignores_the_skip_flag() {
        let report = SweepReport {
            skipped: true,
            dangling_failed: 1,
            completed_expired: 2,
            stale_expired: 0,
            orphan_data: 3,
            orphan_blobs: 4,
        };
        assert_eq!(report.total(), 10);
        assert_eq!(SweepReport::default().total(), 0);
    }

    #[test]
    fn cutoff_rejects_ages_beyond_the_calendar() {
        let now = Utc::now();
        assert_eq!(
            cutoff(now, std::time::Duration::from_secs(60)).unwrap(),
            now - chrono::Duration::seconds(60)
        );
        assert!(matches!(
            cutoff(now, std::time::Duration::from_secs(10_000_000_000_000)),
            Err(JobError::Validation(_))
        ));
        assert!(matches!(
            cutoff(now, std::time::Duration::MAX),
            Err(JobError::Validation(_))
        ));
    }
}
