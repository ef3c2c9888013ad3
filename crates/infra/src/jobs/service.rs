//! Job service: the facade over ledger, claims, data and storage.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::io::AsyncRead;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

use jobvault_core::{
    CoalesceSet, JobCode, JobData, JobDataCode, JobDataEncoding, JobDataRole, JobDetails,
    JobError, JobResult, JobSnapshot, JobSpecification, JobStatus, derive_data_filename,
    simplify_media_type,
};

use super::claim::{self, ExecutionLease};
use super::data::{self, NewJobData};
use super::ledger::{self, NewJob};
use super::runner::{JobContext, RunnerRegistry};
use super::{coalesce, gc, map_sqlx_error};
use crate::config::JobServiceConfig;
use crate::storage::{DataStorage, StorageReader, StorageSink};

/// First and last delay between polls while awaiting completion.
const AWAIT_MIN_DELAY: Duration = Duration::from_millis(50);
const AWAIT_MAX_DELAY: Duration = Duration::from_secs(1);

/// How an attempt to execute a STARTED job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Finished,
    /// The runner returned an error or panicked.
    Failed,
    /// No runner is registered for the job's type.
    RunnerMissing,
    /// The job was not (or no longer) STARTED, e.g. cancelled or recovered
    /// as dangling; nothing was recorded.
    Skipped(JobStatus),
}

struct ServiceInner {
    pool: PgPool,
    storage: DataStorage,
    runners: RunnerRegistry,
    config: JobServiceConfig,
    submitted: Notify,
}

/// Entry point for submitting, observing and executing jobs.
///
/// Cheap to clone; clones share one pool, storage and runner registry.
#[derive(Clone)]
pub struct JobService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("config", &self.inner.config)
            .field("runners", &self.inner.runners)
            .finish_non_exhaustive()
    }
}

impl JobService {
    pub fn new(
        pool: PgPool,
        storage: DataStorage,
        runners: RunnerRegistry,
        config: JobServiceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                pool,
                storage,
                runners,
                config,
                submitted: Notify::new(),
            }),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    pub fn storage(&self) -> &DataStorage {
        &self.inner.storage
    }

    pub fn runners(&self) -> &RunnerRegistry {
        &self.inner.runners
    }

    pub fn config(&self) -> &JobServiceConfig {
        &self.inner.config
    }

    async fn conn(&self) -> JobResult<PoolConnection<Postgres>> {
        self.inner
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))
    }

    /// Resolves on the next local submission.
    pub(crate) async fn submitted(&self) {
        self.inner.submitted.notified().await
    }

    // ---- submission ------------------------------------------------------

    /// Queue a job, or return an existing equivalent job (same type, owner
    /// and payload) whose status is in `coalesce`.
    #[instrument(skip(self, spec), fields(job_type = %spec.job_type_code), err)]
    pub async fn submit(&self, spec: &JobSpecification, coalesce: CoalesceSet) -> JobResult<JobCode> {
        let job_type = spec.normalized_job_type_code()?;
        let now = Utc::now();

        if coalesce.contains(JobStatus::Started) {
            // a dead worker's job must not absorb new submissions
            gc::recover_dangling_jobs(self, now).await?;
        }

        if let Some(existing) =
            coalesce::find_coalescable_job(self.pool(), spec, &job_type, coalesce).await?
        {
            info!(job_code = %existing.code, status = %existing.status(), "submission coalesced");
            return Ok(existing.code);
        }

        let job = self.create_job(spec, &job_type, now, false).await?;
        self.inner.submitted.notify_waiters();
        Ok(job.code)
    }

    /// Run a job right away in this process, bypassing the queue.
    ///
    /// With `coalesce_finished`, the most recent equivalent FINISHED job is
    /// returned instead when there is one. With `wait`, the runner executes
    /// before this returns; otherwise it runs on a spawned task.
    #[instrument(skip(self, spec), fields(job_type = %spec.job_type_code), err)]
    pub async fn run_immediate(
        &self,
        spec: &JobSpecification,
        coalesce_finished: bool,
        wait: bool,
    ) -> JobResult<JobCode> {
        let job_type = spec.normalized_job_type_code()?;

        if coalesce_finished {
            let finished = ledger::stream_jobs_by_type_and_statuses(
                self.pool().clone(),
                job_type.clone(),
                vec![JobStatus::Finished],
            )
            .try_filter(|job| futures::future::ready(spec.is_equivalent(job)));
            futures::pin_mut!(finished);
            if let Some(existing) = finished.try_next().await? {
                debug!(job_code = %existing.code, "reusing finished job");
                return Ok(existing.code);
            }
        }

        let job = self.create_job(spec, &job_type, Utc::now(), true).await?;

        if wait {
            self.execute(job.code).await?;
        } else {
            let service = self.clone();
            let code = job.code;
            tokio::spawn(async move {
                if let Err(e) = service.execute(code).await {
                    error!(job_code = %code, error = %e, "immediate job execution failed");
                }
            });
        }

        Ok(job.code)
    }

    async fn create_job(
        &self,
        spec: &JobSpecification,
        job_type: &str,
        now: DateTime<Utc>,
        run_inline: bool,
    ) -> JobResult<JobSnapshot> {
        let ttl = self.config().effective_ttl(spec.time_to_live);
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| JobError::validation(format!("bad time to live: {}", e)))?;

        let new_job = NewJob {
            code: spec.code.unwrap_or_default(),
            job_type_code: job_type,
            owner: spec.owner.as_deref(),
            queue_time: now,
            time_to_live: ttl,
            payload: &spec.payload,
            supplied_data_codes: &spec.supplied_data_codes,
            run_inline,
        };

        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let job = ledger::create_job(&mut tx, &new_job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        info!(job_code = %job.code, job_type, run_inline, "job created");
        Ok(job)
    }

    // ---- data ------------------------------------------------------------

    /// Upload input for a job that does not exist yet.
    #[instrument(skip(self, source), err)]
    pub async fn store_supplied_data<R>(
        &self,
        use_code: Option<&str>,
        media_type: &str,
        encoding: JobDataEncoding,
        source: &mut R,
    ) -> JobResult<JobDataCode>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        simplify_media_type(media_type)?;
        let code = JobDataCode::new();
        let key = code.storage_key();

        let mut sink = self.storage().put(&key).await?;
        let written = async {
            sink.write_from(source).await?;
            sink.close().await
        }
        .await;

        let recorded: JobResult<u64> = async {
            let length = written?;
            let mut conn = self.conn().await?;
            let new_data = NewJobData {
                code,
                use_code,
                media_type,
                encoding,
            };
            data::create_supplied_data(&mut conn, &new_data).await?;
            Ok(length)
        }
        .await;

        match recorded {
            Ok(length) => {
                info!(data_code = %code, length, "supplied data stored");
                Ok(code)
            }
            Err(e) => {
                self.discard_blob(&key).await;
                Err(e)
            }
        }
    }

    /// Start an output of `job_code`. The bytes are committed as the sink is
    /// written and closed.
    #[instrument(skip(self), fields(job_code = %job_code), err)]
    pub async fn store_generated_data(
        &self,
        job_code: JobCode,
        use_code: Option<&str>,
        media_type: &str,
        encoding: JobDataEncoding,
    ) -> JobResult<(JobData, StorageSink)> {
        simplify_media_type(media_type)?;
        let code = JobDataCode::new();
        let key = code.storage_key();
        let sink = self.storage().put(&key).await?;

        let new_data = NewJobData {
            code,
            use_code,
            media_type,
            encoding,
        };
        let created = async {
            let mut conn = self.conn().await?;
            data::create_generated_data(&mut conn, job_code, &new_data).await
        }
        .await;

        match created {
            Ok(data) => Ok((data, sink)),
            Err(e) => {
                drop(sink);
                self.discard_blob(&key).await;
                Err(e)
            }
        }
    }

    async fn discard_blob(&self, key: &str) {
        if let Err(e) = self.storage().remove(key).await {
            warn!(key, error = %e, "failed to discard blob; left for the orphan sweep");
        }
    }

    pub async fn try_get_data(&self, code: JobDataCode) -> JobResult<Option<JobData>> {
        let mut conn = self.conn().await?;
        data::get_data(&mut conn, code).await
    }

    /// The job a piece of data belongs to, if it is attached to one.
    pub async fn try_get_job_for_data(&self, code: JobDataCode) -> JobResult<Option<JobSnapshot>> {
        let mut conn = self.conn().await?;
        let Some(job_code) = data::get_data(&mut conn, code).await?.and_then(|d| d.job_code) else {
            return Ok(None);
        };
        ledger::get_job(&mut conn, job_code).await
    }

    /// Download file name for a piece of data.
    pub async fn derive_data_filename(&self, code: JobDataCode) -> JobResult<String> {
        let data = self.try_get_data(code).await?;
        let job = self.try_get_job_for_data(code).await?;
        let timestamp = job
            .as_ref()
            .and_then(JobSnapshot::label_timestamp)
            .unwrap_or_else(Utc::now);

        Ok(derive_data_filename(
            &code,
            job.as_ref().map(|j| j.job_type_code.as_str()),
            timestamp,
            data.as_ref(),
        ))
    }

    /// Stream the bytes of a piece of data together with its record.
    pub async fn obtain_data(&self, code: JobDataCode) -> JobResult<Option<(JobData, StorageReader)>> {
        let Some(data) = self.try_get_data(code).await? else {
            return Ok(None);
        };
        match self.storage().get(&code.storage_key()).await? {
            Some(reader) => Ok(Some((data, reader))),
            None => Err(JobError::storage(format!(
                "job data [{}] has no stored bytes",
                code
            ))),
        }
    }

    pub async fn find_data_codes(
        &self,
        job_code: JobCode,
        role: JobDataRole,
    ) -> JobResult<Vec<JobDataCode>> {
        let mut conn = self.conn().await?;
        data::find_data_codes(&mut conn, job_code, role).await
    }

    // ---- queries ---------------------------------------------------------

    /// A job with its status and generated outputs.
    pub async fn get_job(&self, code: JobCode) -> JobResult<Option<JobDetails>> {
        let mut conn = self.conn().await?;
        let Some(job) = ledger::get_job(&mut conn, code).await? else {
            return Ok(None);
        };
        let generated_data_codes =
            data::find_data_codes(&mut conn, code, JobDataRole::Generated).await?;

        Ok(Some(JobDetails {
            status: job.status(),
            job,
            generated_data_codes,
        }))
    }

    pub async fn find_jobs(
        &self,
        owner: Option<&str>,
        statuses: &[JobStatus],
        offset: i64,
        limit: i64,
    ) -> JobResult<Vec<JobSnapshot>> {
        let mut conn = self.conn().await?;
        ledger::find_jobs(&mut conn, owner, statuses, offset, limit).await
    }

    pub async fn total_jobs(&self, owner: Option<&str>, statuses: &[JobStatus]) -> JobResult<i64> {
        let mut conn = self.conn().await?;
        ledger::total_jobs(&mut conn, owner, statuses).await
    }

    pub async fn count_not_finished(&self) -> JobResult<i64> {
        let mut conn = self.conn().await?;
        ledger::count_not_finished(&mut conn).await
    }

    pub async fn is_finished(&self, code: JobCode) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        ledger::is_finished(&mut conn, code).await
    }

    /// Wait until the job reaches a terminal status, polling with backoff.
    ///
    /// Returns the terminal status, or `None` once `timeout` elapses first.
    #[instrument(skip(self), fields(job_code = %code), err)]
    pub async fn await_finished(&self, code: JobCode, timeout: Duration) -> JobResult<Option<JobStatus>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = AWAIT_MIN_DELAY;

        loop {
            let job = {
                let mut conn = self.conn().await?;
                ledger::get_job(&mut conn, code).await?
            }
            .ok_or_else(|| JobError::not_found(format!("job [{}]", code)))?;

            if job.is_finished() {
                return Ok(Some(job.status()));
            }
            if !sleep_before(deadline, delay).await {
                return Ok(None);
            }
            delay = (delay * 2).min(AWAIT_MAX_DELAY);
        }
    }

    /// Wait until no job is left unfinished. Returns `false` on timeout.
    #[instrument(skip(self), err)]
    pub async fn await_all_finished(&self, timeout: Duration) -> JobResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = AWAIT_MIN_DELAY;

        loop {
            if self.count_not_finished().await? == 0 {
                return Ok(true);
            }
            if !sleep_before(deadline, delay).await {
                return Ok(false);
            }
            delay = (delay * 2).min(AWAIT_MAX_DELAY);
        }
    }

    // ---- lifecycle -------------------------------------------------------

    async fn update_status(&self, code: JobCode, target: JobStatus) -> JobResult<bool> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let changed = ledger::update_status(&mut tx, code, Utc::now(), target).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(changed)
    }

    pub async fn set_progress_percent(&self, code: JobCode, value: i64) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        ledger::set_progress_percent(&mut conn, code, value).await
    }

    /// Request cancellation. Runners observe it cooperatively.
    #[instrument(skip(self), fields(job_code = %code), err)]
    pub async fn cancel_job(&self, code: JobCode) -> JobResult<bool> {
        let changed = self.update_status(code, JobStatus::Cancelled).await?;
        if changed {
            info!(job_code = %code, "job cancelled");
        }
        Ok(changed)
    }

    #[instrument(skip(self), fields(job_code = %code), err)]
    pub async fn fail_job(&self, code: JobCode) -> JobResult<bool> {
        self.update_status(code, JobStatus::Failed).await
    }

    /// Delete a job with all of its data and stored bytes.
    ///
    /// A job that is executing right now is `IllegalState`.
    pub async fn remove_job(&self, code: JobCode) -> JobResult<bool> {
        gc::purge_job(self, code).await
    }

    /// Claim the next queued job and mark it STARTED.
    pub async fn claim_next_job(&self) -> JobResult<Option<JobCode>> {
        claim::claim_and_start_next_job(self.pool(), Utc::now()).await
    }

    /// STARTED jobs that no worker holds. Read only: the probe's locks are
    /// released before returning.
    pub async fn find_dangling_started_jobs(&self) -> JobResult<Vec<JobCode>> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let codes = claim::find_dangling_started_jobs(&mut tx).await?;
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))?;
        Ok(codes)
    }

    /// Execute a STARTED job under an execution lease and record how it
    /// ended. Runner errors and panics become FAILED; they never propagate.
    #[instrument(skip(self), fields(job_code = %code), err)]
    pub async fn execute(&self, code: JobCode) -> JobResult<ExecutionOutcome> {
        let lease = ExecutionLease::acquire(self.pool(), code).await?;
        let outcome = self.execute_leased(code).await;
        if let Err(e) = lease.release().await {
            warn!(job_code = %code, error = %e, "failed to release execution lease");
        }
        outcome
    }

    async fn execute_leased(&self, code: JobCode) -> JobResult<ExecutionOutcome> {
        let job = {
            let mut conn = self.conn().await?;
            ledger::get_job(&mut conn, code).await?
        }
        .ok_or_else(|| JobError::not_found(format!("job [{}]", code)))?;

        if job.status() != JobStatus::Started {
            debug!(job_code = %code, status = %job.status(), "job is not started; skipping");
            return Ok(ExecutionOutcome::Skipped(job.status()));
        }

        let Some(runner) = self.runners().get(&job.job_type_code) else {
            warn!(
                job_code = %code,
                error = %JobError::runner_missing(&job.job_type_code),
                "failing job"
            );
            self.update_status(code, JobStatus::Failed).await?;
            return Ok(ExecutionOutcome::RunnerMissing);
        };

        let ctx = JobContext::new(self.clone(), code);
        let job_type = job.job_type_code.clone();
        let started = tokio::time::Instant::now();
        let result = tokio::spawn(async move { runner.run(&ctx, &job).await }).await;

        let (target, outcome) = match result {
            Ok(Ok(())) => (JobStatus::Finished, ExecutionOutcome::Finished),
            Ok(Err(e)) => {
                warn!(job_code = %code, job_type, error = %format!("{e:#}"), "job runner failed");
                (JobStatus::Failed, ExecutionOutcome::Failed)
            }
            Err(join_err) => {
                error!(job_code = %code, job_type, error = %join_err, "job runner panicked");
                (JobStatus::Failed, ExecutionOutcome::Failed)
            }
        };

        match self.update_status(code, target).await {
            Ok(_) => {
                info!(
                    job_code = %code,
                    job_type,
                    status = %target,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job ended"
                );
                Ok(outcome)
            }
            Err(JobError::Transition { from, .. }) => {
                info!(job_code = %code, status = %from, "job ended elsewhere while running");
                Ok(ExecutionOutcome::Skipped(from))
            }
            Err(e) => Err(e),
        }
    }

    // ---- garbage collection ----------------------------------------------

    /// Remove terminal jobs whose expiry has passed, with their data.
    pub async fn clear_completed_expired_jobs(&self, now: DateTime<Utc>) -> JobResult<usize> {
        gc::clear_completed_expired_jobs(self, now).await
    }

    /// Run the full expiry sweep (see [`gc::clear_expired_jobs`]).
    pub async fn clear_expired_jobs(&self, now: DateTime<Utc>) -> JobResult<gc::SweepReport> {
        gc::clear_expired_jobs(self, now).await
    }
}

/// Sleep `delay`, clipped to `deadline`. Returns `false` when the deadline
/// had already passed.
async fn sleep_before(deadline: tokio::time::Instant, delay: Duration) -> bool {
    let now = tokio::time::Instant::now();
    if now >= deadline {
        return false;
    }
    tokio::time::sleep(delay.min(deadline - now)).await;
    true
}
