//! Job ledger: job rows and their timestamp-derived lifecycle.
//!
//! Every function takes a plain connection so callers decide the transaction
//! boundary; functions that must run inside a transaction say so.
//!
//! Status is never a column. Filters on status are expressed as predicates
//! over the five timestamps that mirror [`JobTimestamps::status`].

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use futures::Stream;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use jobvault_core::{
    JobCode, JobDataCode, JobError, JobResult, JobSnapshot, JobStatus, JobTimestamps,
    ProgressPercent,
};

use super::{data, map_sqlx_error};

const JOB_COLUMNS: &str = r#"
    j.code,
    jt.code AS job_type_code,
    j.owner,
    j.specification,
    j.progress_percent,
    j.queue_timestamp,
    j.start_timestamp,
    j.finish_timestamp,
    j.fail_timestamp,
    j.cancel_timestamp,
    j.expiry_timestamp
"#;

const JOB_FROM: &str = "job j JOIN job_type jt ON jt.id = j.job_type_id";

const NOT_FINISHED: &str =
    "(j.finish_timestamp IS NULL AND j.fail_timestamp IS NULL AND j.cancel_timestamp IS NULL)";

/// Rows fetched per round trip by [`stream_jobs_by_type_and_statuses`].
const STREAM_PAGE_SIZE: i64 = 16;

/// SQL predicate (over alias `j`) matching jobs whose derived status is
/// `status`.
pub(crate) fn status_predicate(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Indeterminate => {
            "(j.queue_timestamp IS NULL AND j.start_timestamp IS NULL \
             AND j.finish_timestamp IS NULL AND j.fail_timestamp IS NULL \
             AND j.cancel_timestamp IS NULL)"
        }
        JobStatus::Queued => {
            "(j.queue_timestamp IS NOT NULL AND j.start_timestamp IS NULL \
             AND j.finish_timestamp IS NULL AND j.fail_timestamp IS NULL \
             AND j.cancel_timestamp IS NULL)"
        }
        JobStatus::Started => {
            "(j.start_timestamp IS NOT NULL AND j.finish_timestamp IS NULL \
             AND j.fail_timestamp IS NULL AND j.cancel_timestamp IS NULL)"
        }
        JobStatus::Finished => {
            "(j.finish_timestamp IS NOT NULL AND j.fail_timestamp IS NULL \
             AND j.cancel_timestamp IS NULL)"
        }
        JobStatus::Failed => "(j.fail_timestamp IS NOT NULL AND j.cancel_timestamp IS NULL)",
        JobStatus::Cancelled => "(j.cancel_timestamp IS NOT NULL)",
    }
}

/// OR-combined predicate for a status set; an empty set matches every job.
pub(crate) fn statuses_predicate(statuses: &[JobStatus]) -> String {
    if statuses.is_empty() {
        return "TRUE".to_string();
    }

    let mut seen = Vec::with_capacity(statuses.len());
    for status in statuses {
        if !seen.contains(status) {
            seen.push(*status);
        }
    }

    let parts: Vec<&str> = seen.into_iter().map(status_predicate).collect();
    format!("({})", parts.join(" OR "))
}

fn timestamp_column(status: JobStatus) -> JobResult<&'static str> {
    match status {
        JobStatus::Queued => Ok("queue_timestamp"),
        JobStatus::Started => Ok("start_timestamp"),
        JobStatus::Finished => Ok("finish_timestamp"),
        JobStatus::Failed => Ok("fail_timestamp"),
        JobStatus::Cancelled => Ok("cancel_timestamp"),
        JobStatus::Indeterminate => Err(JobError::illegal_state(
            "INDETERMINATE has no lifecycle timestamp",
        )),
    }
}

/// Everything needed to insert a job row.
#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    pub code: JobCode,
    /// Already normalized (see `normalize_job_type_code`).
    pub job_type_code: &'a str,
    pub owner: Option<&'a str>,
    pub queue_time: DateTime<Utc>,
    pub time_to_live: Duration,
    pub payload: &'a serde_json::Value,
    pub supplied_data_codes: &'a [JobDataCode],
    /// Create the job already STARTED, bypassing the queue.
    pub run_inline: bool,
}

/// Look up a job type id, creating the type on first use.
async fn ensure_job_type(conn: &mut PgConnection, code: &str) -> JobResult<i64> {
    sqlx::query("INSERT INTO job_type (code) VALUES ($1) ON CONFLICT (code) DO NOTHING")
        .bind(code)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("ensure_job_type", e))?;

    let row = sqlx::query("SELECT id FROM job_type WHERE code = $1")
        .bind(code)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("ensure_job_type", e))?;

    row.try_get("id")
        .map_err(|e| JobError::storage(format!("failed to read job type id: {}", e)))
}

/// Insert a QUEUED (or, for inline runs, STARTED) job and attach its
/// supplied data.
///
/// Run inside a transaction: a failure while attaching supplied data must
/// roll the job back too.
#[instrument(
    skip(conn, job),
    fields(job_code = %job.code, job_type = job.job_type_code, run_inline = job.run_inline),
    err
)]
pub async fn create_job(conn: &mut PgConnection, job: &NewJob<'_>) -> JobResult<JobSnapshot> {
    let expiry = job
        .queue_time
        .checked_add_signed(job.time_to_live)
        .ok_or_else(|| JobError::validation("time to live is out of range"))?;

    let existing = sqlx::query("SELECT 1 FROM job_assignment WHERE code = $1")
        .bind(job.code.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("create_job", e))?;

    if existing.is_some() {
        return Err(JobError::illegal_state(format!(
            "job [{}] already exists",
            job.code
        )));
    }

    let job_type_id = ensure_job_type(conn, job.job_type_code).await?;

    sqlx::query("INSERT INTO job_assignment (code) VALUES ($1)")
        .bind(job.code.as_uuid())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("insert_job_assignment", e))?;

    let mut timestamps = JobTimestamps::queued_at(job.queue_time);
    if job.run_inline {
        timestamps.start = Some(job.queue_time);
    }

    let row = sqlx::query(
        r#"
        INSERT INTO job (
            code,
            job_type_id,
            owner,
            specification,
            progress_percent,
            queue_timestamp,
            start_timestamp,
            expiry_timestamp,
            create_timestamp,
            modify_timestamp
        )
        VALUES ($1, $2, $3, $4, 0, $5, $6, $7, $5, $5)
        RETURNING id
        "#,
    )
    .bind(job.code.as_uuid())
    .bind(job_type_id)
    .bind(job.owner)
    .bind(job.payload)
    .bind(timestamps.queue)
    .bind(timestamps.start)
    .bind(expiry)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_job", e))?;

    let job_id: i64 = row
        .try_get("id")
        .map_err(|e| JobError::storage(format!("failed to read job id: {}", e)))?;

    for data_code in job.supplied_data_codes {
        data::attach_supplied_data(conn, job_id, job.code, *data_code).await?;
    }

    debug!(
        job_code = %job.code,
        supplied = job.supplied_data_codes.len(),
        expiry = %expiry,
        "job created"
    );

    Ok(JobSnapshot {
        code: job.code,
        job_type_code: job.job_type_code.to_string(),
        owner: job.owner.map(str::to_string),
        payload: job.payload.clone(),
        progress: ProgressPercent::ZERO,
        timestamps,
        expiry,
    })
}

/// Move a job to `target` by setting the one timestamp it implies.
///
/// Returns `Ok(false)` when the job already has that status. Moves the
/// lifecycle forbids fail with [`JobError::Transition`]. The job row is locked
/// for the rest of the caller's transaction.
#[instrument(skip(conn), fields(job_code = %code, target = %target), err)]
pub async fn update_status(
    conn: &mut PgConnection,
    code: JobCode,
    now: DateTime<Utc>,
    target: JobStatus,
) -> JobResult<bool> {
    let row = sqlx::query(
        r#"
        SELECT
            queue_timestamp,
            start_timestamp,
            finish_timestamp,
            fail_timestamp,
            cancel_timestamp
        FROM job
        WHERE code = $1
        FOR UPDATE
        "#,
    )
    .bind(code.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("update_status", e))?
    .ok_or_else(|| JobError::not_found(format!("job [{}]", code)))?;

    let timestamps = timestamps_from_row(&row)
        .map_err(|e| JobError::storage(format!("failed to decode job timestamps: {}", e)))?;
    let current = timestamps.status();

    let Some(status) = timestamps.plan_transition(target)? else {
        return Ok(false);
    };

    let column = timestamp_column(status)?;
    let progress = status.progress_on_entry().map(i32::from);
    let sql = format!(
        "UPDATE job \
         SET {column} = $2, modify_timestamp = $2, \
             progress_percent = COALESCE($3, progress_percent) \
         WHERE code = $1"
    );

    let result = sqlx::query(&sql)
        .bind(code.as_uuid())
        .bind(now)
        .bind(progress)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("update_status", e))?;

    if result.rows_affected() != 1 {
        return Err(JobError::illegal_state(format!(
            "status update of job [{}] touched {} rows",
            code,
            result.rows_affected()
        )));
    }

    debug!(job_code = %code, from = %current, to = %status, "job status changed");
    Ok(true)
}

/// Record progress of a STARTED job.
///
/// The value is clamped to `0..=100`. Returns `Ok(false)` when the job is
/// not STARTED or already has that value.
#[instrument(skip(conn), fields(job_code = %code), err)]
pub async fn set_progress_percent(
    conn: &mut PgConnection,
    code: JobCode,
    value: i64,
) -> JobResult<bool> {
    let progress = i32::from(ProgressPercent::clamped(value));
    let sql = format!(
        "UPDATE job AS j \
         SET progress_percent = $2, modify_timestamp = NOW() \
         WHERE j.code = $1 AND {} AND j.progress_percent <> $2",
        status_predicate(JobStatus::Started)
    );

    let result = sqlx::query(&sql)
        .bind(code.as_uuid())
        .bind(progress)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("set_progress_percent", e))?;

    if result.rows_affected() > 0 {
        return Ok(true);
    }

    if job_exists(conn, code).await? {
        Ok(false)
    } else {
        Err(JobError::not_found(format!("job [{}]", code)))
    }
}

async fn job_exists(conn: &mut PgConnection, code: JobCode) -> JobResult<bool> {
    let row = sqlx::query("SELECT 1 FROM job WHERE code = $1")
        .bind(code.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("job_exists", e))?;
    Ok(row.is_some())
}

/// Number of jobs with no terminal timestamp set.
#[instrument(skip(conn), err)]
pub async fn count_not_finished(conn: &mut PgConnection) -> JobResult<i64> {
    let sql = format!("SELECT COUNT(*) AS total FROM job j WHERE {NOT_FINISHED}");
    let row = sqlx::query(&sql)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("count_not_finished", e))?;

    row.try_get("total")
        .map_err(|e| JobError::storage(format!("failed to read count: {}", e)))
}

/// True when any terminal timestamp of the job is set.
#[instrument(skip(conn), fields(job_code = %code), err)]
pub async fn is_finished(conn: &mut PgConnection, code: JobCode) -> JobResult<bool> {
    let sql = format!("SELECT NOT {NOT_FINISHED} AS finished FROM job j WHERE j.code = $1");
    let row = sqlx::query(&sql)
        .bind(code.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("is_finished", e))?
        .ok_or_else(|| JobError::not_found(format!("job [{}]", code)))?;

    row.try_get("finished")
        .map_err(|e| JobError::storage(format!("failed to read finished flag: {}", e)))
}

/// Delete a job row and its assignment row.
///
/// Job data referencing the job must be removed first; otherwise the foreign
/// key rejects the delete with `IllegalState`. Returns whether the job
/// existed.
#[instrument(skip(conn), fields(job_code = %code), err)]
pub async fn delete_job(conn: &mut PgConnection, code: JobCode) -> JobResult<bool> {
    let deleted = sqlx::query("DELETE FROM job WHERE code = $1")
        .bind(code.as_uuid())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("delete_job", e))?
        .rows_affected();

    sqlx::query("DELETE FROM job_assignment WHERE code = $1")
        .bind(code.as_uuid())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("delete_job_assignment", e))?;

    Ok(deleted > 0)
}

#[instrument(skip(conn), fields(job_code = %code), err)]
pub async fn get_job(conn: &mut PgConnection, code: JobCode) -> JobResult<Option<JobSnapshot>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM {JOB_FROM} WHERE j.code = $1");
    let row = sqlx::query(&sql)
        .bind(code.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

    row.as_ref().map(decode_job).transpose()
}

fn check_page(offset: i64, limit: i64) -> JobResult<()> {
    if offset < 0 {
        return Err(JobError::validation(format!("bad offset [{offset}]")));
    }
    if limit <= 0 {
        return Err(JobError::validation(format!("bad limit [{limit}]")));
    }
    Ok(())
}

/// A page of jobs, newest queued first with ties broken by code.
///
/// `owner` and `statuses` narrow the listing when given; an empty status set
/// means any status.
#[instrument(skip(conn, statuses), fields(statuses = ?statuses), err)]
pub async fn find_jobs(
    conn: &mut PgConnection,
    owner: Option<&str>,
    statuses: &[JobStatus],
    offset: i64,
    limit: i64,
) -> JobResult<Vec<JobSnapshot>> {
    check_page(offset, limit)?;

    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM {JOB_FROM} \
         WHERE ($1::varchar IS NULL OR j.owner = $1) AND {} \
         ORDER BY j.queue_timestamp DESC NULLS LAST, j.code ASC \
         OFFSET $2 LIMIT $3",
        statuses_predicate(statuses)
    );

    let rows = sqlx::query(&sql)
        .bind(owner)
        .bind(offset)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("find_jobs", e))?;

    rows.iter().map(decode_job).collect()
}

/// Count of the jobs [`find_jobs`] pages through.
#[instrument(skip(conn, statuses), fields(statuses = ?statuses), err)]
pub async fn total_jobs(
    conn: &mut PgConnection,
    owner: Option<&str>,
    statuses: &[JobStatus],
) -> JobResult<i64> {
    let sql = format!(
        "SELECT COUNT(*) AS total FROM job j \
         WHERE ($1::varchar IS NULL OR j.owner = $1) AND {}",
        statuses_predicate(statuses)
    );

    let row = sqlx::query(&sql)
        .bind(owner)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("total_jobs", e))?;

    row.try_get("total")
        .map_err(|e| JobError::storage(format!("failed to read count: {}", e)))
}

/// Terminal jobs whose expiry lies before `now`.
#[instrument(skip(conn), err)]
pub async fn find_completed_expired_jobs(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> JobResult<Vec<JobCode>> {
    let sql = format!(
        "SELECT j.code FROM job j \
         WHERE NOT {NOT_FINISHED} AND j.expiry_timestamp < $1 \
         ORDER BY j.expiry_timestamp ASC"
    );
    fetch_codes(conn, &sql, now, "find_completed_expired_jobs").await
}

/// Jobs of any status whose expiry lies before `cutoff`.
#[instrument(skip(conn), err)]
pub async fn find_jobs_expired_before(
    conn: &mut PgConnection,
    cutoff: DateTime<Utc>,
) -> JobResult<Vec<JobCode>> {
    let sql = "SELECT j.code FROM job j WHERE j.expiry_timestamp < $1 ORDER BY j.expiry_timestamp ASC";
    fetch_codes(conn, sql, cutoff, "find_jobs_expired_before").await
}

async fn fetch_codes(
    conn: &mut PgConnection,
    sql: &str,
    at: DateTime<Utc>,
    operation: &str,
) -> JobResult<Vec<JobCode>> {
    let rows = sqlx::query(sql)
        .bind(at)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

    rows.iter()
        .map(|row| {
            row.try_get::<Uuid, _>("code")
                .map(JobCode::from_uuid)
                .map_err(|e| JobError::storage(format!("failed to read job code: {}", e)))
        })
        .collect()
}

struct StreamState {
    pool: PgPool,
    job_type_code: String,
    statuses: Vec<JobStatus>,
    after: Option<(DateTime<Utc>, Uuid)>,
    buffer: VecDeque<JobSnapshot>,
    exhausted: bool,
}

/// Lazily stream the jobs of one type whose status is in `statuses`, most
/// recently queued first.
///
/// Rows are fetched a page at a time with keyset pagination on
/// `(queue_timestamp, code)`, so dropping the stream early costs nothing and
/// calling again restarts from the newest job.
pub fn stream_jobs_by_type_and_statuses(
    pool: PgPool,
    job_type_code: String,
    statuses: Vec<JobStatus>,
) -> impl Stream<Item = JobResult<JobSnapshot>> + Send + 'static {
    let state = StreamState {
        pool,
        job_type_code,
        statuses,
        after: None,
        buffer: VecDeque::new(),
        exhausted: false,
    };

    futures::stream::try_unfold(state, next_streamed_job)
}

async fn next_streamed_job(mut state: StreamState) -> JobResult<Option<(JobSnapshot, StreamState)>> {
    loop {
        if let Some(job) = state.buffer.pop_front() {
            return Ok(Some((job, state)));
        }
        if state.exhausted {
            return Ok(None);
        }

        let page = fetch_stream_page(&state).await?;
        state.exhausted = (page.len() as i64) < STREAM_PAGE_SIZE;
        state.after = page
            .last()
            .and_then(|job| job.timestamps.queue.map(|at| (at, *job.code.as_uuid())));
        state.buffer.extend(page);
    }
}

async fn fetch_stream_page(state: &StreamState) -> JobResult<Vec<JobSnapshot>> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM {JOB_FROM} \
         WHERE jt.code = $1 AND j.queue_timestamp IS NOT NULL AND {} \
         AND ($2::timestamptz IS NULL OR (j.queue_timestamp, j.code) < ($2, $3)) \
         ORDER BY j.queue_timestamp DESC, j.code DESC \
         LIMIT $4",
        statuses_predicate(&state.statuses)
    );

    let rows = sqlx::query(&sql)
        .bind(&state.job_type_code)
        .bind(state.after.map(|(at, _)| at))
        .bind(state.after.map(|(_, code)| code))
        .bind(STREAM_PAGE_SIZE)
        .fetch_all(&state.pool)
        .await
        .map_err(|e| map_sqlx_error("stream_jobs_by_type_and_statuses", e))?;

    rows.iter().map(decode_job).collect()
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    code: Uuid,
    job_type_code: String,
    owner: Option<String>,
    specification: serde_json::Value,
    progress_percent: i32,
    timestamps: JobTimestamps,
    expiry_timestamp: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            code: row.try_get("code")?,
            job_type_code: row.try_get("job_type_code")?,
            owner: row.try_get("owner")?,
            specification: row.try_get("specification")?,
            progress_percent: row.try_get("progress_percent")?,
            timestamps: timestamps_from_row(row)?,
            expiry_timestamp: row.try_get("expiry_timestamp")?,
        })
    }
}

impl From<JobRow> for JobSnapshot {
    fn from(row: JobRow) -> Self {
        JobSnapshot {
            code: JobCode::from_uuid(row.code),
            job_type_code: row.job_type_code,
            owner: row.owner,
            payload: row.specification,
            progress: ProgressPercent::clamped(i64::from(row.progress_percent)),
            timestamps: row.timestamps,
            expiry: row.expiry_timestamp,
        }
    }
}

fn timestamps_from_row(row: &PgRow) -> Result<JobTimestamps, sqlx::Error> {
    Ok(JobTimestamps {
        queue: row.try_get("queue_timestamp")?,
        start: row.try_get("start_timestamp")?,
        finish: row.try_get("finish_timestamp")?,
        fail: row.try_get("fail_timestamp")?,
        cancel: row.try_get("cancel_timestamp")?,
    })
}

pub(crate) fn decode_job(row: &PgRow) -> JobResult<JobSnapshot> {
    JobRow::from_row(row)
        .map(JobSnapshot::from)
        .map_err(|e| JobError::storage(format!("failed to decode job row: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_status_has_a_distinct_predicate() {
        let mut predicates: Vec<&str> = JobStatus::ALL.iter().map(|s| status_predicate(*s)).collect();
        predicates.sort();
        predicates.dedup();
        assert_eq!(predicates.len(), JobStatus::ALL.len());
    }

    #[test]
    fn status_sets_are_or_combined_without_duplicates() {
        assert_eq!(statuses_predicate(&[]), "TRUE");

        let clause = statuses_predicate(&[JobStatus::Queued, JobStatus::Started, JobStatus::Queued]);
        assert_eq!(clause.matches(" OR ").count(), 1);
        assert!(clause.starts_with('(') && clause.ends_with(')'));
        assert!(clause.contains(status_predicate(JobStatus::Started)));
    }

    #[test]
    fn only_lifecycle_statuses_map_to_a_column() {
        assert_eq!(timestamp_column(JobStatus::Cancelled).unwrap(), "cancel_timestamp");
        assert!(matches!(
            timestamp_column(JobStatus::Indeterminate),
            Err(JobError::IllegalState(_))
        ));
    }

    #[test]
    fn paging_arguments_are_validated() {
        assert!(check_page(0, 1).is_ok());
        assert!(matches!(check_page(-1, 10), Err(JobError::Validation(_))));
        assert!(matches!(check_page(0, 0), Err(JobError::Validation(_))));
    }
}
