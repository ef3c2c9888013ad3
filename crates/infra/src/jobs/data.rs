//! Job data ledger: records tying stored blobs to jobs.
//!
//! Bytes live in the storage engine under [`JobDataCode::storage_key`]; this
//! module only manages the `job_data` rows and their lookup tables.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use jobvault_core::{
    JobCode, JobData, JobDataCode, JobDataEncoding, JobDataRole, JobError, JobResult,
    simplify_media_type,
};

use super::map_sqlx_error;

const DATA_COLUMNS: &str = r#"
    d.code,
    j.code AS job_code,
    d.role,
    d.use_code,
    mt.code AS media_type,
    enc.code AS encoding,
    d.create_timestamp
"#;

const DATA_FROM: &str = r#"
    job_data d
    JOIN job_data_media_type mt ON mt.id = d.media_type_id
    JOIN job_data_encoding enc ON enc.id = d.encoding_id
    LEFT JOIN job j ON j.id = d.job_id
"#;

/// Description of a job data record about to be created.
#[derive(Debug, Clone)]
pub struct NewJobData<'a> {
    pub code: JobDataCode,
    pub use_code: Option<&'a str>,
    pub media_type: &'a str,
    pub encoding: JobDataEncoding,
}

async fn ensure_media_type(conn: &mut PgConnection, code: &str) -> JobResult<i64> {
    sqlx::query(
        "INSERT INTO job_data_media_type (code) VALUES ($1) ON CONFLICT (code) DO NOTHING",
    )
    .bind(code)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("ensure_media_type", e))?;

    let row = sqlx::query("SELECT id FROM job_data_media_type WHERE code = $1")
        .bind(code)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("ensure_media_type", e))?;

    row.try_get("id")
        .map_err(|e| JobError::storage(format!("failed to read media type id: {}", e)))
}

async fn encoding_id(conn: &mut PgConnection, encoding: JobDataEncoding) -> JobResult<i64> {
    let row = sqlx::query("SELECT id FROM job_data_encoding WHERE code = $1")
        .bind(encoding.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("encoding_id", e))?
        .ok_or_else(|| JobError::illegal_state(format!("encoding [{}] is not seeded", encoding)))?;

    row.try_get("id")
        .map_err(|e| JobError::storage(format!("failed to read encoding id: {}", e)))
}

async fn job_id(conn: &mut PgConnection, job_code: JobCode) -> JobResult<i64> {
    let row = sqlx::query("SELECT id FROM job WHERE code = $1")
        .bind(job_code.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("job_id", e))?
        .ok_or_else(|| JobError::not_found(format!("job [{}]", job_code)))?;

    row.try_get("id")
        .map_err(|e| JobError::storage(format!("failed to read job id: {}", e)))
}

async fn insert_data(
    conn: &mut PgConnection,
    job_id: Option<i64>,
    role: JobDataRole,
    data: &NewJobData<'_>,
) -> JobResult<JobData> {
    let media_type = simplify_media_type(data.media_type)?;
    let media_type_id = ensure_media_type(conn, &media_type).await?;
    let encoding_id = encoding_id(conn, data.encoding).await?;

    let row = sqlx::query(
        r#"
        INSERT INTO job_data (
            code,
            job_id,
            role,
            use_code,
            media_type_id,
            encoding_id,
            storage_code
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING create_timestamp
        "#,
    )
    .bind(data.code.as_uuid())
    .bind(job_id)
    .bind(role.as_str())
    .bind(data.use_code)
    .bind(media_type_id)
    .bind(encoding_id)
    .bind(data.code.storage_key())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_job_data", e))?;

    let create_timestamp: DateTime<Utc> = row
        .try_get("create_timestamp")
        .map_err(|e| JobError::storage(format!("failed to read create timestamp: {}", e)))?;

    Ok(JobData {
        code: data.code,
        job_code: None,
        role,
        use_code: data.use_code.map(str::to_string),
        media_type,
        encoding: data.encoding,
        create_timestamp,
    })
}

/// Record supplied (input) data that is not yet attached to any job.
///
/// The storage head is allocated by the caller under the data's storage key.
#[instrument(skip(conn, data), fields(data_code = %data.code), err)]
pub async fn create_supplied_data(
    conn: &mut PgConnection,
    data: &NewJobData<'_>,
) -> JobResult<JobData> {
    let created = insert_data(conn, None, JobDataRole::Supplied, data).await?;
    debug!(data_code = %created.code, media_type = %created.media_type, "supplied data recorded");
    Ok(created)
}

/// Record generated (output) data of a job.
#[instrument(skip(conn, data), fields(job_code = %job_code, data_code = %data.code), err)]
pub async fn create_generated_data(
    conn: &mut PgConnection,
    job_code: JobCode,
    data: &NewJobData<'_>,
) -> JobResult<JobData> {
    let job_id = job_id(conn, job_code).await?;
    let mut created = insert_data(conn, Some(job_id), JobDataRole::Generated, data).await?;
    created.job_code = Some(job_code);
    debug!(job_code = %job_code, data_code = %created.code, "generated data recorded");
    Ok(created)
}

/// Link previously supplied data to a job.
///
/// Unknown data is `NotFound`; data already attached to a job (or generated
/// data) is `IllegalState`.
pub(crate) async fn attach_supplied_data(
    conn: &mut PgConnection,
    job_id: i64,
    job_code: JobCode,
    data_code: JobDataCode,
) -> JobResult<()> {
    let attached = sqlx::query(
        r#"
        UPDATE job_data
        SET job_id = $1
        WHERE code = $2 AND role = 'SUPPLIED' AND job_id IS NULL
        "#,
    )
    .bind(job_id)
    .bind(data_code.as_uuid())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("attach_supplied_data", e))?
    .rows_affected();

    if attached == 1 {
        return Ok(());
    }

    match get_data(conn, data_code).await? {
        None => Err(JobError::not_found(format!("job data [{}]", data_code))),
        Some(data) => Err(JobError::illegal_state(format!(
            "job data [{}] ({}) cannot be attached to job [{}]; already attached to {:?}",
            data_code, data.role, job_code, data.job_code
        ))),
    }
}

/// Codes of a job's data in the given role, oldest first.
#[instrument(skip(conn), fields(job_code = %job_code, role = %role), err)]
pub async fn find_data_codes(
    conn: &mut PgConnection,
    job_code: JobCode,
    role: JobDataRole,
) -> JobResult<Vec<JobDataCode>> {
    let rows = sqlx::query(
        r#"
        SELECT d.code
        FROM job_data d
        JOIN job j ON j.id = d.job_id
        WHERE j.code = $1 AND d.role = $2
        ORDER BY d.create_timestamp ASC, d.id ASC
        "#,
    )
    .bind(job_code.as_uuid())
    .bind(role.as_str())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("find_data_codes", e))?;

    rows.iter().map(read_data_code).collect()
}

/// Codes of all data attached to a job, whatever the role.
pub(crate) async fn find_all_data_codes(
    conn: &mut PgConnection,
    job_code: JobCode,
) -> JobResult<Vec<JobDataCode>> {
    let rows = sqlx::query(
        r#"
        SELECT d.code
        FROM job_data d
        JOIN job j ON j.id = d.job_id
        WHERE j.code = $1
        "#,
    )
    .bind(job_code.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("find_all_data_codes", e))?;

    rows.iter().map(read_data_code).collect()
}

#[instrument(skip(conn), fields(data_code = %code), err)]
pub async fn get_data(conn: &mut PgConnection, code: JobDataCode) -> JobResult<Option<JobData>> {
    let sql = format!("SELECT {DATA_COLUMNS} FROM {DATA_FROM} WHERE d.code = $1");
    let row = sqlx::query(&sql)
        .bind(code.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("get_data", e))?;

    row.as_ref().map(decode_data).transpose()
}

/// Delete job data rows; the backing blobs are the caller's business.
pub(crate) async fn delete_data(conn: &mut PgConnection, codes: &[JobDataCode]) -> JobResult<u64> {
    if codes.is_empty() {
        return Ok(0);
    }

    let uuids: Vec<Uuid> = codes.iter().map(|c| *c.as_uuid()).collect();
    let result = sqlx::query("DELETE FROM job_data WHERE code = ANY($1)")
        .bind(&uuids)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("delete_data", e))?;

    Ok(result.rows_affected())
}

/// Supplied data created before `cutoff` that never got attached to a job.
pub(crate) async fn find_orphan_supplied_data(
    conn: &mut PgConnection,
    cutoff: DateTime<Utc>,
) -> JobResult<Vec<JobDataCode>> {
    let rows = sqlx::query(
        r#"
        SELECT d.code
        FROM job_data d
        WHERE d.role = 'SUPPLIED' AND d.job_id IS NULL AND d.create_timestamp < $1
        "#,
    )
    .bind(cutoff)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("find_orphan_supplied_data", e))?;

    rows.iter().map(read_data_code).collect()
}

/// The subset of `storage_codes` that no job data row refers to.
pub(crate) async fn unreferenced_storage_codes(
    conn: &mut PgConnection,
    storage_codes: &[String],
) -> JobResult<Vec<String>> {
    if storage_codes.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        "SELECT DISTINCT storage_code FROM job_data WHERE storage_code = ANY($1)",
    )
    .bind(storage_codes)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("unreferenced_storage_codes", e))?;

    let mut referenced = Vec::with_capacity(rows.len());
    for row in rows {
        let code: String = row
            .try_get("storage_code")
            .map_err(|e| JobError::storage(format!("failed to read storage code: {}", e)))?;
        referenced.push(code);
    }

    Ok(storage_codes
        .iter()
        .filter(|code| !referenced.contains(code))
        .cloned()
        .collect())
}

fn read_data_code(row: &PgRow) -> JobResult<JobDataCode> {
    row.try_get::<Uuid, _>("code")
        .map(JobDataCode::from_uuid)
        .map_err(|e| JobError::storage(format!("failed to read job data code: {}", e)))
}

// SQLx row types

#[derive(Debug)]
struct JobDataRow {
    code: Uuid,
    job_code: Option<Uuid>,
    role: String,
    use_code: Option<String>,
    media_type: String,
    encoding: String,
    create_timestamp: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobDataRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobDataRow {
            code: row.try_get("code")?,
            job_code: row.try_get("job_code")?,
            role: row.try_get("role")?,
            use_code: row.try_get("use_code")?,
            media_type: row.try_get("media_type")?,
            encoding: row.try_get("encoding")?,
            create_timestamp: row.try_get("create_timestamp")?,
        })
    }
}

impl TryFrom<JobDataRow> for JobData {
    type Error = JobError;

    fn try_from(row: JobDataRow) -> Result<Self, Self::Error> {
        Ok(JobData {
            code: JobDataCode::from_uuid(row.code),
            job_code: row.job_code.map(JobCode::from_uuid),
            role: row.role.parse()?,
            use_code: row.use_code,
            media_type: row.media_type,
            encoding: row.encoding.parse()?,
            create_timestamp: row.create_timestamp,
        })
    }
}

fn decode_data(row: &PgRow) -> JobResult<JobData> {
    JobDataRow::from_row(row)
        .map_err(|e| JobError::storage(format!("failed to decode job data row: {}", e)))?
        .try_into()
}
