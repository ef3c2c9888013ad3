//! Job and job data models.

use core::fmt;
use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{JobError, JobResult};
use crate::id::{JobCode, JobDataCode};
use crate::progress::ProgressPercent;
use crate::status::{JobStatus, JobTimestamps};

const MAX_CODE_LENGTH: usize = 255;

/// What a caller asks to have run.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpecification {
    /// Pre-assigned job code; a fresh one is generated when absent.
    pub code: Option<JobCode>,
    pub job_type_code: String,
    pub owner: Option<String>,
    /// Falls back to the service default and is capped by its maximum.
    pub time_to_live: Option<Duration>,
    /// Supplied data to attach to the job as it is created.
    pub supplied_data_codes: Vec<JobDataCode>,
    /// Opaque, runner-specific parameters.
    pub payload: serde_json::Value,
}

impl JobSpecification {
    pub fn new(job_type_code: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            code: None,
            job_type_code: job_type_code.into(),
            owner: None,
            time_to_live: None,
            supplied_data_codes: Vec::new(),
            payload,
        }
    }

    pub fn with_code(mut self, code: JobCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    pub fn with_supplied_data(mut self, code: JobDataCode) -> Self {
        self.supplied_data_codes.push(code);
        self
    }

    /// The job type code as it is persisted.
    pub fn normalized_job_type_code(&self) -> JobResult<String> {
        normalize_job_type_code(&self.job_type_code)
    }

    /// Whether `job` does the same work this specification asks for: same
    /// type, owner and payload. A specification that brings supplied data
    /// is never equivalent to an existing job, as that data could not be
    /// attached to it.
    pub fn is_equivalent(&self, job: &JobSnapshot) -> bool {
        self.supplied_data_codes.is_empty()
            && self
                .normalized_job_type_code()
                .is_ok_and(|code| code == job.job_type_code)
            && self.owner == job.owner
            && self.payload == job.payload
    }
}

/// Lower-case and check a job type code.
pub fn normalize_job_type_code(raw: &str) -> JobResult<String> {
    let code = raw.trim().to_ascii_lowercase();

    if code.is_empty() {
        return Err(JobError::validation("job type code is required"));
    }
    if code.len() > MAX_CODE_LENGTH {
        return Err(JobError::validation(format!(
            "job type code is longer than {MAX_CODE_LENGTH} characters"
        )));
    }
    if !code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(JobError::validation(format!(
            "job type code [{code}] contains unsupported characters"
        )));
    }

    Ok(code)
}

/// Point-in-time view of a persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub code: JobCode,
    pub job_type_code: String,
    pub owner: Option<String>,
    pub payload: serde_json::Value,
    pub progress: ProgressPercent,
    pub timestamps: JobTimestamps,
    pub expiry: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn status(&self) -> JobStatus {
        self.timestamps.status()
    }

    pub fn is_finished(&self) -> bool {
        self.timestamps.is_finished()
    }

    /// Timestamp used to label the job's output: finish time once finished,
    /// queue time otherwise.
    pub fn label_timestamp(&self) -> Option<DateTime<Utc>> {
        match self.status() {
            JobStatus::Finished => self.timestamps.finish,
            _ => self.timestamps.queue,
        }
    }
}

/// A job together with the output it has produced so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetails {
    pub job: JobSnapshot,
    pub status: JobStatus,
    pub generated_data_codes: Vec<JobDataCode>,
}

/// Whether job data was handed to a job or produced by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobDataRole {
    Supplied,
    Generated,
}

impl JobDataRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobDataRole::Supplied => "SUPPLIED",
            JobDataRole::Generated => "GENERATED",
        }
    }
}

impl fmt::Display for JobDataRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobDataRole {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUPPLIED" => Ok(JobDataRole::Supplied),
            "GENERATED" => Ok(JobDataRole::Generated),
            other => Err(JobError::validation(format!("unknown job data role [{other}]"))),
        }
    }
}

/// Transfer encoding of stored job data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobDataEncoding {
    #[default]
    None,
    Gzip,
}

impl JobDataEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobDataEncoding::None => "none",
            JobDataEncoding::Gzip => "gzip",
        }
    }
}

impl fmt::Display for JobDataEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobDataEncoding {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(JobDataEncoding::None),
            "gzip" => Ok(JobDataEncoding::Gzip),
            other => Err(JobError::validation(format!("unknown job data encoding [{other}]"))),
        }
    }
}

/// A persisted job data record. The bytes themselves live in blob storage
/// under [`JobDataCode::storage_key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobData {
    pub code: JobDataCode,
    pub job_code: Option<JobCode>,
    pub role: JobDataRole,
    pub use_code: Option<String>,
    pub media_type: String,
    pub encoding: JobDataEncoding,
    pub create_timestamp: DateTime<Utc>,
}

/// Drop media type parameters and lower-case the rest.
///
/// `text/csv; charset=utf-8` becomes `text/csv`.
pub fn simplify_media_type(raw: &str) -> JobResult<String> {
    let essence = raw.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();

    match essence.split_once('/') {
        Some((kind, sub)) if !kind.is_empty() && !sub.is_empty() && !sub.contains('/') => {
            Ok(essence)
        }
        _ => Err(JobError::validation(format!("malformed media type [{raw}]"))),
    }
}

/// File extension for a (simplified) media type.
pub fn media_type_extension(media_type: &str) -> &'static str {
    match media_type {
        "application/json" => "json",
        "text/csv" => "csv",
        "text/plain" => "txt",
        "text/html" => "html",
        "application/xml" | "text/xml" => "xml",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "application/x-tar" => "tar",
        "application/gzip" => "gz",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        _ => "dat",
    }
}

/// Download file name for a piece of job data.
///
/// Shape: `jv_<jobtype>_<yyyyMMddHHmmss>_<first 4 chars of code>.<ext>`, with
/// `.gz` appended for gzip encoded data. Data not attached to a job uses the
/// type `jobdata`.
pub fn derive_data_filename(
    data_code: &JobDataCode,
    job_type_code: Option<&str>,
    timestamp: DateTime<Utc>,
    data: Option<&JobData>,
) -> String {
    let code = data_code.to_string();
    let extension = data
        .map(|d| media_type_extension(&d.media_type))
        .unwrap_or("dat");
    let gzip = matches!(data.map(|d| d.encoding), Some(JobDataEncoding::Gzip));

    format!(
        "jv_{}_{}_{}.{}{}",
        job_type_code.unwrap_or("jobdata"),
        timestamp.format("%Y%m%d%H%M%S"),
        &code[..4],
        extension,
        if gzip { ".gz" } else { "" }
    )
}
