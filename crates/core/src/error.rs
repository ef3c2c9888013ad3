//! Job system error model.

use thiserror::Error;

use crate::status::JobStatus;

/// Result type used across the job system.
pub type JobResult<T> = Result<T, JobError>;

/// Job system error.
///
/// `Storage` and `IllegalState` are infrastructure failures (5xx-equivalent at
/// an API boundary); `NotFound` is a 404-equivalent; `Validation` is a caller
/// mistake.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// I/O failure, lost connectivity or corrupted stored data.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Unknown job, job data or storage code.
    #[error("not found: {0}")]
    NotFound(String),

    /// A sequencing rule was broken (duplicate rows, claim misuse, ...).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A job status change that the lifecycle does not allow.
    #[error("illegal job status transition {from} -> {to}")]
    Transition { from: JobStatus, to: JobStatus },

    /// No runner is registered for the job type.
    #[error("no runner registered for job type [{0}]")]
    RunnerMissing(String),

    /// A caller supplied value was malformed or out of range.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl JobError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    pub fn runner_missing(job_type_code: impl Into<String>) -> Self {
        Self::RunnerMissing(job_type_code.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for failures a poll loop should simply retry on its next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
