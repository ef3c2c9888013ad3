//! `jobvault-core`: domain model of the job system.
//!
//! This crate contains **pure domain** logic (no I/O): identifiers, the job
//! lifecycle derived from timestamps, progress, coalescing policy and the
//! error taxonomy shared by every other crate.

pub mod coalesce;
pub mod error;
pub mod id;
pub mod job;
pub mod progress;
pub mod status;

pub use coalesce::CoalesceSet;
pub use error::{JobError, JobResult};
pub use id::{JobCode, JobDataCode};
pub use job::{
    JobData, JobDataEncoding, JobDataRole, JobDetails, JobSnapshot, JobSpecification,
    derive_data_filename, simplify_media_type,
};
pub use progress::ProgressPercent;
pub use status::{JobStatus, JobTimestamps};
