//! Database-coordinated background jobs.
//!
//! ## Design
//!
//! - The `job` table is the ledger; a job's status is derived from its five
//!   lifecycle timestamps and never stored
//! - Each job has a 1:1 `job_assignment` row that exists only to be locked, so
//!   claiming never blocks reads or writes of the job row itself
//! - Workers in any number of processes race for queued jobs with
//!   `FOR UPDATE SKIP LOCKED`; there is no broker
//! - Job input and output bytes live in the chunked blob store
//!
//! ## Components
//!
//! - `ledger`: job rows and the status state machine
//! - `claim`: skip-locked claiming and dangling job detection
//! - `coalesce`: reuse of an equivalent existing job on submission
//! - `data`: job data records (supplied input, generated output)
//! - `service`: the facade callers use
//! - `runner` / `worker`: executing claimed jobs
//! - `gc`: expiry and recovery sweeps
//!
//! ## Error Mapping
//!
//! | SQLx error                       | Postgres code | `JobError`     |
//! |----------------------------------|---------------|----------------|
//! | Database (unique violation)      | `23505`       | `IllegalState` |
//! | Database (foreign key violation) | `23503`       | `IllegalState` |
//! | Database (other)                 | any other     | `Storage`      |
//! | PoolClosed / Io / Tls / other    | N/A           | `Storage`      |

pub mod claim;
pub mod coalesce;
pub mod data;
pub mod gc;
pub mod ledger;
pub mod runner;
pub mod service;
pub mod worker;

pub use claim::ExecutionLease;
pub use gc::SweepReport;
pub use runner::{JobContext, JobRunner, RunnerRegistry};
pub use service::{ExecutionOutcome, JobService};
pub use worker::{JobWorkerHandle, JobWorkerPool, WorkerStats, process_next_job};

use jobvault_core::JobError;

/// Map a SQLx error from `operation` onto the job error taxonomy.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string());
            let msg = format!(
                "database error in {} [{}]: {}",
                operation,
                code.as_deref().unwrap_or("-"),
                db_err.message()
            );

            match code.as_deref() {
                // unique / foreign key violation
                Some("23505") | Some("23503") => JobError::IllegalState(msg),
                _ => JobError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            JobError::IllegalState(format!("expected a row in {}", operation))
        }
        _ => JobError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
