//! Infrastructure layer: Postgres-backed job ledger, claiming, blob storage
//! and the worker pool.

pub mod config;
pub mod jobs;
pub mod schema;
pub mod storage;

pub use config::{JobServiceConfig, JobVaultConfig, JobWorkerConfig, RetryBackoff};
pub use jobs::{
    ExecutionOutcome, JobContext, JobRunner, JobService, JobWorkerHandle, JobWorkerPool,
    RunnerRegistry, SweepReport, WorkerStats,
};
pub use schema::ensure_schema;
pub use storage::{DataStorage, StorageConfig, StorageError, StorageReader, StorageSink};

mod integration_tests;
