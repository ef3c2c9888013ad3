//! Job runner contract and registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use jobvault_core::job::normalize_job_type_code;
use jobvault_core::{
    JobCode, JobData, JobDataCode, JobDataEncoding, JobDataRole, JobError, JobResult, JobSnapshot,
    JobStatus,
};

use super::service::JobService;
use crate::storage::{StorageReader, StorageSink};

/// Business logic for one job type.
///
/// Returning `Ok` finishes the job; returning an error (or panicking) fails
/// it. Runners that want to stop early on cancellation poll
/// [`JobContext::is_cancel_requested`].
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// The job type this runner executes.
    fn job_type_code(&self) -> &str;

    async fn run(&self, ctx: &JobContext, job: &JobSnapshot) -> anyhow::Result<()>;
}

/// Runners keyed by normalized job type code.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn JobRunner>>,
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("job_types", &self.job_type_codes())
            .finish()
    }
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner. A second runner for the same type is
    /// `IllegalState`.
    pub fn register(&mut self, runner: Arc<dyn JobRunner>) -> JobResult<()> {
        let code = normalize_job_type_code(runner.job_type_code())?;
        if self.runners.contains_key(&code) {
            return Err(JobError::illegal_state(format!(
                "a runner for job type [{code}] is already registered"
            )));
        }
        self.runners.insert(code, runner);
        Ok(())
    }

    pub fn with_runner(mut self, runner: Arc<dyn JobRunner>) -> JobResult<Self> {
        self.register(runner)?;
        Ok(self)
    }

    pub fn get(&self, job_type_code: &str) -> Option<Arc<dyn JobRunner>> {
        let code = normalize_job_type_code(job_type_code).ok()?;
        self.runners.get(&code).cloned()
    }

    pub fn job_type_codes(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.runners.keys().map(String::as_str).collect();
        codes.sort_unstable();
        codes
    }
}

/// What a runner can do while executing a job.
#[derive(Clone)]
pub struct JobContext {
    service: JobService,
    job_code: JobCode,
}

impl JobContext {
    pub(crate) fn new(service: JobService, job_code: JobCode) -> Self {
        Self { service, job_code }
    }

    pub fn job_code(&self) -> JobCode {
        self.job_code
    }

    pub fn service(&self) -> &JobService {
        &self.service
    }

    /// Report progress; clamped to `0..=100`.
    pub async fn set_progress_percent(&self, value: i64) -> JobResult<bool> {
        self.service.set_progress_percent(self.job_code, value).await
    }

    /// True once someone has cancelled this job.
    pub async fn is_cancel_requested(&self) -> JobResult<bool> {
        let job = self
            .service
            .get_job(self.job_code)
            .await?
            .ok_or_else(|| JobError::not_found(format!("job [{}]", self.job_code)))?;
        Ok(job.status == JobStatus::Cancelled)
    }

    /// Data handed to this job at submission.
    pub async fn supplied_data_codes(&self) -> JobResult<Vec<JobDataCode>> {
        self.service
            .find_data_codes(self.job_code, JobDataRole::Supplied)
            .await
    }

    pub async fn obtain_data(&self, code: JobDataCode) -> JobResult<Option<(JobData, StorageReader)>> {
        self.service.obtain_data(code).await
    }

    /// Start a new output of this job; close the sink to commit its bytes.
    pub async fn store_generated_data(
        &self,
        use_code: Option<&str>,
        media_type: &str,
        encoding: JobDataEncoding,
    ) -> JobResult<(JobData, StorageSink)> {
        self.service
            .store_generated_data(self.job_code, use_code, media_type, encoding)
            .await
    }
}
