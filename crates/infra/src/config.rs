//! Process configuration read from the environment.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use jobvault_core::{JobError, JobResult};

use crate::jobs::map_sqlx_error;
use crate::storage::StorageConfig;

/// Job service settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobServiceConfig {
    /// Time to live of a job that does not ask for one.
    pub default_ttl: Duration,
    /// Upper bound on any job's time to live; also the age after which
    /// never-finished jobs, unattached supplied data and unreferenced blobs
    /// are swept.
    pub max_ttl: Duration,
    /// A STARTED job is only treated as dangling once it has been started for
    /// at least this long.
    pub dangling_grace: Duration,
}

impl Default for JobServiceConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(2 * 60 * 60),
            max_ttl: Duration::from_secs(5 * 24 * 60 * 60),
            dangling_grace: Duration::from_secs(30),
        }
    }
}

impl JobServiceConfig {
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = ttl;
        self
    }

    pub fn with_dangling_grace(mut self, grace: Duration) -> Self {
        self.dangling_grace = grace;
        self
    }

    /// Effective time to live for a job asking for `requested`.
    pub fn effective_ttl(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.default_ttl).min(self.max_ttl)
    }
}

/// Exponential backoff for a poll loop that keeps failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryBackoff {
    /// Delay before retry number `attempt` (1-indexed): `base * 2^(attempt-1)`
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWorkerConfig {
    /// Name prefix for logging.
    pub name: String,
    pub worker_count: usize,
    /// Idle wait between empty polls, cut short by local submissions.
    pub poll_interval: Duration,
    /// Run the expiry sweep this often; `None` disables it.
    pub gc_interval: Option<Duration>,
    pub retry: RetryBackoff,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            worker_count: 2,
            poll_interval: Duration::from_millis(2000),
            gc_interval: Some(Duration::from_secs(300)),
            retry: RetryBackoff::default(),
        }
    }
}

impl JobWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryBackoff) -> Self {
        self.retry = retry;
        self
    }
}

/// Everything a job vault process needs, usually from [`JobVaultConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobVaultConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub storage: StorageConfig,
    pub service: JobServiceConfig,
    pub worker: JobWorkerConfig,
}

impl JobVaultConfig {
    /// Read the configuration from process environment variables.
    pub fn from_env() -> JobResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `lookup` (an environment stand-in).
    pub fn from_lookup<F>(lookup: F) -> JobResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| JobError::validation("DATABASE_URL must be set"))?;

        let storage_defaults = StorageConfig::default();
        let service_defaults = JobServiceConfig::default();
        let worker_defaults = JobWorkerConfig::default();

        let part_size = parse_var(
            &lookup,
            "JOBVAULT_STORAGE_PART_SIZE",
            storage_defaults.part_size as u64,
        )?;
        let default_ttl = parse_var(
            &lookup,
            "JOBVAULT_JOB_DEFAULT_TTL_SECS",
            service_defaults.default_ttl.as_secs(),
        )?;
        let max_ttl = parse_var(
            &lookup,
            "JOBVAULT_JOB_MAX_TTL_SECS",
            service_defaults.max_ttl.as_secs(),
        )?;
        let dangling_grace = parse_var(
            &lookup,
            "JOBVAULT_DANGLING_GRACE_SECS",
            service_defaults.dangling_grace.as_secs(),
        )?;
        let worker_count = parse_var(
            &lookup,
            "JOBVAULT_WORKER_COUNT",
            worker_defaults.worker_count as u64,
        )?;
        let poll_interval = parse_var(
            &lookup,
            "JOBVAULT_WORKER_POLL_INTERVAL_MS",
            worker_defaults.poll_interval.as_millis() as u64,
        )?;
        let gc_interval = parse_var(&lookup, "JOBVAULT_GC_INTERVAL_SECS", 300)?;
        let db_max_connections = parse_var(&lookup, "JOBVAULT_DB_MAX_CONNECTIONS", 10)?;

        let config = Self {
            database_url,
            db_max_connections: u32::try_from(db_max_connections).map_err(|_| {
                JobError::validation("JOBVAULT_DB_MAX_CONNECTIONS is out of range")
            })?,
            storage: StorageConfig::default().with_part_size(part_size as usize),
            service: JobServiceConfig::default()
                .with_default_ttl(Duration::from_secs(default_ttl))
                .with_max_ttl(Duration::from_secs(max_ttl))
                .with_dangling_grace(Duration::from_secs(dangling_grace)),
            worker: JobWorkerConfig::default()
                .with_worker_count(worker_count as usize)
                .with_poll_interval(Duration::from_millis(poll_interval))
                .with_gc_interval((gc_interval > 0).then(|| Duration::from_secs(gc_interval))),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work.
    pub fn validate(&self) -> JobResult<()> {
        if self.storage.part_size == 0 {
            return Err(JobError::validation("JOBVAULT_STORAGE_PART_SIZE must be positive"));
        }
        if self.service.default_ttl > self.service.max_ttl {
            return Err(JobError::validation(
                "JOBVAULT_JOB_DEFAULT_TTL_SECS exceeds JOBVAULT_JOB_MAX_TTL_SECS",
            ));
        }
        let max_ttl = chrono::Duration::from_std(self.service.max_ttl).ok();
        let now = chrono::Utc::now();
        if max_ttl.is_none_or(|ttl| {
            now.checked_add_signed(ttl).is_none() || now.checked_sub_signed(ttl).is_none()
        }) {
            return Err(JobError::validation("JOBVAULT_JOB_MAX_TTL_SECS is out of range"));
        }
        // each running job holds one connection for its execution lease, and
        // the poll loop needs at least one more
        if self.db_max_connections as usize <= self.worker.worker_count {
            return Err(JobError::validation(
                "JOBVAULT_DB_MAX_CONNECTIONS must exceed JOBVAULT_WORKER_COUNT",
            ));
        }
        Ok(())
    }

    /// Open the connection pool.
    pub async fn connect(&self) -> JobResult<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.db_max_connections)
            .connect(&self.database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        info!(max_connections = self.db_max_connections, "database pool connected");
        Ok(pool)
    }
}

fn parse_var<F>(lookup: &F, name: &str, default: u64) -> JobResult<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<u64>().map_err(|e| {
            JobError::validation(format!("{name} must be a non-negative integer; [{raw}]: {e}"))
        }),
    }
}
