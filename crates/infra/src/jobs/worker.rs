//! Worker pool: poll loops that claim, execute and complete jobs.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use jobvault_core::JobResult;

use super::service::{ExecutionOutcome, JobService};
use crate::config::JobWorkerConfig;

/// Worker pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_missing_runner: u64,
    pub jobs_skipped: u64,
    pub poll_errors: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

type SharedStats = Arc<Mutex<WorkerStats>>;

fn lock(stats: &SharedStats) -> MutexGuard<'_, WorkerStats> {
    // counters stay meaningful even if a holder panicked
    stats.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to control a running worker pool. Dropping it stops the workers
/// once their current job ends.
#[derive(Debug)]
pub struct JobWorkerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: SharedStats,
    started: Instant,
}

impl JobWorkerHandle {
    /// Stop polling, wait for in-flight jobs to end and return the final
    /// statistics.
    pub async fn shutdown(self) -> WorkerStats {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "job worker task ended abnormally");
            }
        }
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> WorkerStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Background workers for a [`JobService`].
///
/// Each worker claims one job at a time, executes it through the service and
/// goes back to polling. When idle it sleeps for the poll interval, waking
/// early when this process submits a job. An optional extra task runs the
/// expiry sweep periodically.
#[derive(Debug, Clone)]
pub struct JobWorkerPool {
    service: JobService,
    config: JobWorkerConfig,
}

impl JobWorkerPool {
    pub fn new(service: JobService, config: JobWorkerConfig) -> Self {
        Self { service, config }
    }

    /// Spawn the workers on the current tokio runtime.
    pub fn spawn(self) -> JobWorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats: SharedStats = Arc::new(Mutex::new(WorkerStats::default()));
        let mut tasks = Vec::with_capacity(self.config.worker_count + 1);

        for index in 0..self.config.worker_count {
            let name = format!("{}-{}", self.config.name, index);
            tasks.push(tokio::spawn(worker_loop(
                name,
                self.service.clone(),
                self.config.clone(),
                shutdown_rx.clone(),
                stats.clone(),
            )));
        }

        if let Some(interval) = self.config.gc_interval {
            tasks.push(tokio::spawn(gc_loop(
                format!("{}-gc", self.config.name),
                self.service.clone(),
                interval,
                shutdown_rx.clone(),
            )));
        }

        info!(
            pool = %self.config.name,
            workers = self.config.worker_count,
            runners = ?self.service.runners().job_type_codes(),
            "job worker pool started"
        );

        JobWorkerHandle {
            shutdown: shutdown_tx,
            tasks,
            stats,
            started: Instant::now(),
        }
    }
}

/// Claim and execute at most one job. Returns `None` when nothing was queued.
pub async fn process_next_job(service: &JobService) -> JobResult<Option<ExecutionOutcome>> {
    let Some(code) = service.claim_next_job().await? else {
        return Ok(None);
    };
    debug!(job_code = %code, "claimed job");
    service.execute(code).await.map(Some)
}

async fn worker_loop(
    name: String,
    service: JobService,
    config: JobWorkerConfig,
    mut shutdown: watch::Receiver<bool>,
    stats: SharedStats,
) {
    info!(worker = %name, "job worker started");
    let mut consecutive_errors = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }

        lock(&stats).current_running += 1;
        let result = process_next_job(&service).await;
        {
            let mut s = lock(&stats);
            s.current_running = s.current_running.saturating_sub(1);
            match &result {
                Ok(Some(outcome)) => {
                    s.jobs_processed += 1;
                    match outcome {
                        ExecutionOutcome::Finished => s.jobs_succeeded += 1,
                        ExecutionOutcome::Failed => s.jobs_failed += 1,
                        ExecutionOutcome::RunnerMissing => s.jobs_missing_runner += 1,
                        ExecutionOutcome::Skipped(_) => s.jobs_skipped += 1,
                    }
                }
                Ok(None) => {}
                Err(_) => s.poll_errors += 1,
            }
        }

        let pause = match result {
            // more work may be waiting
            Ok(Some(_)) => {
                consecutive_errors = 0;
                continue;
            }
            Ok(None) => {
                consecutive_errors = 0;
                config.poll_interval
            }
            Err(e) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                let delay = config.retry.delay_for_attempt(consecutive_errors);
                if e.is_transient() {
                    warn!(worker = %name, error = %e, retry_in_ms = delay.as_millis() as u64, "job poll failed");
                } else {
                    error!(worker = %name, error = %e, retry_in_ms = delay.as_millis() as u64, "job poll failed");
                }
                delay
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = service.submitted() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(worker = %name, "job worker stopped");
}

async fn gc_loop(
    name: String,
    service: JobService,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }

        match service.clear_expired_jobs(Utc::now()).await {
            Ok(report) if report.skipped => debug!(worker = %name, "expiry sweep skipped"),
            Ok(report) => debug!(worker = %name, removed = report.total(), "expiry sweep ran"),
            Err(e) => warn!(worker = %name, error = %e, "expiry sweep failed"),
        }
    }
}
