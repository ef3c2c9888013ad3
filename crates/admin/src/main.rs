//! Operator tool for a job vault database.

use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use jobvault_core::{JobCode, JobStatus};
use jobvault_infra::{
    DataStorage, JobService, JobVaultConfig, RunnerRegistry, ensure_schema,
};
use jobvault_observability::tracing::{LogFormat, init};

#[derive(Parser, Debug)]
#[command(name = "jobvault-admin")]
#[command(about = "Inspect and maintain a job vault database", long_about = None)]
struct Cli {
    /// Postgres connection URL.
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,
    /// Human readable logs instead of JSON lines.
    #[arg(long, global = true)]
    text_logs: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create or upgrade the schema.
    Migrate,
    /// Job and storage counters.
    Stats,
    /// List jobs, newest queued first.
    Jobs {
        #[arg(long)]
        owner: Option<String>,
        /// Status filter (may repeat); all statuses when absent.
        #[arg(long = "status")]
        statuses: Vec<JobStatus>,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show one job as JSON.
    Show { code: JobCode },
    /// Request cancellation of a job.
    Cancel { code: JobCode },
    /// Delete a job with its data.
    Remove { code: JobCode },
    /// STARTED jobs that no live worker holds.
    Dangling,
    /// Run the expiry sweep once.
    Gc,
    /// Delete every stored blob.
    ClearStorage {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init(&LogFormat::default().with_json(!cli.text_logs));

    let database_url = cli.database_url.clone();
    let config = JobVaultConfig::from_lookup(|name| match name {
        "DATABASE_URL" => database_url.clone(),
        _ => std::env::var(name).ok(),
    })
    .context("invalid configuration")?;

    let pool = config.connect().await?;
    let storage = DataStorage::postgres(pool.clone(), config.storage.clone())?;
    let service = JobService::new(pool, storage, RunnerRegistry::new(), config.service.clone());

    run(cli.cmd, &service).await
}

async fn run(cmd: Cmd, service: &JobService) -> anyhow::Result<()> {
    match cmd {
        Cmd::Migrate => {
            ensure_schema(service.pool()).await?;
            info!("schema is up to date");
        }
        Cmd::Stats => {
            let mut by_status = serde_json::Map::new();
            for status in JobStatus::ALL {
                if status == JobStatus::Indeterminate {
                    continue;
                }
                let count = service.total_jobs(None, &[status]).await?;
                by_status.insert(status.to_string(), count.into());
            }
            let stats = serde_json::json!({
                "jobs": service.total_jobs(None, &[]).await?,
                "not_finished": service.count_not_finished().await?,
                "by_status": by_status,
                "blobs": service.storage().size().await?,
                "blob_bytes": service.storage().total_bytes().await?,
            });
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Cmd::Jobs {
            owner,
            statuses,
            offset,
            limit,
        } => {
            let jobs = service
                .find_jobs(owner.as_deref(), &statuses, offset, limit)
                .await?;
            let total = service.total_jobs(owner.as_deref(), &statuses).await?;
            for job in &jobs {
                println!(
                    "{}  {:<10}  {:>3}%  {:<24}  {}",
                    job.code,
                    job.status(),
                    job.progress.value(),
                    job.job_type_code,
                    job.timestamps
                        .queue
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
            println!("{} of {} jobs", jobs.len(), total);
        }
        Cmd::Show { code } => {
            let Some(details) = service.get_job(code).await? else {
                bail!("job [{code}] not found");
            };
            println!("{}", serde_json::to_string_pretty(&details)?);
        }
        Cmd::Cancel { code } => {
            if service.cancel_job(code).await? {
                println!("job [{code}] cancelled");
            } else {
                println!("job [{code}] was already cancelled");
            }
        }
        Cmd::Remove { code } => {
            if !service.remove_job(code).await? {
                bail!("job [{code}] not found");
            }
            println!("job [{code}] removed");
        }
        Cmd::Dangling => {
            for code in service.find_dangling_started_jobs().await? {
                println!("{code}");
            }
        }
        Cmd::Gc => {
            let report = service.clear_expired_jobs(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Cmd::ClearStorage { yes } => {
            if !yes {
                bail!("refusing to delete every blob without --yes");
            }
            service.storage().clear().await?;
            println!("storage cleared");
        }
    }
    Ok(())
}
