//! Integration tests against a live Postgres.
//!
//! Tests: submission → claim → execution → data → expiry sweep
//!
//! Verifies:
//! - Status transitions only ever add timestamps
//! - Skip-locked claims are exclusive and execution leases hide jobs from
//!   dangling detection
//! - Coalescing only reuses the newest equivalent job
//! - Chunked blobs round trip through Postgres and are swept with their jobs
//!
//! Each test runs in a private schema of the database named by
//! `DATABASE_URL` and is skipped when the variable is unset.

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use sqlx::PgPool;
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
    use uuid::Uuid;

    use jobvault_core::{
        CoalesceSet, JobCode, JobDataCode, JobDataEncoding, JobDataRole, JobError, JobSnapshot,
        JobSpecification, JobStatus,
    };
    use jobvault_observability::tracing::{LogFormat, init};

    use crate::config::{JobServiceConfig, JobWorkerConfig};
    use crate::jobs::claim::{self, ExecutionLease};
    use crate::jobs::ledger::{self, NewJob};
    use crate::jobs::{
        ExecutionOutcome, JobContext, JobRunner, JobService, JobWorkerPool, RunnerRegistry,
        process_next_job,
    };
    use crate::schema::ensure_schema;
    use crate::storage::{DataStorage, StorageConfig};

    const PART: usize = 64;

    struct TestDb {
        admin: PgPool,
        pool: PgPool,
        schema: String,
    }

    impl TestDb {
        async fn teardown(self) {
            self.pool.close().await;
            sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
                .execute(&self.admin)
                .await
                .unwrap();
        }
    }

    async fn test_db() -> Option<TestDb> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL is not set; skipping");
            return None;
        };
        init(&LogFormat::for_tests());

        let admin = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .unwrap();
        let schema = format!("jv_test_{}", Uuid::now_v7().simple());
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&admin)
            .await
            .unwrap();

        let options = PgConnectOptions::from_str(&url)
            .unwrap()
            .options([("search_path", schema.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(12)
            .connect_with(options)
            .await
            .unwrap();
        ensure_schema(&pool).await.unwrap();

        Some(TestDb {
            admin,
            pool,
            schema,
        })
    }

    fn service(pool: &PgPool, runners: RunnerRegistry) -> JobService {
        let storage =
            DataStorage::postgres(pool.clone(), StorageConfig::default().with_part_size(PART))
                .unwrap();
        JobService::new(
            pool.clone(),
            storage,
            runners,
            JobServiceConfig::default().with_dangling_grace(Duration::ZERO),
        )
    }

    async fn insert_job(
        pool: &PgPool,
        job_type: &str,
        owner: Option<&str>,
        queue_time: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> JobCode {
        let payload = json!({ "queued": queue_time.to_rfc3339() });
        let new_job = NewJob {
            code: JobCode::new(),
            job_type_code: job_type,
            owner,
            queue_time,
            time_to_live: ttl,
            payload: &payload,
            supplied_data_codes: &[],
            run_inline: false,
        };
        let mut conn = pool.acquire().await.unwrap();
        ledger::create_job(&mut conn, &new_job).await.unwrap().code
    }

    async fn move_to(pool: &PgPool, code: JobCode, target: JobStatus) -> bool {
        let mut conn = pool.acquire().await.unwrap();
        ledger::update_status(&mut conn, code, Utc::now(), target)
            .await
            .unwrap()
    }

    async fn snapshot(pool: &PgPool, code: JobCode) -> JobSnapshot {
        let mut conn = pool.acquire().await.unwrap();
        ledger::get_job(&mut conn, code).await.unwrap().unwrap()
    }

    struct UppercaseRunner;

    #[async_trait]
    impl JobRunner for UppercaseRunner {
        fn job_type_code(&self) -> &str {
            "uppercase"
        }

        async fn run(&self, ctx: &JobContext, _job: &JobSnapshot) -> anyhow::Result<()> {
            let mut input = Vec::new();
            for code in ctx.supplied_data_codes().await? {
                let (_, mut reader) = ctx
                    .obtain_data(code)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("supplied data [{code}] vanished"))?;
                reader.read_to_end(&mut input).await?;
            }
            ctx.set_progress_percent(50).await?;

            let (_, mut sink) = ctx
                .store_generated_data(Some("output"), "text/plain", JobDataEncoding::None)
                .await?;
            sink.write(&input.to_ascii_uppercase()).await?;
            sink.close().await?;
            Ok(())
        }
    }

    struct BrokenRunner;

    #[async_trait]
    impl JobRunner for BrokenRunner {
        fn job_type_code(&self) -> &str {
            "broken"
        }

        async fn run(&self, _ctx: &JobContext, job: &JobSnapshot) -> anyhow::Result<()> {
            if job.payload["panic"].as_bool().unwrap_or(false) {
                panic!("runner blew up");
            }
            anyhow::bail!("report source is offline")
        }
    }

    fn runners() -> RunnerRegistry {
        RunnerRegistry::new()
            .with_runner(Arc::new(UppercaseRunner))
            .unwrap()
            .with_runner(Arc::new(BrokenRunner))
            .unwrap()
    }

    #[tokio::test]
    async fn transitions_only_add_timestamps() {
        let Some(db) = test_db().await else { return };
        let code = insert_job(&db.pool, "report", None, Utc::now(), chrono::Duration::hours(1)).await;

        let queued = snapshot(&db.pool, code).await;
        assert_eq!(queued.status(), JobStatus::Queued);

        assert!(move_to(&db.pool, code, JobStatus::Started).await);
        let started = snapshot(&db.pool, code).await;
        assert_eq!(started.timestamps.queue, queued.timestamps.queue);
        assert!(started.timestamps.start.is_some());
        assert_eq!(started.progress.value(), 0);

        // same status again is a no-op
        assert!(!move_to(&db.pool, code, JobStatus::Started).await);

        let mut conn = db.pool.acquire().await.unwrap();
        let backwards = ledger::update_status(&mut conn, code, Utc::now(), JobStatus::Queued).await;
        assert!(matches!(
            backwards,
            Err(JobError::Transition { from: JobStatus::Started, to: JobStatus::Queued })
        ));
        drop(conn);

        assert!(move_to(&db.pool, code, JobStatus::Finished).await);
        let finished = snapshot(&db.pool, code).await;
        assert_eq!(finished.timestamps.start, started.timestamps.start);
        assert_eq!(finished.progress.value(), 100);
        assert_eq!(finished.status(), JobStatus::Finished);

        let mut conn = db.pool.acquire().await.unwrap();
        assert!(matches!(
            ledger::update_status(&mut conn, code, Utc::now(), JobStatus::Cancelled).await,
            Err(JobError::Transition { .. })
        ));
        drop(conn);

        db.teardown().await;
    }

    #[tokio::test]
    async fn progress_is_clamped_and_only_recorded_while_started() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, RunnerRegistry::new());
        let code = insert_job(&db.pool, "import", None, Utc::now(), chrono::Duration::hours(1)).await;

        assert!(!svc.set_progress_percent(code, 40).await.unwrap());

        move_to(&db.pool, code, JobStatus::Started).await;
        assert!(svc.set_progress_percent(code, 40).await.unwrap());
        assert!(!svc.set_progress_percent(code, 40).await.unwrap());
        assert!(svc.set_progress_percent(code, 250).await.unwrap());
        assert_eq!(snapshot(&db.pool, code).await.progress.value(), 100);

        assert!(matches!(
            svc.set_progress_percent(JobCode::new(), 10).await,
            Err(JobError::NotFound(_))
        ));

        db.teardown().await;
    }

    #[tokio::test]
    async fn count_not_finished_tracks_terminal_timestamps() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, RunnerRegistry::new());
        let now = Utc::now();
        let ttl = chrono::Duration::hours(1);

        let mut codes = Vec::new();
        for i in 0..6 {
            codes.push(insert_job(&db.pool, "mix", None, now - chrono::Duration::seconds(i), ttl).await);
        }
        move_to(&db.pool, codes[1], JobStatus::Started).await;
        move_to(&db.pool, codes[2], JobStatus::Started).await;
        move_to(&db.pool, codes[2], JobStatus::Finished).await;
        move_to(&db.pool, codes[3], JobStatus::Failed).await;
        move_to(&db.pool, codes[4], JobStatus::Cancelled).await;

        assert_eq!(svc.count_not_finished().await.unwrap(), 3);
        assert!(!svc.is_finished(codes[0]).await.unwrap());
        assert!(!svc.is_finished(codes[1]).await.unwrap());
        assert!(svc.is_finished(codes[2]).await.unwrap());
        assert!(svc.is_finished(codes[4]).await.unwrap());

        db.teardown().await;
    }

    #[tokio::test]
    async fn find_jobs_pages_newest_first() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, RunnerRegistry::new());
        let base = Utc::now() - chrono::Duration::hours(1);
        let ttl = chrono::Duration::hours(4);

        let mut codes = Vec::new();
        for i in 0..8 {
            let queued = base - chrono::Duration::minutes(i);
            let code = insert_job(&db.pool, "page", Some("alice"), queued, ttl).await;
            match i {
                3 => {
                    move_to(&db.pool, code, JobStatus::Failed).await;
                }
                6 => {}
                _ => {
                    move_to(&db.pool, code, JobStatus::Started).await;
                }
            }
            codes.push(code);
        }
        // somebody else's job must not show up
        insert_job(&db.pool, "page", Some("bob"), base, ttl).await;

        let page = svc
            .find_jobs(Some("alice"), &[JobStatus::Started], 2, 3)
            .await
            .unwrap();
        let page: Vec<JobCode> = page.iter().map(|j| j.code).collect();
        assert_eq!(page, vec![codes[2], codes[4], codes[5]]);

        assert_eq!(svc.total_jobs(Some("alice"), &[JobStatus::Started]).await.unwrap(), 6);
        assert_eq!(svc.total_jobs(Some("alice"), &[]).await.unwrap(), 8);
        assert_eq!(svc.total_jobs(None, &[]).await.unwrap(), 9);
        assert!(matches!(
            svc.find_jobs(None, &[], 0, 0).await,
            Err(JobError::Validation(_))
        ));

        db.teardown().await;
    }

    #[tokio::test]
    async fn an_open_claim_hides_the_job_from_other_claimers() {
        let Some(db) = test_db().await else { return };
        let code = insert_job(&db.pool, "claim", None, Utc::now(), chrono::Duration::hours(1)).await;

        let mut a = db.pool.begin().await.unwrap();
        assert_eq!(claim::try_claim_next_job(&mut a).await.unwrap(), Some(code));

        let mut b = db.pool.begin().await.unwrap();
        assert_eq!(claim::try_claim_next_job(&mut b).await.unwrap(), None);
        b.rollback().await.unwrap();

        a.rollback().await.unwrap();

        let mut c = db.pool.begin().await.unwrap();
        assert_eq!(claim::try_claim_next_job(&mut c).await.unwrap(), Some(code));
        c.rollback().await.unwrap();

        db.teardown().await;
    }

    #[tokio::test]
    async fn claims_take_the_oldest_queued_job_first() {
        let Some(db) = test_db().await else { return };
        let now = Utc::now();
        let ttl = chrono::Duration::hours(1);
        let newer = insert_job(&db.pool, "claim", None, now, ttl).await;
        let older = insert_job(&db.pool, "claim", None, now - chrono::Duration::minutes(5), ttl).await;

        assert_eq!(claim::claim_and_start_next_job(&db.pool, now).await.unwrap(), Some(older));
        assert_eq!(snapshot(&db.pool, older).await.status(), JobStatus::Started);
        assert_eq!(claim::claim_and_start_next_job(&db.pool, now).await.unwrap(), Some(newer));
        assert_eq!(claim::claim_and_start_next_job(&db.pool, now).await.unwrap(), None);

        db.teardown().await;
    }

    #[tokio::test]
    async fn leased_jobs_are_not_dangling() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, RunnerRegistry::new());
        let code = insert_job(&db.pool, "lease", None, Utc::now(), chrono::Duration::hours(1)).await;
        assert_eq!(svc.claim_next_job().await.unwrap(), Some(code));

        // claimed and committed, but nobody executes it
        assert_eq!(svc.find_dangling_started_jobs().await.unwrap(), vec![code]);

        let lease = ExecutionLease::acquire(&db.pool, code).await.unwrap();
        assert!(svc.find_dangling_started_jobs().await.unwrap().is_empty());

        lease.release().await.unwrap();
        assert_eq!(svc.find_dangling_started_jobs().await.unwrap(), vec![code]);

        db.teardown().await;
    }

    #[tokio::test]
    async fn submissions_coalesce_onto_the_newest_match() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, RunnerRegistry::new());
        let spec = JobSpecification::new("Report", json!({ "month": "2026-09" }));

        let first = svc.submit(&spec, CoalesceSet::Queued).await.unwrap();
        let again = svc.submit(&spec, CoalesceSet::Queued).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(svc.total_jobs(None, &[]).await.unwrap(), 1);

        let forced = svc.submit(&spec, CoalesceSet::None).await.unwrap();
        assert_ne!(forced, first);

        // a different type never coalesces
        let other = JobSpecification::new("export", json!({}));
        assert_ne!(svc.submit(&other, CoalesceSet::Queued).await.unwrap(), first);

        // both report jobs started; only `first` is still being executed
        assert!(svc.claim_next_job().await.unwrap().is_some());
        assert!(svc.claim_next_job().await.unwrap().is_some());
        let lease = ExecutionLease::acquire(&db.pool, first).await.unwrap();

        let reused = svc.submit(&spec, CoalesceSet::QueuedOrStarted).await.unwrap();
        assert_eq!(reused, first);
        assert_eq!(snapshot(&db.pool, forced).await.status(), JobStatus::Failed);

        lease.release().await.unwrap();
        db.teardown().await;
    }

    #[tokio::test]
    async fn only_equivalent_submissions_coalesce() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, RunnerRegistry::new());
        let alice = JobSpecification::new("report", json!({ "month": "2026-09" })).with_owner("alice");

        let first = svc.submit(&alice, CoalesceSet::Queued).await.unwrap();

        let bob = JobSpecification::new("report", json!({ "month": "1999-01" })).with_owner("bob");
        let bobs = svc.submit(&bob, CoalesceSet::Queued).await.unwrap();
        assert_ne!(bobs, first);
        assert_eq!(snapshot(&db.pool, bobs).await.owner.as_deref(), Some("bob"));

        let same_payload_other_owner = alice.clone().with_owner("bob");
        assert_ne!(svc.submit(&same_payload_other_owner, CoalesceSet::Queued).await.unwrap(), first);

        let same_owner_other_payload =
            JobSpecification::new("report", json!({ "month": "2026-10" })).with_owner("alice");
        assert_ne!(svc.submit(&same_owner_other_payload, CoalesceSet::Queued).await.unwrap(), first);

        assert_eq!(svc.submit(&alice, CoalesceSet::Queued).await.unwrap(), first);
        assert_eq!(svc.total_jobs(None, &[]).await.unwrap(), 4);

        db.teardown().await;
    }

    #[tokio::test]
    async fn pre_assigned_codes_cannot_be_reused() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, RunnerRegistry::new());
        let code = JobCode::new();
        let spec = JobSpecification::new("report", json!({})).with_code(code);

        assert_eq!(svc.submit(&spec, CoalesceSet::None).await.unwrap(), code);
        assert!(matches!(
            svc.submit(&spec, CoalesceSet::None).await,
            Err(JobError::IllegalState(_))
        ));
        assert_eq!(svc.total_jobs(None, &[]).await.unwrap(), 1);

        db.teardown().await;
    }

    #[tokio::test]
    async fn run_immediate_only_reuses_equivalent_finished_jobs() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, runners());

        let september = JobSpecification::new("uppercase", json!({ "month": "2026-09" }));
        let first = svc.run_immediate(&september, true, true).await.unwrap();
        assert!(svc.is_finished(first).await.unwrap());

        let october = JobSpecification::new("uppercase", json!({ "month": "2026-10" }));
        assert_ne!(svc.run_immediate(&october, true, true).await.unwrap(), first);
        assert_eq!(svc.run_immediate(&september, true, true).await.unwrap(), first);

        db.teardown().await;
    }

    #[tokio::test]
    async fn storage_round_trips_multi_part_blobs() {
        let Some(db) = test_db().await else { return };
        let storage =
            DataStorage::postgres(db.pool.clone(), StorageConfig::default().with_part_size(PART))
                .unwrap();

        for (i, len) in [0, 1, PART, PART + 1, 10 * PART + 17].into_iter().enumerate() {
            let key = format!("blob-{i}");
            let bytes: Vec<u8> = (0..len).map(|b| (b % 251) as u8).collect();

            let mut sink = storage.put(&key).await.unwrap();
            sink.write(&bytes).await.unwrap();
            assert_eq!(sink.close().await.unwrap(), len as u64);

            let mut reader = storage.get(&key).await.unwrap().unwrap();
            assert_eq!(reader.length(), len as u64);
            let mut read = Vec::new();
            reader.read_to_end(&mut read).await.unwrap();
            assert_eq!(read, bytes);
        }

        assert_eq!(storage.size().await.unwrap(), 5);
        assert_eq!(
            storage.total_bytes().await.unwrap(),
            (1 + PART + PART + 1 + 10 * PART + 17) as u64
        );
        assert!(matches!(
            storage.put("blob-1").await,
            Err(crate::storage::StorageError::IllegalState(_))
        ));

        assert!(storage.remove("blob-4").await.unwrap());
        assert!(storage.get("blob-4").await.unwrap().is_none());
        assert!(!storage.remove("blob-4").await.unwrap());

        storage.clear().await.unwrap();
        assert_eq!(storage.size().await.unwrap(), 0);

        db.teardown().await;
    }

    #[tokio::test]
    async fn supplied_data_attaches_to_exactly_one_job() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, RunnerRegistry::new());

        let data = svc
            .store_supplied_data(Some("input"), "text/csv; charset=utf-8", JobDataEncoding::None, &mut &b"a,b\n1,2\n"[..])
            .await
            .unwrap();
        let stored = svc.try_get_data(data).await.unwrap().unwrap();
        assert_eq!(stored.role, JobDataRole::Supplied);
        assert_eq!(stored.media_type, "text/csv");
        assert_eq!(stored.job_code, None);

        let spec = JobSpecification::new("import", json!({})).with_supplied_data(data);
        let job = svc.submit(&spec, CoalesceSet::None).await.unwrap();
        assert_eq!(svc.find_data_codes(job, JobDataRole::Supplied).await.unwrap(), vec![data]);
        assert_eq!(svc.try_get_job_for_data(data).await.unwrap().unwrap().code, job);

        // the same data cannot feed a second job; that job is rolled back
        assert!(matches!(
            svc.submit(&spec, CoalesceSet::None).await,
            Err(JobError::IllegalState(_))
        ));
        let unknown = JobSpecification::new("import", json!({}))
            .with_supplied_data(jobvault_core::JobDataCode::new());
        assert!(matches!(
            svc.submit(&unknown, CoalesceSet::None).await,
            Err(JobError::NotFound(_))
        ));
        assert_eq!(svc.total_jobs(None, &[]).await.unwrap(), 1);

        let filename = svc.derive_data_filename(data).await.unwrap();
        assert!(filename.starts_with("jv_import_"));
        assert!(filename.ends_with(".csv"));

        db.teardown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_pool_executes_submitted_jobs() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, runners());

        let input = svc
            .store_supplied_data(None, "text/plain", JobDataEncoding::None, &mut &b"hello jobvault"[..])
            .await
            .unwrap();
        let spec = JobSpecification::new("uppercase", json!({})).with_supplied_data(input);
        let code = svc.submit(&spec, CoalesceSet::None).await.unwrap();

        let handle = JobWorkerPool::new(
            svc.clone(),
            JobWorkerConfig::default()
                .with_poll_interval(Duration::from_millis(50))
                .with_gc_interval(None),
        )
        .spawn();

        let status = svc.await_finished(code, Duration::from_secs(10)).await.unwrap();
        assert_eq!(status, Some(JobStatus::Finished));
        assert!(svc.await_all_finished(Duration::from_secs(5)).await.unwrap());

        let details = svc.get_job(code).await.unwrap().unwrap();
        assert_eq!(details.status, JobStatus::Finished);
        assert_eq!(details.job.progress.value(), 100);
        assert_eq!(details.generated_data_codes.len(), 1);

        let (data, mut reader) = svc
            .obtain_data(details.generated_data_codes[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.use_code.as_deref(), Some("output"));
        let mut output = Vec::new();
        reader.read_to_end(&mut output).await.unwrap();
        assert_eq!(output, b"HELLO JOBVAULT");

        let stats = handle.shutdown().await;
        assert_eq!(stats.jobs_succeeded, 1);
        assert_eq!(stats.jobs_failed, 0);

        db.teardown().await;
    }

    #[tokio::test]
    async fn runner_errors_and_panics_fail_the_job() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, runners());

        let failing = JobSpecification::new("broken", json!({}));
        let code = svc.run_immediate(&failing, false, true).await.unwrap();
        assert_eq!(snapshot(&db.pool, code).await.status(), JobStatus::Failed);

        let panicking = JobSpecification::new("broken", json!({ "panic": true }));
        let code = svc.run_immediate(&panicking, false, true).await.unwrap();
        assert_eq!(snapshot(&db.pool, code).await.status(), JobStatus::Failed);

        let orphan = JobSpecification::new("nobody-runs-this", json!({}));
        let code = svc.submit(&orphan, CoalesceSet::None).await.unwrap();
        assert_eq!(
            process_next_job(&svc).await.unwrap(),
            Some(ExecutionOutcome::RunnerMissing)
        );
        assert_eq!(snapshot(&db.pool, code).await.status(), JobStatus::Failed);
        assert_eq!(process_next_job(&svc).await.unwrap(), None);

        db.teardown().await;
    }

    #[tokio::test]
    async fn run_immediate_reuses_a_finished_job() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, runners());
        let spec = JobSpecification::new("uppercase", json!({}));

        let first = svc.run_immediate(&spec, true, true).await.unwrap();
        assert_eq!(snapshot(&db.pool, first).await.status(), JobStatus::Finished);

        assert_eq!(svc.run_immediate(&spec, true, true).await.unwrap(), first);
        assert_ne!(svc.run_immediate(&spec, false, true).await.unwrap(), first);

        db.teardown().await;
    }

    #[tokio::test]
    async fn cancelled_jobs_are_skipped_by_execution() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, runners());
        let code = svc
            .submit(&JobSpecification::new("uppercase", json!({})), CoalesceSet::None)
            .await
            .unwrap();

        assert!(svc.cancel_job(code).await.unwrap());
        assert!(!svc.cancel_job(code).await.unwrap());
        assert_eq!(process_next_job(&svc).await.unwrap(), None);
        assert_eq!(
            svc.await_finished(code, Duration::from_millis(100)).await.unwrap(),
            Some(JobStatus::Cancelled)
        );

        db.teardown().await;
    }

    #[tokio::test]
    async fn await_finished_times_out_on_queued_jobs() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, RunnerRegistry::new());
        let code = svc
            .submit(&JobSpecification::new("slow", json!({})), CoalesceSet::None)
            .await
            .unwrap();

        assert_eq!(svc.await_finished(code, Duration::from_millis(200)).await.unwrap(), None);
        assert!(!svc.await_all_finished(Duration::from_millis(100)).await.unwrap());
        assert!(matches!(
            svc.await_finished(JobCode::new(), Duration::from_millis(10)).await,
            Err(JobError::NotFound(_))
        ));

        db.teardown().await;
    }

    #[tokio::test]
    async fn expired_terminal_jobs_are_removed_with_their_data() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, RunnerRegistry::new());
        let long_ago = Utc::now() - chrono::Duration::hours(3);

        let expired = insert_job(&db.pool, "gc", None, long_ago, chrono::Duration::hours(1)).await;
        move_to(&db.pool, expired, JobStatus::Started).await;
        let (data, mut sink) = svc
            .store_generated_data(expired, None, "application/json", JobDataEncoding::Gzip)
            .await
            .unwrap();
        sink.write(&[7u8; 3 * PART]).await.unwrap();
        sink.close().await.unwrap();
        move_to(&db.pool, expired, JobStatus::Finished).await;

        let fresh = insert_job(&db.pool, "gc", None, Utc::now(), chrono::Duration::hours(1)).await;
        move_to(&db.pool, fresh, JobStatus::Failed).await;
        let unfinished = insert_job(&db.pool, "gc", None, long_ago, chrono::Duration::hours(1)).await;

        assert_eq!(svc.clear_completed_expired_jobs(Utc::now()).await.unwrap(), 1);

        assert!(svc.get_job(expired).await.unwrap().is_none());
        assert!(svc.try_get_data(data.code).await.unwrap().is_none());
        assert!(svc.storage().get(&data.code.storage_key()).await.unwrap().is_none());
        assert!(svc.get_job(fresh).await.unwrap().is_some());
        assert!(svc.get_job(unfinished).await.unwrap().is_some());

        db.teardown().await;
    }

    #[tokio::test]
    async fn full_sweep_reaps_stale_jobs_and_orphans() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, RunnerRegistry::new());
        let ancient = Utc::now() - chrono::Duration::days(30);

        let stale = insert_job(&db.pool, "gc", None, ancient, chrono::Duration::hours(1)).await;
        let dangling = insert_job(&db.pool, "gc", None, Utc::now(), chrono::Duration::hours(1)).await;
        move_to(&db.pool, dangling, JobStatus::Started).await;

        let report = svc.clear_expired_jobs(Utc::now()).await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.dangling_failed, 1);
        assert_eq!(report.stale_expired, 1);
        assert!(svc.get_job(stale).await.unwrap().is_none());
        assert_eq!(snapshot(&db.pool, dangling).await.status(), JobStatus::Failed);

        // a concurrent sweeper backs off while the lock is held
        let mut holder = db.pool.begin().await.unwrap();
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(crate::jobs::gc::SWEEP_LOCK_KEY)
            .execute(&mut *holder)
            .await
            .unwrap();
        assert!(svc.clear_expired_jobs(Utc::now()).await.unwrap().skipped);
        holder.rollback().await.unwrap();

        db.teardown().await;
    }

    #[tokio::test]
    async fn sweep_only_reclaims_job_data_blobs() {
        let Some(db) = test_db().await else { return };
        let storage =
            DataStorage::postgres(db.pool.clone(), StorageConfig::default().with_part_size(PART))
                .unwrap();
        let svc = JobService::new(
            db.pool.clone(),
            storage,
            RunnerRegistry::new(),
            JobServiceConfig::default()
                .with_max_ttl(Duration::ZERO)
                .with_dangling_grace(Duration::ZERO),
        );

        let orphan = JobDataCode::new().storage_key();
        for key in [orphan.as_str(), "avatars/alice"] {
            let mut sink = svc.storage().put(key).await.unwrap();
            sink.write(b"bytes").await.unwrap();
            sink.close().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = svc.clear_expired_jobs(Utc::now()).await.unwrap();
        assert_eq!(report.orphan_blobs, 1);
        assert!(svc.storage().get(&orphan).await.unwrap().is_none());
        assert!(svc.storage().get("avatars/alice").await.unwrap().is_some());

        db.teardown().await;
    }

    #[tokio::test]
    async fn out_of_range_time_to_live_is_rejected() {
        let Some(db) = test_db().await else { return };
        let storage =
            DataStorage::postgres(db.pool.clone(), StorageConfig::default().with_part_size(PART))
                .unwrap();
        let svc = JobService::new(
            db.pool.clone(),
            storage,
            RunnerRegistry::new(),
            JobServiceConfig::default().with_max_ttl(Duration::MAX),
        );

        let spec = JobSpecification::new("report", json!({}))
            .with_time_to_live(Duration::from_secs(10_000_000_000_000));
        assert!(matches!(
            svc.submit(&spec, CoalesceSet::None).await,
            Err(JobError::Validation(_))
        ));
        assert_eq!(svc.total_jobs(None, &[]).await.unwrap(), 0);

        db.teardown().await;
    }

    #[tokio::test]
    async fn running_jobs_cannot_be_removed() {
        let Some(db) = test_db().await else { return };
        let svc = service(&db.pool, RunnerRegistry::new());
        let code = insert_job(&db.pool, "purge", None, Utc::now(), chrono::Duration::hours(1)).await;
        move_to(&db.pool, code, JobStatus::Started).await;

        let lease = ExecutionLease::acquire(&db.pool, code).await.unwrap();
        assert!(matches!(svc.remove_job(code).await, Err(JobError::IllegalState(_))));
        lease.release().await.unwrap();

        assert!(svc.remove_job(code).await.unwrap());
        assert!(!svc.remove_job(code).await.unwrap());

        db.teardown().await;
    }
}
