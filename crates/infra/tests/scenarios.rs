//! End-to-end flows over the runner, rescheduler, cleanup and queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::TimeDelta;
use tokio_util::sync::CancellationToken;

use docflow_core::{
    JobId, JobPaths, JobRecord, JobStatus, StatusUpdate, backoff_for_attempt, time,
};
use docflow_infra::JobQueueConfig;
use docflow_infra::jobs::rescheduler::MAX_ATTEMPTS_REACHED;
use docflow_infra::jobs::runner::{CANCELLED_BY_USER, TIMEOUT};
use docflow_infra::jobs::{
    ArtifactStore, Cleanup, ConcurrencyGate, DispatchError, Disposition, DocumentJobStore,
    JobQueue, JobRunError, JobRunner, JobStore, NewJob, ProcessError, ProcessInput, ProcessResult,
    Processor, Rescheduler, RunOptions, RunnerConfig, SqliteJobStore, SubmitError,
    WorkDispatcher, WorkerPool, WorkerPoolConfig,
};

struct Succeeds;

#[async_trait::async_trait]
impl Processor for Succeeds {
    async fn execute(
        &self,
        input: ProcessInput,
        _cancel: CancellationToken,
    ) -> Result<ProcessResult, ProcessError> {
        Ok(ProcessResult::success(format!(r#"{{"job":"{}"}}"#, input.job_id)))
    }
}

/// Never returns on its own and ignores cancellation.
struct Hangs;

#[async_trait::async_trait]
impl Processor for Hangs {
    async fn execute(
        &self,
        _input: ProcessInput,
        _cancel: CancellationToken,
    ) -> Result<ProcessResult, ProcessError> {
        std::future::pending().await
    }
}

/// Blocks until its run is cancelled.
struct UntilCancelled;

#[async_trait::async_trait]
impl Processor for UntilCancelled {
    async fn execute(
        &self,
        _input: ProcessInput,
        cancel: CancellationToken,
    ) -> Result<ProcessResult, ProcessError> {
        cancel.cancelled().await;
        Err(ProcessError::new("interrupted"))
    }
}

/// Records how many executions overlap.
#[derive(Default)]
struct Overlap {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait::async_trait]
impl Processor for Overlap {
    async fn execute(
        &self,
        _input: ProcessInput,
        _cancel: CancellationToken,
    ) -> Result<ProcessResult, ProcessError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(ProcessResult::success("{}"))
    }
}

#[derive(Default)]
struct Collect(Mutex<Vec<JobId>>);

impl WorkDispatcher for Collect {
    fn enqueue(&self, id: JobId) -> Result<bool, DispatchError> {
        self.0.lock().unwrap().push(id);
        Ok(true)
    }
}

fn runner_config(job_timeout: Duration) -> RunnerConfig {
    RunnerConfig {
        job_timeout,
        lease_window: Duration::from_secs(120),
        heartbeat_interval: Duration::from_secs(10),
    }
}

async fn create_job(store: &dyn JobStore, artifacts: &ArtifactStore) -> JobRecord {
    let id = JobId::new();
    let dir = artifacts.create_job_directory(id).await.unwrap();
    artifacts
        .save_input_atomic(id, "input.pdf", b"%PDF-1.7")
        .await
        .unwrap();
    store
        .create(JobRecord::queued(id).with_paths(JobPaths::in_dir(dir, "input.pdf")))
        .await
        .unwrap()
}

async fn wait_for(
    store: &dyn JobStore,
    id: JobId,
    done: impl Fn(&JobRecord) -> bool,
) -> JobRecord {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(job) = store.get(id).await.unwrap() {
                if done(&job) {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job did not reach the expected state in time")
}

async fn running_job(
    store: &dyn JobStore,
    attempts: u32,
    lease_until: chrono::DateTime<chrono::Utc>,
) -> JobId {
    let job = store.create(JobRecord::queued(JobId::new())).await.unwrap();
    for _ in 0..attempts {
        store.increment_attempts(job.id).await.unwrap();
    }
    store
        .update_status(job.id, StatusUpdate::new(JobStatus::Running).started(time::now()))
        .await
        .unwrap();
    store.touch_lease(job.id, lease_until).await.unwrap();
    job.id
}

#[tokio::test]
async fn queued_job_is_dispatched_and_succeeds() {
    let root = tempfile::tempdir().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory().await.unwrap());
    let artifacts = ArtifactStore::new(root.path());
    let job = create_job(store.as_ref(), &artifacts).await;

    let runner = Arc::new(JobRunner::new(
        store.clone(),
        artifacts.clone(),
        Arc::new(Succeeds),
        ConcurrencyGate::new(2),
        runner_config(Duration::from_secs(5)),
    ));
    let shutdown = CancellationToken::new();
    let (pool, handle) = WorkerPool::spawn(runner, WorkerPoolConfig::default(), shutdown.clone());
    let rescheduler = Rescheduler::new(store.clone(), Arc::new(pool), artifacts.clone(), 5);

    let report = rescheduler.tick(time::now()).await;
    assert_eq!(report.dispatched, 1);

    let done = wait_for(store.as_ref(), job.id, |j| j.status.is_terminal()).await;
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.progress, 100);
    assert_eq!(done.attempts, 1);
    assert!(done.metrics.duration_ms.is_some());
    let output = done.paths.output.unwrap();
    assert!(output.created_at.is_some());
    assert!(output.path.exists());

    handle.shutdown().await;
}

#[tokio::test]
async fn hung_processing_times_out() {
    let root = tempfile::tempdir().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(DocumentJobStore::in_memory());
    let artifacts = ArtifactStore::new(root.path());
    let job = create_job(store.as_ref(), &artifacts).await;

    let runner = JobRunner::new(
        store.clone(),
        artifacts.clone(),
        Arc::new(Hangs),
        ConcurrencyGate::new(1),
        runner_config(Duration::from_secs(1)),
    );
    let err = runner
        .run(job.id, CancellationToken::new(), RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, JobRunError::TimedOut));

    let failed = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some(TIMEOUT));
    let artifact = tokio::fs::read_to_string(artifacts.job_dir(job.id).join(JobPaths::ERROR_FILE))
        .await
        .unwrap();
    assert!(artifact.contains("timeout"));
}

#[tokio::test]
async fn unwritable_output_fails_the_job() {
    let root = tempfile::tempdir().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory().await.unwrap());
    let artifacts = ArtifactStore::new(root.path());
    let job = create_job(store.as_ref(), &artifacts).await;
    let blocked = artifacts.job_dir(job.id).join(JobPaths::OUTPUT_FILE);
    std::fs::create_dir(&blocked).unwrap();
    std::fs::write(blocked.join("keep"), b"x").unwrap();

    let runner = JobRunner::new(
        store.clone(),
        artifacts.clone(),
        Arc::new(Succeeds),
        ConcurrencyGate::new(1),
        runner_config(Duration::from_secs(5)),
    );
    let err = runner
        .run(job.id, CancellationToken::new(), RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, JobRunError::OutputNotWritten(_)));

    let failed = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error_message.unwrap().contains("failed to write output"));
    assert!(failed.metrics.ended_at.is_some());
    assert!(blocked.is_dir());
    let artifact = tokio::fs::read_to_string(artifacts.job_dir(job.id).join(JobPaths::ERROR_FILE))
        .await
        .unwrap();
    assert!(artifact.contains("failed to write output"));
}

#[tokio::test]
async fn expired_lease_is_requeued_with_backoff() {
    let root = tempfile::tempdir().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(DocumentJobStore::in_memory());
    let max_attempts = 3;
    let now = time::now();
    let id = running_job(store.as_ref(), max_attempts - 1, now - TimeDelta::minutes(1)).await;

    let dispatcher = Arc::new(Collect::default());
    let rescheduler = Rescheduler::new(
        store.clone(),
        dispatcher.clone(),
        ArtifactStore::new(root.path()),
        max_attempts,
    );
    let report = rescheduler.tick(now).await;
    assert_eq!(report.requeued, 1);

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts, max_attempts);
    assert!(job.lease_until.is_none());
    assert_eq!(
        job.available_at,
        Some(now + time::delta(backoff_for_attempt(max_attempts)))
    );
    assert!(dispatcher.0.lock().unwrap().is_empty());
}

#[tokio::test]
async fn expired_lease_past_max_attempts_fails() {
    let root = tempfile::tempdir().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory().await.unwrap());
    let artifacts = ArtifactStore::new(root.path());
    let max_attempts = 3;
    let now = time::now();
    let id = running_job(store.as_ref(), max_attempts, now - TimeDelta::minutes(1)).await;

    let rescheduler = Rescheduler::new(
        store.clone(),
        Arc::new(Collect::default()),
        artifacts.clone(),
        max_attempts,
    );
    let report = rescheduler.tick(now).await;
    assert_eq!(report.failed, 1);

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some(MAX_ATTEMPTS_REACHED));
    assert_eq!(job.attempts, max_attempts);
    let artifact = tokio::fs::read_to_string(artifacts.job_dir(id).join(JobPaths::ERROR_FILE))
        .await
        .unwrap();
    assert_eq!(artifact, MAX_ATTEMPTS_REACHED);
}

#[tokio::test]
async fn killed_run_is_recovered_by_the_rescheduler() {
    let root = tempfile::tempdir().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(DocumentJobStore::in_memory());
    let artifacts = ArtifactStore::new(root.path());
    let job = create_job(store.as_ref(), &artifacts).await;

    let runner = Arc::new(JobRunner::new(
        store.clone(),
        artifacts.clone(),
        Arc::new(UntilCancelled),
        ConcurrencyGate::new(1),
        RunnerConfig {
            job_timeout: Duration::from_secs(60),
            lease_window: Duration::from_secs(1),
            heartbeat_interval: Duration::ZERO,
        },
    ));
    let run = {
        let runner = runner.clone();
        tokio::spawn(async move {
            runner
                .run(job.id, CancellationToken::new(), RunOptions::default())
                .await
        })
    };
    let running = wait_for(store.as_ref(), job.id, |j| {
        j.status == JobStatus::Running && j.lease_until.is_some()
    })
    .await;
    run.abort();
    let _ = run.await;

    let dispatcher = Arc::new(Collect::default());
    let rescheduler = Rescheduler::new(store.clone(), dispatcher.clone(), artifacts, 5);
    let lease_until = running.lease_until.unwrap();

    let early = rescheduler.tick(lease_until - TimeDelta::milliseconds(1)).await;
    assert_eq!(early.requeued, 0);

    let poll = TimeDelta::seconds(10);
    let report = rescheduler.tick(lease_until + poll).await;
    assert_eq!(report.requeued, 1);
    let requeued = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.attempts, running.attempts + 1);

    let later = requeued.available_at.unwrap();
    let report = rescheduler.tick(later).await;
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.requeued, 0);
    assert_eq!(dispatcher.0.lock().unwrap().as_slice(), &[job.id]);
    assert_eq!(store.get(job.id).await.unwrap().unwrap().attempts, running.attempts + 1);
}

#[tokio::test]
async fn cleanup_removes_expired_records_and_directories() {
    let root = tempfile::tempdir().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory().await.unwrap());
    let artifacts = ArtifactStore::new(root.path());
    let job = create_job(store.as_ref(), &artifacts).await;
    let dir = artifacts.job_dir(job.id);
    assert!(dir.exists());

    let cleanup = Cleanup::new(store.clone(), artifacts, Duration::from_secs(14 * 24 * 3600));
    let twenty_days_on = time::now() + TimeDelta::days(20);

    let report = cleanup.run_once(twenty_days_on).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.directories_removed, 1);
    assert!(store.get(job.id).await.unwrap().is_none());
    assert!(!dir.exists());

    let again = cleanup.run_once(twenty_days_on).await.unwrap();
    assert_eq!(again.deleted, 0);
}

#[tokio::test]
async fn cleanup_keeps_records_inside_ttl() {
    let root = tempfile::tempdir().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(DocumentJobStore::in_memory());
    let artifacts = ArtifactStore::new(root.path());
    let job = create_job(store.as_ref(), &artifacts).await;

    let cleanup = Cleanup::new(store.clone(), artifacts, Duration::from_secs(14 * 24 * 3600));
    let report = cleanup.run_once(time::now() + TimeDelta::days(13)).await.unwrap();
    assert_eq!(report.deleted, 0);
    assert!(store.get(job.id).await.unwrap().is_some());
}

#[tokio::test]
async fn cleanup_never_removes_directories_outside_the_data_root() {
    let root = tempfile::tempdir().unwrap();
    let elsewhere = tempfile::tempdir().unwrap();
    std::fs::write(elsewhere.path().join("keep.txt"), b"x").unwrap();
    let store: Arc<dyn JobStore> = Arc::new(DocumentJobStore::in_memory());
    let artifacts = ArtifactStore::new(root.path());
    let paths = JobPaths::in_dir(elsewhere.path(), "input.pdf");
    let job = store
        .create(JobRecord::queued(JobId::new()).with_paths(paths))
        .await
        .unwrap();

    let cleanup = Cleanup::new(store.clone(), artifacts, Duration::from_secs(14 * 24 * 3600));
    let report = cleanup.run_once(time::now() + TimeDelta::days(20)).await.unwrap();

    assert_eq!(report.deleted, 1);
    assert_eq!(report.directories_removed, 0);
    assert_eq!(report.directory_errors, 1);
    assert!(store.get(job.id).await.unwrap().is_none());
    assert!(elsewhere.path().join("keep.txt").exists());
}

#[tokio::test]
async fn gate_bounds_parallel_executions() {
    let root = tempfile::tempdir().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(DocumentJobStore::in_memory());
    let artifacts = ArtifactStore::new(root.path());
    let capacity = 2;
    let overlap = Arc::new(Overlap::default());

    let runner = Arc::new(JobRunner::new(
        store.clone(),
        artifacts.clone(),
        overlap.clone(),
        ConcurrencyGate::new(capacity),
        runner_config(Duration::from_secs(5)),
    ));

    let mut runs = Vec::new();
    for _ in 0..=capacity {
        let job = create_job(store.as_ref(), &artifacts).await;
        let runner = runner.clone();
        runs.push(tokio::spawn(async move {
            runner
                .run(job.id, CancellationToken::new(), RunOptions::default())
                .await
        }));
    }
    for run in runs {
        run.await.unwrap().unwrap();
    }

    assert_eq!(overlap.peak.load(Ordering::SeqCst), capacity);
    assert_eq!(runner.gate().available(), capacity);
}

fn queue_config(root: &std::path::Path) -> JobQueueConfig {
    let mut config = JobQueueConfig {
        data_root: root.to_path_buf(),
        ..JobQueueConfig::default()
    };
    config.queue.poll_interval_secs = 1;
    config.cleanup.enabled = false;
    config
}

fn upload(name: &str, bytes: &[u8]) -> NewJob {
    NewJob {
        file_name: name.to_string(),
        bytes: bytes.to_vec(),
        model: "gpt".to_string(),
        template_token: "invoice-v1".to_string(),
        idempotency_key: None,
    }
}

#[tokio::test]
async fn every_submitted_job_reaches_a_terminal_state() {
    let root = tempfile::tempdir().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory().await.unwrap());
    let queue = JobQueue::start(
        queue_config(root.path()),
        store.clone(),
        Arc::new(Succeeds),
        CancellationToken::new(),
    );

    let mut ids = Vec::new();
    for n in 0..6 {
        let submission = queue
            .submitter()
            .submit(upload("scan.pdf", format!("document {n}").as_bytes()))
            .await
            .unwrap();
        assert_eq!(submission.disposition, Disposition::Created);
        ids.push(submission.job.id);
    }

    for id in ids {
        let job = wait_for(store.as_ref(), id, |j| j.status.is_terminal()).await;
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(root.path().join(id.simple()).join("input.pdf").exists());
        assert!(root.path().join(id.simple()).join("manifest.json").exists());
    }
    assert_eq!(store.count_pending().await.unwrap(), 0);
    assert!(queue.readiness().await.ready);

    queue.shutdown().await;
}

#[tokio::test]
async fn duplicate_submissions_return_the_existing_job() {
    let root = tempfile::tempdir().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(DocumentJobStore::in_memory());
    let queue = JobQueue::start(
        queue_config(root.path()),
        store,
        Arc::new(UntilCancelled),
        CancellationToken::new(),
    );
    let submitter = queue.submitter();

    let first = submitter.submit(upload("a.pdf", b"same bytes")).await.unwrap();
    let again = submitter.submit(upload("b.pdf", b"same bytes")).await.unwrap();
    assert_eq!(again.disposition, Disposition::HashHit);
    assert_eq!(again.job.id, first.job.id);

    let keyed = NewJob {
        idempotency_key: Some("req-42".to_string()),
        ..upload("c.pdf", b"other bytes")
    };
    let created = submitter.submit(keyed.clone()).await.unwrap();
    let replay = submitter
        .submit(NewJob {
            bytes: b"different again".to_vec(),
            ..keyed
        })
        .await
        .unwrap();
    assert_eq!(replay.disposition, Disposition::IdempotencyHit);
    assert_eq!(replay.job.id, created.job.id);

    queue.shutdown().await;
}

#[tokio::test]
async fn invalid_uploads_are_rejected() {
    let root = tempfile::tempdir().unwrap();
    let mut config = queue_config(root.path());
    config.upload.max_request_body_mb = 1;
    let queue = JobQueue::start(
        config,
        Arc::new(DocumentJobStore::in_memory()),
        Arc::new(Succeeds),
        CancellationToken::new(),
    );
    let submitter = queue.submitter();

    assert!(matches!(
        submitter.submit(upload("a.pdf", b"")).await,
        Err(SubmitError::Validation(_))
    ));
    assert!(matches!(
        submitter.submit(upload("a.docx", b"bytes")).await,
        Err(SubmitError::UnsupportedFileType(_))
    ));
    assert!(matches!(
        submitter.submit(upload("a.pdf", &vec![0u8; 2 * 1024 * 1024])).await,
        Err(SubmitError::PayloadTooLarge { .. })
    ));
    assert!(matches!(
        submitter.submit_immediate(upload("a.pdf", b"bytes")).await,
        Err(SubmitError::ImmediateDisabled)
    ));

    queue.shutdown().await;
}

#[tokio::test]
async fn failed_submission_leaves_no_directory_behind() {
    let root = tempfile::tempdir().unwrap();
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteJobStore::with_pool(pool.clone()).await.unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_inserts BEFORE INSERT ON jobs \
         BEGIN SELECT RAISE(ABORT, 'inserts disabled'); END",
    )
    .execute(&pool)
    .await
    .unwrap();

    let queue = JobQueue::start(
        queue_config(root.path()),
        Arc::new(store),
        Arc::new(Succeeds),
        CancellationToken::new(),
    );
    let err = queue
        .submitter()
        .submit(upload("a.pdf", b"%PDF-1.7"))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Store(_)));

    let left: Vec<_> = std::fs::read_dir(root.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_dir())
        .collect();
    assert!(left.is_empty(), "orphaned job directories: {left:?}");

    queue.shutdown().await;
}

#[tokio::test]
async fn submission_writes_every_assigned_input_artifact() {
    let root = tempfile::tempdir().unwrap();
    let queue = JobQueue::start(
        queue_config(root.path()),
        Arc::new(DocumentJobStore::in_memory()),
        Arc::new(UntilCancelled),
        CancellationToken::new(),
    );
    let job = queue
        .submitter()
        .submit(upload("a.pdf", b"%PDF-1.7"))
        .await
        .unwrap()
        .job;

    let input = job.paths.input.clone().unwrap();
    let prompt = job.paths.prompt.clone().unwrap();
    assert!(input.path.is_file());
    assert!(input.created_at.is_some());
    assert!(prompt.created_at.is_some());
    let text = tokio::fs::read_to_string(&prompt.path).await.unwrap();
    assert!(text.contains("invoice-v1"));
    assert!(text.contains("gpt"));

    queue.shutdown().await;
}

#[tokio::test]
async fn full_queue_applies_backpressure() {
    let root = tempfile::tempdir().unwrap();
    let mut config = queue_config(root.path());
    config.queue.max_queue_length = 2;
    let queue = JobQueue::start(
        config,
        Arc::new(DocumentJobStore::in_memory()),
        Arc::new(UntilCancelled),
        CancellationToken::new(),
    );
    let submitter = queue.submitter();

    submitter.submit(upload("a.pdf", b"one")).await.unwrap();
    submitter.submit(upload("b.pdf", b"two")).await.unwrap();
    let err = submitter.submit(upload("c.pdf", b"three")).await.unwrap_err();
    assert!(matches!(
        err,
        SubmitError::QueueFull {
            retry_after_secs: 60
        }
    ));

    queue.shutdown().await;
}

#[tokio::test]
async fn immediate_submission_runs_inline() {
    let root = tempfile::tempdir().unwrap();
    let mut config = queue_config(root.path());
    config.immediate.enabled = true;
    let queue = JobQueue::start(
        config,
        Arc::new(DocumentJobStore::in_memory()),
        Arc::new(Succeeds),
        CancellationToken::new(),
    );

    let done = queue
        .submitter()
        .submit_immediate(upload("scan.png", b"png bytes"))
        .await
        .unwrap();
    assert!(done.ran_inline);
    assert!(done.job.immediate);
    assert_eq!(done.job.status, JobStatus::Succeeded);

    queue.shutdown().await;
}

#[tokio::test]
async fn cancelling_a_running_job() {
    let root = tempfile::tempdir().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(DocumentJobStore::in_memory());
    let queue = JobQueue::start(
        queue_config(root.path()),
        store.clone(),
        Arc::new(UntilCancelled),
        CancellationToken::new(),
    );

    let job = queue
        .submitter()
        .submit(upload("a.pdf", b"slow document"))
        .await
        .unwrap()
        .job;
    wait_for(store.as_ref(), job.id, |j| j.status == JobStatus::Running).await;

    let cancelled = queue.cancel(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.error_message.as_deref(), Some(CANCELLED_BY_USER));

    let runner = queue.runner();
    tokio::time::timeout(Duration::from_secs(5), async {
        while runner.is_running(job.id) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    let settled = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(settled.status, JobStatus::Cancelled);

    assert!(matches!(
        queue.cancel(job.id).await,
        Err(SubmitError::Conflict {
            status: JobStatus::Cancelled,
            ..
        })
    ));
    assert!(matches!(
        queue.cancel(JobId::new()).await,
        Err(SubmitError::NotFound(_))
    ));

    queue.shutdown().await;
}
