//! Background execution of accepted jobs.
//!
//! - `JobIntake`: bounded FIFO of job ids (router → workers)
//! - `BackgroundWorker`: runs one job (fetch pages → sink → progress → result)
//! - `WorkerGroup`: N worker tasks sharing the intake, with graceful shutdown

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fetch::{PageFetchError, PagedFetch, RetryNotice, RetryObserver};
use crate::domain::{
    JobError, JobErrorKind, JobId, JobRequest, JobResult, JobStatus, PageCursor, ProgressUpdate,
};
use crate::error::SpillwayError;
use crate::jobs::JobManager;
use crate::writer::{StreamingWriter, WriteFailure, WriteSummary};

/// Sending side of the intake queue; cheap to clone.
#[derive(Debug, Clone)]
pub struct JobIntake {
    tx: mpsc::Sender<JobId>,
}

impl JobIntake {
    /// A new intake of `capacity` slots and its receiving side.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<JobId>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue without waiting.
    pub fn submit(&self, id: JobId) -> Result<(), SpillwayError> {
        self.tx.try_send(id).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SpillwayError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SpillwayError::ShuttingDown,
        })
    }
}

/// ジョブ 1 件の実行中に発生した retry を JobManager に記録する
struct JobRetryRecorder {
    jobs: Arc<JobManager>,
    id: JobId,
    total: AtomicU32,
}

#[async_trait]
impl RetryObserver for JobRetryRecorder {
    async fn on_retry(&self, notice: &RetryNotice) {
        let total = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        let next_at = self.jobs.now() + chrono::Duration::from_std(notice.delay).unwrap_or(chrono::Duration::zero());
        let error = JobError::new(notice.error.job_error_kind(), notice.error.to_string())
            .with_retry_count(total)
            .with_next_retry_at(next_at);
        if let Err(e) = self.jobs.note_retry(self.id, error).await {
            debug!(job_id = %self.id, error = %e, "retry not recorded");
        }
    }
}

/// How an execution ended short of a result.
enum Stop {
    Cancelled,
    Shutdown,
    Deadline(Duration),
    Fetch(PageFetchError),
    Write(WriteFailure),
}

impl From<WriteFailure> for Stop {
    fn from(e: WriteFailure) -> Self {
        Stop::Write(e)
    }
}

/// Executes jobs. Shared by every task of a [`WorkerGroup`].
pub struct BackgroundWorker {
    jobs: Arc<JobManager>,
    fetch: PagedFetch,
    writer: StreamingWriter,
    job_deadline: Option<Duration>,
}

impl BackgroundWorker {
    pub fn new(
        jobs: Arc<JobManager>,
        fetch: PagedFetch,
        writer: StreamingWriter,
        job_deadline: Option<Duration>,
    ) -> Self {
        Self {
            jobs,
            fetch,
            writer,
            job_deadline,
        }
    }

    /// Run job `id` to a terminal state (or leave it to the canceller).
    ///
    /// `abort` fires on forced shutdown; the job then fails with
    /// `ShutdownInterrupted`.
    pub async fn run_job(&self, id: JobId, abort: &CancellationToken) {
        let job = match self.jobs.get(id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %id, error = %e, "queued job vanished");
                return;
            }
        };
        if job.status != JobStatus::Accepted {
            debug!(job_id = %id, status = %job.status, "skipping job that is no longer accepted");
            return;
        }
        // cancel may win the race between `get` and here
        if let Err(e) = self.jobs.mark_processing(id).await {
            debug!(job_id = %id, error = %e, "job not started");
            return;
        }
        let token = match self.jobs.cancellation_token(id).await {
            Ok(token) => token,
            Err(e) => {
                warn!(job_id = %id, error = %e, "job vanished while starting");
                return;
            }
        };

        let recorder = JobRetryRecorder {
            jobs: Arc::clone(&self.jobs),
            id,
            total: AtomicU32::new(0),
        };
        let outcome = self.execute(id, &job.request, &token, abort, &recorder).await;
        let retries = recorder.total.load(Ordering::SeqCst);

        let reported = match outcome {
            Ok(summary) => {
                let result = JobResult {
                    location: summary.location,
                    rows_written: summary.rows_written,
                    bytes_written: summary.bytes_written,
                    format: job.request.format,
                };
                self.jobs.complete(id, result).await
            }
            Err(Stop::Cancelled) => {
                info!(job_id = %id, "job stopped after cancellation");
                return;
            }
            Err(Stop::Shutdown) => {
                warn!(job_id = %id, "job interrupted by shutdown");
                let error = JobError::new(JobErrorKind::ShutdownInterrupted, "worker shut down before the job finished")
                    .with_retry_count(retries);
                self.jobs.fail(id, error).await
            }
            Err(Stop::Deadline(limit)) => {
                let error = JobError::new(
                    JobErrorKind::DeadlineExceeded,
                    format!("job exceeded its {}s deadline", limit.as_secs_f64()),
                )
                .with_retry_count(retries);
                self.jobs.fail(id, error).await
            }
            Err(Stop::Fetch(PageFetchError::Cancelled)) => {
                // only reachable through the job token
                info!(job_id = %id, "job stopped after cancellation");
                return;
            }
            Err(Stop::Fetch(PageFetchError::Failed { error, .. })) => {
                let failure = JobError::new(error.job_error_kind(), error.to_string())
                    .with_retry_count(retries);
                self.jobs.fail(id, failure).await
            }
            Err(Stop::Write(failure)) => {
                error!(job_id = %id, error = %failure, "write failed");
                let error = JobError::new(JobErrorKind::WriteFailure, failure.to_string())
                    .with_retry_count(retries);
                self.jobs.fail(id, error).await
            }
        };

        if let Err(e) = reported {
            // typically a cancel that landed after the last boundary
            debug!(job_id = %id, error = %e, "final transition refused");
        }
    }

    async fn execute(
        &self,
        id: JobId,
        request: &JobRequest,
        token: &CancellationToken,
        abort: &CancellationToken,
        recorder: &JobRetryRecorder,
    ) -> Result<WriteSummary, Stop> {
        let started = Instant::now();
        let mut sink = self.writer.open(&request.destination, request.format)?;
        let mut cursor: Option<PageCursor> = None;
        let mut progress = ProgressUpdate {
            estimated_total: request.estimated_rows,
            ..ProgressUpdate::default()
        };

        loop {
            // page boundary
            if token.is_cancelled() {
                sink.abort();
                return Err(Stop::Cancelled);
            }
            if abort.is_cancelled() {
                sink.abort();
                return Err(Stop::Shutdown);
            }
            if let Some(limit) = self.job_deadline {
                if started.elapsed() > limit {
                    sink.abort();
                    return Err(Stop::Deadline(limit));
                }
            }

            let fetched = tokio::select! {
                r = self.fetch.fetch_page(&request.operation, cursor.as_ref(), Some(token), recorder) => r,
                _ = abort.cancelled() => {
                    sink.abort();
                    return Err(Stop::Shutdown);
                }
            };
            let page = match fetched {
                Ok(page) => page,
                Err(e) => {
                    sink.abort();
                    return Err(Stop::Fetch(e));
                }
            };

            progress.pages_fetched += 1;
            if page.total_count.is_some() {
                progress.estimated_total = page.total_count;
            }
            for record in &page.records {
                progress.rows_fetched += 1;
                if let Some(flushed) = sink.push(record)? {
                    progress.bytes_written = flushed.bytes_written;
                    self.report(id, progress).await;
                }
            }
            self.report(id, progress).await;

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let summary = sink.finish()?;
        debug!(
            job_id = %id,
            rows = summary.rows_written,
            bytes = summary.bytes_written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job output persisted"
        );
        Ok(summary)
    }

    async fn report(&self, id: JobId, progress: ProgressUpdate) {
        if let Err(e) = self.jobs.update_progress(id, progress).await {
            // cancelled meanwhile; the next boundary stops the run
            debug!(job_id = %id, error = %e, "progress not recorded");
        }
    }

    /// Fail a job that was queued but never started.
    async fn interrupt_queued(&self, id: JobId) -> bool {
        if self.jobs.mark_processing(id).await.is_err() {
            // cancelled while queued
            return false;
        }
        let error = JobError::new(
            JobErrorKind::ShutdownInterrupted,
            "worker shut down before the job started",
        );
        self.jobs.fail(id, error).await.is_ok()
    }
}

/// What `shutdown_and_join` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// All workers finished within the grace period.
    pub graceful: bool,
    /// Queued (never started) jobs moved to Failed.
    pub interrupted_queued: usize,
}

/// Worker group handle.
/// - `request_shutdown` で新しいジョブの取得を止める
/// - `shutdown_and_join` で intake を閉じ、猶予期間だけ実行中ジョブを待つ
pub struct WorkerGroup {
    intake: JobIntake,
    rx: Arc<Mutex<mpsc::Receiver<JobId>>>,
    worker: Arc<BackgroundWorker>,
    shutdown_tx: watch::Sender<bool>,
    abort: CancellationToken,
    joins: JoinSet<()>,
    grace: Duration,
}

impl WorkerGroup {
    /// Spawn `n` workers over an intake of `capacity` slots.
    pub fn spawn(n: usize, capacity: usize, worker: BackgroundWorker, grace: Duration) -> Self {
        let (intake, rx) = JobIntake::bounded(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let worker = Arc::new(worker);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let abort = CancellationToken::new();

        let mut joins = JoinSet::new();
        for worker_id in 0..n.max(1) {
            let rx = Arc::clone(&rx);
            let w = Arc::clone(&worker);
            let abort = abort.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            joins.spawn(async move {
                worker_loop(worker_id, rx, w, abort, &mut shutdown_rx).await;
            });
        }
        info!(workers = n.max(1), capacity, "worker group started");

        Self {
            intake,
            rx,
            worker,
            shutdown_tx,
            abort,
            joins,
            grace,
        }
    }

    pub fn intake(&self) -> JobIntake {
        self.intake.clone()
    }

    /// Stop taking new jobs. In-flight jobs keep running.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    ///
    /// 1. workers stop taking jobs
    /// 2. intake closes; queued jobs → Failed(ShutdownInterrupted)
    /// 3. in-flight jobs get `grace` to finish, then are aborted at their next
    ///    await point and fail with ShutdownInterrupted
    pub async fn shutdown_and_join(mut self) -> ShutdownReport {
        self.request_shutdown();

        let mut interrupted_queued = 0;
        {
            let mut rx = self.rx.lock().await;
            rx.close();
            while let Ok(id) = rx.try_recv() {
                if self.worker.interrupt_queued(id).await {
                    interrupted_queued += 1;
                }
            }
        }

        let joins = &mut self.joins;
        let graceful = tokio::time::timeout(self.grace, async {
            while joins.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !graceful {
            warn!(
                grace_ms = self.grace.as_millis() as u64,
                "grace period over; aborting in-flight jobs"
            );
            self.abort.cancel();
            while self.joins.join_next().await.is_some() {}
        }

        info!(graceful, interrupted_queued, "worker group stopped");
        ShutdownReport {
            graceful,
            interrupted_queued,
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<JobId>>>,
    worker: Arc<BackgroundWorker>,
    abort: CancellationToken,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        // shutdown が来ていたら抜ける
        if *shutdown_rx.borrow() {
            break;
        }

        // recv は待つので select で shutdown と競合させる
        let next = tokio::select! {
            changed = shutdown_rx.changed() => {
                // group が drop された
                if changed.is_err() {
                    break;
                }
                // 変更が入ったら次のループで判定
                continue;
            }
            id = async { rx.lock().await.recv().await } => id,
        };

        let Some(id) = next else {
            // intake closed
            break;
        };

        debug!(worker_id, job_id = %id, "job picked up");
        worker.run_job(id, &abort).await;
    }
    debug!(worker_id, "worker stopped");
}
