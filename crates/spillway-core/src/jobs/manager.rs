//! JobManager - ジョブのライフサイクル管理
//!
//! # ロック
//! - map 全体: `RwLock`（作成 / 削除のみ write）
//! - ジョブ単位: `Mutex`（フィールド変更はこちら）
//!
//! ジョブの Mutex を握ったまま map のロックを取らない（順序は map → job のみ）。
//!
//! # 保持期間
//! 終端状態で `updated_at` から `retention` を過ぎたジョブは `sweep` で削除。
//! `get` / `list` のたびに sweep が走る（lazy cleanup）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::{
    Job, JobError, JobId, JobRequest, JobResult, JobStatus, ProgressUpdate, TransitionError,
};
use crate::error::SpillwayError;
use crate::observability::JobCounts;
use crate::ports::{Clock, IdGenerator};

pub const DEFAULT_LIST_LIMIT: usize = 50;

/// `list` の条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

/// One page of `list`, most recently updated first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Matches before pagination.
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

fn refused(job_id: JobId, e: TransitionError) -> SpillwayError {
    match e {
        TransitionError::AlreadyTerminal(status) => SpillwayError::JobAlreadyTerminal { job_id, status },
        TransitionError::Invalid { from, to } => SpillwayError::InvalidTransition { job_id, from, to },
    }
}

struct JobEntry {
    job: Mutex<Job>,
    cancel: CancellationToken,
}

pub struct JobManager {
    jobs: RwLock<HashMap<JobId, Arc<JobEntry>>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    retention: TimeDelta,
}

impl JobManager {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>, retention: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
            ids,
            retention: TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Register a new job in Accepted.
    pub async fn create(&self, request: JobRequest) -> JobId {
        self.create_with_id(self.next_id(), request).await
    }

    /// Draw an id ahead of [`create_with_id`](Self::create_with_id), so the
    /// destination can be named after the job.
    pub(crate) fn next_id(&self) -> JobId {
        self.ids.generate_job_id()
    }

    /// `id` must come from [`next_id`](Self::next_id).
    pub(crate) async fn create_with_id(&self, id: JobId, request: JobRequest) -> JobId {
        let job = Job::new(id, request, self.clock.now());
        info!(
            job_id = %id,
            operation = %job.request.operation.name,
            destination = %job.request.destination.display(),
            "job accepted"
        );
        let entry = Arc::new(JobEntry {
            job: Mutex::new(job),
            cancel: CancellationToken::new(),
        });
        self.jobs.write().await.insert(id, entry);
        id
    }

    async fn entry(&self, id: JobId) -> Result<Arc<JobEntry>, SpillwayError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SpillwayError::JobNotFound(id))
    }

    /// Run `f` under the job's lock; a refused transition becomes the
    /// matching `SpillwayError` and leaves the record untouched.
    async fn with_job<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Job, DateTime<Utc>) -> Result<T, TransitionError>,
    ) -> Result<T, SpillwayError> {
        let entry = self.entry(id).await?;
        let mut job = entry.job.lock().await;
        let now = self.clock.now();
        f(&mut job, now).map_err(|e| refused(id, e))
    }

    pub async fn mark_processing(&self, id: JobId) -> Result<(), SpillwayError> {
        self.with_job(id, |job, now| job.mark_processing(now)).await?;
        info!(job_id = %id, "job processing");
        Ok(())
    }

    pub async fn update_progress(&self, id: JobId, update: ProgressUpdate) -> Result<(), SpillwayError> {
        self.with_job(id, |job, now| job.apply_progress(update, now))
            .await?;
        debug!(
            job_id = %id,
            rows = update.rows_fetched,
            bytes = update.bytes_written,
            "job progress"
        );
        Ok(())
    }

    /// Record a scheduled retry while the job keeps Processing.
    pub async fn note_retry(&self, id: JobId, error: JobError) -> Result<(), SpillwayError> {
        self.with_job(id, |job, now| job.note_retry(error, now)).await
    }

    pub async fn complete(&self, id: JobId, result: JobResult) -> Result<(), SpillwayError> {
        let rows = result.rows_written;
        self.with_job(id, |job, now| job.complete(result, now)).await?;
        info!(job_id = %id, rows, "job completed");
        Ok(())
    }

    pub async fn fail(&self, id: JobId, error: JobError) -> Result<(), SpillwayError> {
        let kind = error.kind;
        let retry_count = error.retry_count;
        self.with_job(id, |job, now| job.fail(error, now)).await?;
        info!(job_id = %id, %kind, retry_count, "job failed");
        Ok(())
    }

    /// Accepted | Processing -> Cancelled, then signal the job's token so the
    /// worker stops at its next boundary.
    pub async fn cancel(&self, id: JobId, reason: Option<String>) -> Result<Job, SpillwayError> {
        let entry = self.entry(id).await?;
        let snapshot = {
            let mut job = entry.job.lock().await;
            let now = self.clock.now();
            job.cancel(reason, now).map_err(|e| refused(id, e))?;
            job.clone()
        };
        entry.cancel.cancel();
        info!(job_id = %id, reason = ?snapshot.cancel_reason, "job cancelled");
        Ok(snapshot)
    }

    /// Token that fires when the job is cancelled.
    pub async fn cancellation_token(&self, id: JobId) -> Result<CancellationToken, SpillwayError> {
        Ok(self.entry(id).await?.cancel.clone())
    }

    pub async fn get(&self, id: JobId) -> Result<Job, SpillwayError> {
        self.sweep().await;
        let entry = self.entry(id).await?;
        let job = entry.job.lock().await;
        Ok(job.clone())
    }

    pub async fn list(&self, filter: &JobFilter) -> JobPage {
        self.sweep().await;
        let entries: Vec<Arc<JobEntry>> = self.jobs.read().await.values().cloned().collect();

        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            let job = entry.job.lock().await;
            if filter.status.is_none_or(|s| s == job.status) {
                jobs.push(job.clone());
            }
        }
        jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| b.id.cmp(&a.id)));

        let total = jobs.len();
        let jobs = jobs
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect();
        JobPage {
            jobs,
            total,
            limit: filter.limit,
            offset: filter.offset,
        }
    }

    /// Evict terminal jobs whose `updated_at` is older than the retention
    /// window. Returns the number evicted.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let retention = self.retention;
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, entry| {
            // a locked job is being mutated, so it is not stale
            match entry.job.try_lock() {
                Ok(job) => !(job.is_terminal() && now - job.updated_at > retention),
                Err(_) => true,
            }
        });
        let evicted = before - jobs.len();
        if evicted > 0 {
            info!(evicted, remaining = jobs.len(), "expired jobs evicted");
        }
        evicted
    }

    pub async fn counts(&self) -> JobCounts {
        let entries: Vec<Arc<JobEntry>> = self.jobs.read().await.values().cloned().collect();
        let mut counts = JobCounts::default();
        for entry in entries {
            counts.add(entry.job.lock().await.status);
        }
        counts
    }

    /// Number of records currently held (expired ones included until swept).
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
