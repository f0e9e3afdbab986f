//! Status - ジョブ状態の問い合わせ口
//!
//! transport 層（MCP / HTTP など）から呼ばれる薄い窓口。
//! 中身は JobManager への委譲で、ここでは入力の解釈だけを行う。

use std::sync::Arc;

use tracing::info;

use crate::domain::{Job, JobId, JobStatus};
use crate::error::SpillwayError;
use crate::jobs::{JobFilter, JobManager, JobPage};
use crate::observability::JobCounts;

/// StatusService は JobManager の読み取り / キャンセル API を公開
///
/// # 使用例
/// ```ignore
/// let page = app.status.list_jobs(Some("processing"), 20, 0).await?;
/// for job in page.jobs {
///     println!("{} {}", job.id, job.status);
/// }
/// ```
#[derive(Clone)]
pub struct StatusService {
    jobs: Arc<JobManager>,
}

impl StatusService {
    pub fn new(jobs: Arc<JobManager>) -> Self {
        Self { jobs }
    }

    /// Current snapshot of one job. Expired jobs are gone (`JobNotFound`).
    pub async fn get_status(&self, id: JobId) -> Result<Job, SpillwayError> {
        self.jobs.get(id).await
    }

    /// Jobs newest first. `status_filter` takes the lowercase status names.
    pub async fn list_jobs(
        &self,
        status_filter: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<JobPage, SpillwayError> {
        let status = status_filter
            .map(|raw| raw.trim().to_ascii_lowercase().parse::<JobStatus>())
            .transpose()?;
        Ok(self
            .jobs
            .list(&JobFilter {
                status,
                limit,
                offset,
            })
            .await)
    }

    /// Cancel a job that has not finished yet.
    pub async fn cancel(&self, id: JobId, reason: Option<&str>) -> Result<Job, SpillwayError> {
        let job = self.jobs.cancel(id, reason.map(str::to_string)).await?;
        info!(job_id = %id, reason = reason.unwrap_or(""), "job cancelled on request");
        Ok(job)
    }

    pub async fn counts(&self) -> JobCounts {
        self.jobs.counts().await
    }
}
