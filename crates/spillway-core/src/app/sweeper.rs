//! Sweeper - 保持期間を過ぎた終端ジョブの定期回収
//!
//! `get` / `list` でも遅延 sweep は走るので、これは問い合わせが無い間に
//! メモリを返すためのもの。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::jobs::JobManager;

/// Sweeper handle.
/// - `stop()` で止めて join する
pub struct Sweeper {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl Sweeper {
    /// Sweep `jobs` every `interval`. The first sweep happens one interval after spawn.
    pub fn spawn(jobs: Arc<JobManager>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            sweep_loop(jobs, interval, &mut shutdown_rx).await;
        });
        Self { shutdown_tx, join }
    }

    pub async fn stop(self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

async fn sweep_loop(jobs: Arc<JobManager>, interval: Duration, shutdown_rx: &mut watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    // interval の最初の tick は即時なので捨てる
    ticker.tick().await;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender が落ちたら終了
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        // 回収があれば JobManager 側が info を出す
        if jobs.sweep().await == 0 {
            debug!("sweep found nothing to evict");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FetchOperation, JobError, JobErrorKind, JobRequest, OutputFormat};
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    fn request() -> JobRequest {
        JobRequest {
            operation: FetchOperation::new("series_observations", serde_json::json!({})),
            destination: PathBuf::from("/tmp/unused.csv"),
            format: OutputFormat::Csv,
            estimated_rows: None,
        }
    }

    fn manager() -> (Arc<JobManager>, FixedClock) {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
        let jobs = Arc::new(JobManager::new(
            Arc::new(clock.clone()),
            Arc::new(UlidGenerator::new(clock.clone())),
            Duration::from_secs(3_600),
        ));
        (jobs, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_expired_jobs_without_queries() {
        let (jobs, clock) = manager();
        let done = jobs.create(request()).await;
        jobs.mark_processing(done).await.unwrap();
        jobs.fail(done, JobError::new(JobErrorKind::WriteFailure, "disk full")).await.unwrap();
        let running = jobs.create(request()).await;
        jobs.mark_processing(running).await.unwrap();

        let sweeper = Sweeper::spawn(Arc::clone(&jobs), Duration::from_secs(60));
        clock.advance(chrono::Duration::hours(2));
        tokio::time::sleep(Duration::from_secs(61)).await;

        // len() does not sweep, so only the loop can have evicted `done`
        assert_eq!(jobs.len().await, 1);
        sweeper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_returns_promptly() {
        let (jobs, _clock) = manager();
        let sweeper = Sweeper::spawn(jobs, Duration::from_secs(3_600));
        tokio::time::timeout(Duration::from_secs(1), sweeper.stop())
            .await
            .unwrap();
    }
}
