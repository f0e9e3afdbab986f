//! PagedFetch - 1 ページ分の取得（permit → timeout → retry ループ）
//!
//! router（同期パス）と worker（ジョブ）の両方がこれを使う。
//!
//! # フロー（1 attempt）
//! 1. RateLimiter から permit を取る（窓が埋まっていれば少し待つ / circuit open なら Retryable）
//! 2. `attempt_timeout` 付きで Fetcher を呼ぶ
//! 3. 結果を `AttemptOutcome` に分類し、permit に成否を記録
//!
//! Retryable なら RetryPolicy の delay だけ眠って再試行。キャンセルは
//! attempt の前と sleep の前（と sleep 中）に確認する。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::retry::RetryPolicy;
use crate::config::Settings;
use crate::domain::{AttemptOutcome, ErrorClass, FetchOperation, JobErrorKind, PageCursor};
use crate::error::SpillwayError;
use crate::limiter::{LimitError, RateLimiter};
use crate::ports::{FetchError, Fetcher, Page};

/// Failure of a single attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Limit(#[from] LimitError),
}

impl AttemptError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AttemptError::Fetch(e) => e.class(),
            AttemptError::Limit(e) => e.class(),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AttemptError::Fetch(e) => e.retry_after(),
            AttemptError::Limit(e) => Some(e.retry_after()),
        }
    }

    /// How the failure shows up on a job.
    pub fn job_error_kind(&self) -> JobErrorKind {
        match self {
            AttemptError::Limit(LimitError::CircuitOpen { .. }) => JobErrorKind::CircuitOpen,
            AttemptError::Limit(LimitError::RateLimited { .. }) => JobErrorKind::RateLimited,
            AttemptError::Fetch(e) => match e.class() {
                ErrorClass::RateLimit => JobErrorKind::RateLimited,
                ErrorClass::Transient => JobErrorKind::TransientFetch,
                ErrorClass::Permanent => JobErrorKind::PermanentFetch,
            },
        }
    }

    fn into_outcome<T>(self) -> AttemptOutcome<T, AttemptError> {
        let class = self.class();
        if class.is_retryable() {
            AttemptOutcome::Retryable {
                retry_after: self.retry_after(),
                error: self,
                class,
            }
        } else {
            AttemptOutcome::Fatal(self)
        }
    }
}

impl From<AttemptError> for SpillwayError {
    fn from(e: AttemptError) -> Self {
        match e {
            AttemptError::Fetch(e) => SpillwayError::Fetch(e),
            AttemptError::Limit(e) => SpillwayError::Limit(e),
        }
    }
}

/// Why `fetch_page` gave up.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PageFetchError {
    #[error("{error} (after {retries} retries)")]
    Failed { error: AttemptError, retries: u32 },

    #[error("cancelled")]
    Cancelled,
}

impl From<PageFetchError> for SpillwayError {
    fn from(e: PageFetchError) -> Self {
        match e {
            PageFetchError::Failed { error, .. } => error.into(),
            PageFetchError::Cancelled => SpillwayError::Cancelled,
        }
    }
}

/// One scheduled retry.
#[derive(Debug, Clone)]
pub struct RetryNotice {
    /// Retry number for the current page (1-indexed).
    pub retry: u32,
    pub class: ErrorClass,
    pub delay: Duration,
    pub error: AttemptError,
}

/// 再試行の通知先（worker はこれでジョブに retry を記録する）
#[async_trait]
pub trait RetryObserver: Send + Sync {
    async fn on_retry(&self, notice: &RetryNotice);
}

/// Observer that ignores notices.
pub struct NoopObserver;

#[async_trait]
impl RetryObserver for NoopObserver {
    async fn on_retry(&self, _notice: &RetryNotice) {}
}

#[derive(Clone)]
pub struct PagedFetch {
    fetcher: Arc<dyn Fetcher>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    acquire_wait: Duration,
}

impl PagedFetch {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        attempt_timeout: Duration,
        acquire_wait: Duration,
    ) -> Self {
        Self {
            fetcher,
            limiter,
            policy,
            attempt_timeout,
            acquire_wait,
        }
    }

    pub fn from_settings(fetcher: Arc<dyn Fetcher>, limiter: Arc<RateLimiter>, settings: &Settings) -> Self {
        Self::new(
            fetcher,
            limiter,
            RetryPolicy::from_settings(&settings.retry),
            settings.retry.attempt_timeout,
            settings.rate_limit.acquire_wait,
        )
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// One attempt: permit, timed call, classification.
    async fn attempt(
        &self,
        operation: &FetchOperation,
        cursor: Option<&PageCursor>,
    ) -> AttemptOutcome<Page, AttemptError> {
        let permit = match self.limiter.acquire_wait(self.acquire_wait).await {
            Ok(permit) => permit,
            Err(e) => return AttemptError::from(e).into_outcome(),
        };

        match tokio::time::timeout(self.attempt_timeout, self.fetcher.fetch(operation, cursor)).await {
            Ok(Ok(page)) => {
                permit.record(true);
                AttemptOutcome::Success(page)
            }
            Ok(Err(e)) => {
                // a rejected request says nothing about provider health
                permit.record(!e.class().is_retryable());
                AttemptError::from(e).into_outcome()
            }
            Err(_) => {
                permit.record(false);
                AttemptError::from(FetchError::Timeout(self.attempt_timeout)).into_outcome()
            }
        }
    }

    /// Fetch one page, retrying per policy.
    ///
    /// `cancel` is checked before every attempt and before (and during) every
    /// retry sleep.
    pub async fn fetch_page(
        &self,
        operation: &FetchOperation,
        cursor: Option<&PageCursor>,
        cancel: Option<&CancellationToken>,
        observer: &dyn RetryObserver,
    ) -> Result<Page, PageFetchError> {
        let cancelled = || cancel.is_some_and(|t| t.is_cancelled());
        let mut retries = 0u32;

        loop {
            if cancelled() {
                return Err(PageFetchError::Cancelled);
            }

            let (error, class, retry_after) = match self.attempt(operation, cursor).await {
                AttemptOutcome::Success(page) => {
                    debug!(
                        operation = %operation.name,
                        records = page.records.len(),
                        retries,
                        "page fetched"
                    );
                    return Ok(page);
                }
                AttemptOutcome::Fatal(error) => {
                    return Err(PageFetchError::Failed { error, retries });
                }
                AttemptOutcome::Retryable {
                    error,
                    class,
                    retry_after,
                } => (error, class, retry_after),
            };

            let retry = retries + 1;
            if !self.policy.allows(class, retry) {
                warn!(
                    operation = %operation.name,
                    ?class,
                    retries,
                    error = %error,
                    "retries exhausted"
                );
                return Err(PageFetchError::Failed { error, retries });
            }
            retries = retry;

            let delay = self.policy.next_delay(retry, retry_after);
            warn!(
                operation = %operation.name,
                attempt = retry,
                ?class,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying"
            );
            let notice = RetryNotice {
                retry,
                class,
                delay,
                error,
            };
            observer.on_retry(&notice).await;

            if cancelled() {
                return Err(PageFetchError::Cancelled);
            }
            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(PageFetchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitSettings;
    use crate::impls::MemoryFetcher;
    use std::sync::Mutex;

    fn op() -> FetchOperation {
        FetchOperation::new("series_observations", serde_json::json!({}))
    }

    fn paged(fetcher: MemoryFetcher) -> PagedFetch {
        PagedFetch::new(
            Arc::new(fetcher),
            Arc::new(RateLimiter::new(RateLimitSettings {
                failure_threshold: 100,
                ..RateLimitSettings::default()
            })),
            RetryPolicy::default(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(u32, Duration)>>);

    #[async_trait]
    impl RetryObserver for Recorder {
        async fn on_retry(&self, notice: &RetryNotice) {
            self.0.lock().unwrap().push((notice.retry, notice.delay));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let pf = paged(MemoryFetcher::synthetic(3, 10).fail_next(FetchError::Server {
            status: 503,
            message: "unavailable".into(),
        }));
        let recorder = Recorder::default();
        let page = pf.fetch_page(&op(), None, None, &recorder).await.unwrap();
        assert_eq!(page.records.len(), 3);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let fetcher = Arc::new(MemoryFetcher::synthetic(3, 10).fail_always(FetchError::NotFound("GDP".into())));
        let pf = PagedFetch::new(
            fetcher.clone(),
            Arc::new(RateLimiter::new(RateLimitSettings::default())),
            RetryPolicy::default(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        );
        let err = pf.fetch_page(&op(), None, None, &NoopObserver).await.unwrap_err();
        assert!(matches!(
            err,
            PageFetchError::Failed {
                error: AttemptError::Fetch(FetchError::NotFound(_)),
                retries: 0
            }
        ));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_retries_up_to_cap_with_growing_delay() {
        let fetcher = Arc::new(
            MemoryFetcher::synthetic(3, 10).fail_always(FetchError::RateLimited { retry_after: None }),
        );
        let pf = PagedFetch::new(
            fetcher.clone(),
            Arc::new(RateLimiter::new(RateLimitSettings {
                failure_threshold: 100,
                ..RateLimitSettings::default()
            })),
            RetryPolicy {
                jitter: 0.0,
                ..RetryPolicy::default()
            },
            Duration::from_secs(30),
            Duration::from_secs(5),
        );
        let recorder = Recorder::default();
        let err = pf.fetch_page(&op(), None, None, &recorder).await.unwrap_err();

        assert!(matches!(err, PageFetchError::Failed { retries: 3, .. }));
        assert_eq!(fetcher.calls(), 4);
        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (1, Duration::from_secs(1)),
                (2, Duration::from_secs(2)),
                (3, Duration::from_secs(4)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out_and_counts_as_transient() {
        let pf = PagedFetch::new(
            Arc::new(MemoryFetcher::synthetic(1, 10).with_latency(Duration::from_secs(60))),
            Arc::new(RateLimiter::new(RateLimitSettings::default())),
            RetryPolicy::default(),
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        let err = pf.fetch_page(&op(), None, None, &NoopObserver).await.unwrap_err();
        assert!(matches!(
            err,
            PageFetchError::Failed {
                error: AttemptError::Fetch(FetchError::Timeout(_)),
                retries: 2
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_retry_sleep() {
        let pf = paged(
            MemoryFetcher::synthetic(1, 10).fail_always(FetchError::Network("reset".into())),
        );
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let err = pf
            .fetch_page(&op(), None, Some(&token), &NoopObserver)
            .await
            .unwrap_err();
        assert_eq!(err, PageFetchError::Cancelled);
    }
}
