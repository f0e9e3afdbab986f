//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 構成
//! - Settings を検証（Fail-fast 設計）
//! - RateLimiter は router と worker で 1 つを共有する
//! - WorkerGroup / Sweeper はここで spawn される（tokio runtime 上で呼ぶこと）

use std::sync::Arc;

use tracing::info;

use super::fetch::PagedFetch;
use super::router::OutputRouter;
use super::status::StatusService;
use super::sweeper::Sweeper;
use super::worker::{BackgroundWorker, ShutdownReport, WorkerGroup};
use crate::config::Settings;
use crate::error::SpillwayError;
use crate::impls::FsPathResolver;
use crate::jobs::JobManager;
use crate::limiter::RateLimiter;
use crate::ports::{Clock, Fetcher, PathResolver, SystemClock, UlidGenerator};
use crate::writer::StreamingWriter;

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(Settings::from_env()?)
///     .fetcher(Arc::new(MyProvider::new()))
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - fetcher が無ければ BuildError::MissingFetcher
/// - Settings::validate() に失敗すれば BuildError::InvalidSettings
pub struct AppBuilder {
    settings: Settings,
    fetcher: Option<Arc<dyn Fetcher>>,
    clock: Arc<dyn Clock>,
    paths: Option<Arc<dyn PathResolver>>,
    sweeper: bool,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no fetcher configured; call AppBuilder::fetcher before build")]
    MissingFetcher,

    #[error("invalid settings: {0}")]
    InvalidSettings(#[source] SpillwayError),
}

impl AppBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            fetcher: None,
            clock: Arc::new(SystemClock),
            paths: None,
            sweeper: true,
        }
    }

    /// The paged data provider. Required.
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// テストでは FixedClock を渡す
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Defaults to an [`FsPathResolver`] over `storage.root`.
    pub fn path_resolver(mut self, paths: Arc<dyn PathResolver>) -> Self {
        self.paths = Some(paths);
        self
    }

    /// Disable the periodic sweep loop (lazy sweeps on queries still happen).
    pub fn without_sweeper(mut self) -> Self {
        self.sweeper = false;
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        self.settings.validate().map_err(BuildError::InvalidSettings)?;
        let fetcher = self.fetcher.ok_or(BuildError::MissingFetcher)?;
        let settings = self.settings;

        let jobs = Arc::new(JobManager::new(
            Arc::clone(&self.clock),
            Arc::new(UlidGenerator::new(Arc::clone(&self.clock))),
            settings.job.retention,
        ));
        let limiter = Arc::new(RateLimiter::new(settings.rate_limit.clone()));
        let fetch = PagedFetch::from_settings(fetcher, limiter, &settings);
        let paths = self
            .paths
            .unwrap_or_else(|| Arc::new(FsPathResolver::new(settings.storage.root.clone())));

        let worker = BackgroundWorker::new(
            Arc::clone(&jobs),
            fetch.clone(),
            StreamingWriter::new(settings.output.chunk_size),
            settings.job.job_deadline,
        );
        let workers = WorkerGroup::spawn(
            settings.job.workers,
            settings.job.queue_capacity,
            worker,
            settings.job.shutdown_grace,
        );
        let router = OutputRouter::new(&settings, Arc::clone(&jobs), workers.intake(), paths, fetch);
        let sweeper = self
            .sweeper
            .then(|| Sweeper::spawn(Arc::clone(&jobs), settings.job.sweep_interval));

        info!(
            root = %settings.storage.root.display(),
            workers = settings.job.workers,
            "app ready"
        );
        Ok(App {
            router,
            status: StatusService::new(Arc::clone(&jobs)),
            jobs,
            workers,
            sweeper,
            settings,
        })
    }
}

/// App はアプリケーションのランタイム
pub struct App {
    pub router: OutputRouter,
    pub status: StatusService,
    pub jobs: Arc<JobManager>,
    workers: WorkerGroup,
    sweeper: Option<Sweeper>,
    settings: Settings,
}

impl App {
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Stop the sweeper, then drain the worker group.
    pub async fn shutdown(self) -> ShutdownReport {
        if let Some(sweeper) = self.sweeper {
            sweeper.stop().await;
        }
        self.workers.shutdown_and_join().await
    }
}

impl From<BuildError> for SpillwayError {
    fn from(e: BuildError) -> Self {
        match e {
            BuildError::InvalidSettings(inner) => inner,
            BuildError::MissingFetcher => SpillwayError::Config(e.to_string()),
        }
    }
}
