//! OutputRouter - 出力先の決定と同期パスの実行
//!
//! # フロー
//! 1. preview（先頭ページ / 件数）から SizeVerdict を作る
//! 2. caller の強制モードがあればそれを優先、なければ verdict の分類
//! 3. Inline: 残りのページを取ってそのまま返す（auto で上限を超えたら File に切り替え）
//!    File:   パス解決 → StreamingWriter で同期書き込み
//!    Job:    パス解決 → JobManager に登録 → intake に投入（待たない）

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::fetch::{NoopObserver, PagedFetch};
use super::worker::JobIntake;
use crate::config::Settings;
use crate::domain::{
    Classification, FetchOperation, JobRequest, OutputFormat, OutputMode, Outcome, PageCursor,
    SizeVerdict,
};
use crate::error::SpillwayError;
use crate::estimate::{EstimateInput, SizeEstimator};
use crate::impls::sanitize_name;
use crate::jobs::JobManager;
use crate::ports::{Page, PathResolver};
use crate::writer::StreamingWriter;

/// What is known about the result before routing.
#[derive(Debug, Clone, PartialEq)]
pub enum Preview {
    /// First page, already fetched.
    Page(Page),
    /// Row count reported by the provider before any data.
    DeclaredCount(u64),
    /// Nothing; routes to File.
    Unknown,
}

/// Caller-supplied overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallerHints {
    pub mode: OutputMode,
    pub format: Option<OutputFormat>,
    pub project: Option<String>,
    pub subdir: Option<String>,
    /// Without extension it gets one from the format.
    pub filename: Option<String>,
    /// Consumer capacity profile.
    pub profile: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub operation: FetchOperation,
    pub preview: Preview,
    pub hints: CallerHints,
}

pub struct OutputRouter {
    estimator: SizeEstimator,
    jobs: Arc<JobManager>,
    intake: JobIntake,
    paths: Arc<dyn PathResolver>,
    fetch: PagedFetch,
    writer: StreamingWriter,
    default_format: OutputFormat,
    default_project: String,
}

impl OutputRouter {
    pub fn new(
        settings: &Settings,
        jobs: Arc<JobManager>,
        intake: JobIntake,
        paths: Arc<dyn PathResolver>,
        fetch: PagedFetch,
    ) -> Self {
        Self {
            estimator: SizeEstimator::new(settings.output.clone()),
            jobs,
            intake,
            paths,
            fetch,
            writer: StreamingWriter::new(settings.output.chunk_size),
            default_format: settings.output.default_format,
            default_project: settings.storage.default_project.clone(),
        }
    }

    pub fn estimator(&self) -> &SizeEstimator {
        &self.estimator
    }

    /// Size verdict for `preview`. Never fails: an impossible estimate is File.
    pub fn verdict(&self, preview: &Preview, profile: Option<&str>) -> SizeVerdict {
        let input = match preview {
            Preview::Page(page) => EstimateInput::Sample {
                records: &page.records,
                declared_total: page.total_count,
                has_more: page.next_cursor.is_some(),
            },
            Preview::DeclaredCount(rows) => EstimateInput::Count(*rows),
            Preview::Unknown => EstimateInput::Sample {
                records: &[],
                declared_total: None,
                has_more: false,
            },
        };
        self.estimator.estimate_or_fallback(input, profile)
    }

    /// Estimate, then route.
    pub async fn handle(&self, request: RouteRequest) -> Result<Outcome, SpillwayError> {
        let verdict = self.verdict(&request.preview, request.hints.profile.as_deref());
        self.route(verdict, request).await
    }

    /// Route with an existing verdict; a forced mode in the hints wins.
    pub async fn route(&self, verdict: SizeVerdict, request: RouteRequest) -> Result<Outcome, SpillwayError> {
        let forced = request.hints.mode != OutputMode::Auto;
        let target = match request.hints.mode {
            OutputMode::Auto => verdict.classification,
            OutputMode::Inline => Classification::Inline,
            OutputMode::File => Classification::File,
            OutputMode::Job => Classification::Job,
        };
        info!(
            operation = %request.operation.name,
            ?target,
            forced,
            rows = verdict.estimated_rows,
            units = verdict.estimated_units,
            reason = %verdict.reason,
            "routing"
        );

        match target {
            Classification::Inline => self.inline(verdict, request, !forced).await,
            Classification::File => self.file(request).await,
            Classification::Job => self.job(verdict, request).await,
        }
    }

    /// `unique` keeps default names of concurrent routes apart.
    fn destination(
        &self,
        operation: &FetchOperation,
        hints: &CallerHints,
        format: OutputFormat,
        unique: &str,
    ) -> Result<PathBuf, SpillwayError> {
        let ext = format.extension();
        let filename = match &hints.filename {
            Some(name) if name.ends_with(&format!(".{ext}")) => name.clone(),
            Some(name) => format!("{name}.{ext}"),
            None => format!(
                "{}_{}_{unique}.{ext}",
                sanitize_name(&operation.name),
                self.jobs.now().format("%Y%m%d_%H%M%S")
            ),
        };
        let project = hints.project.as_deref().unwrap_or(&self.default_project);
        Ok(self.paths.resolve(project, hints.subdir.as_deref(), &filename)?)
    }

    /// With `capped`, a result that outgrows the inline limits while being
    /// collected is written to a file instead.
    async fn inline(&self, verdict: SizeVerdict, request: RouteRequest, capped: bool) -> Result<Outcome, SpillwayError> {
        let (mut records, mut next) = match request.preview {
            Preview::Page(page) => (page.records, page.next_cursor),
            Preview::DeclaredCount(_) | Preview::Unknown => {
                let first = self
                    .fetch
                    .fetch_page(&request.operation, None, None, &NoopObserver)
                    .await?;
                (first.records, first.next_cursor)
            }
        };
        let row_limit = self.estimator.settings().inline_row_limit;
        let mut units = self.estimator.records_units(&records);

        loop {
            if capped && (units > verdict.safe_limit || records.len() as u64 > row_limit) {
                warn!(
                    operation = %request.operation.name,
                    rows = records.len(),
                    units,
                    safe_limit = verdict.safe_limit,
                    "inline result outgrew its estimate; writing to a file"
                );
                let resume = next.map_or(Resume::Done, Resume::At);
                return self
                    .write_file(&request.operation, &request.hints, records, resume)
                    .await;
            }
            let Some(cursor) = next else { break };
            let page = self
                .fetch
                .fetch_page(&request.operation, Some(&cursor), None, &NoopObserver)
                .await?;
            units += self.estimator.records_units(&page.records);
            records.extend(page.records);
            next = page.next_cursor;
        }
        Ok(Outcome::Inline { records, verdict })
    }

    async fn file(&self, request: RouteRequest) -> Result<Outcome, SpillwayError> {
        let (held, resume) = match request.preview {
            Preview::Page(page) => (page.records, page.next_cursor.map_or(Resume::Done, Resume::At)),
            Preview::DeclaredCount(_) | Preview::Unknown => (Vec::new(), Resume::Start),
        };
        self.write_file(&request.operation, &request.hints, held, resume)
            .await
    }

    /// Write `held`, then every page from `cursor` on, synchronously.
    async fn write_file(
        &self,
        operation: &FetchOperation,
        hints: &CallerHints,
        held: Vec<serde_json::Value>,
        mut cursor: Resume,
    ) -> Result<Outcome, SpillwayError> {
        let format = hints.format.unwrap_or(self.default_format);
        let unique = format!("{:08x}", rand::random::<u32>());
        let location = self.destination(operation, hints, format, &unique)?;
        let mut sink = self.writer.open(&location, format)?;
        sink.extend(&held, |_| {})?;
        drop(held);

        loop {
            let at = match &cursor {
                Resume::Done => break,
                Resume::Start => None,
                Resume::At(c) => Some(c),
            };
            // a failed page drops the sink, which removes the partial file
            let page = self.fetch.fetch_page(operation, at, None, &NoopObserver).await?;
            sink.extend(&page.records, |_| {})?;
            cursor = page.next_cursor.map_or(Resume::Done, Resume::At);
        }

        let summary = sink.finish()?;
        info!(
            path = %summary.location.display(),
            rows = summary.rows_written,
            bytes = summary.bytes_written,
            "file written"
        );
        Ok(Outcome::File {
            location: summary.location,
            rows_written: summary.rows_written,
            bytes_written: summary.bytes_written,
            format,
        })
    }

    async fn job(&self, verdict: SizeVerdict, request: RouteRequest) -> Result<Outcome, SpillwayError> {
        let format = request.hints.format.unwrap_or(self.default_format);
        let job_id = self.jobs.next_id();
        let location = self.destination(&request.operation, &request.hints, format, &job_id.to_string())?;
        // only a known count feeds percent_complete
        let estimated_rows = match &request.preview {
            Preview::Page(page) => page
                .total_count
                .or(page.next_cursor.is_none().then_some(page.records.len() as u64)),
            Preview::DeclaredCount(rows) => Some(*rows),
            Preview::Unknown => None,
        };

        self.jobs
            .create_with_id(
                job_id,
                JobRequest {
                    operation: request.operation,
                    destination: location.clone(),
                    format,
                    estimated_rows,
                },
            )
            .await;

        if let Err(e) = self.intake.submit(job_id) {
            warn!(job_id = %job_id, error = %e, "job could not be queued");
            // never leave an Accepted job nobody will run
            if let Err(cancel_err) = self.jobs.cancel(job_id, Some(e.to_string())).await {
                debug!(job_id = %job_id, error = %cancel_err, "unqueued job not cancelled");
            }
            return Err(e);
        }

        Ok(Outcome::Job {
            job_id,
            estimated_rows: verdict.estimated_rows,
            estimated_duration: verdict.estimated_duration,
            location,
        })
    }
}

/// Where the synchronous file path continues fetching.
enum Resume {
    Start,
    At(PageCursor),
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::retry::RetryPolicy;
    use crate::domain::{JobStatus, VerdictReason};
    use crate::impls::{FsPathResolver, MemoryFetcher};
    use crate::limiter::RateLimiter;
    use crate::ports::{Fetcher, SystemClock, UlidGenerator};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        router: OutputRouter,
        jobs: Arc<JobManager>,
        queued: mpsc::Receiver<crate::domain::JobId>,
        _dir: tempfile::TempDir,
    }

    fn fixture(fetcher: Arc<dyn Fetcher>, capacity: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.storage.root = dir.path().to_path_buf();
        settings.output.chunk_size = 100;

        let jobs = Arc::new(JobManager::new(
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
            Duration::from_secs(3_600),
        ));
        let (intake, queued) = JobIntake::bounded(capacity);
        let fetch = PagedFetch::new(
            fetcher,
            Arc::new(RateLimiter::new(settings.rate_limit.clone())),
            RetryPolicy::default(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        );
        let router = OutputRouter::new(
            &settings,
            Arc::clone(&jobs),
            intake,
            Arc::new(FsPathResolver::new(dir.path())),
            fetch,
        );
        Fixture {
            router,
            jobs,
            queued,
            _dir: dir,
        }
    }

    fn op() -> FetchOperation {
        FetchOperation::new("series_observations", serde_json::json!({"series_id": "UNRATE"}))
    }

    async fn first_page(fetcher: &MemoryFetcher) -> Page {
        fetcher.fetch(&op(), None).await.unwrap()
    }

    #[tokio::test]
    async fn small_result_comes_back_inline() {
        let fetcher = Arc::new(MemoryFetcher::synthetic(25, 10));
        let f = fixture(fetcher.clone(), 4);
        let page = first_page(&fetcher).await;

        let outcome = f
            .router
            .handle(RouteRequest {
                operation: op(),
                preview: Preview::Page(page),
                hints: CallerHints::default(),
            })
            .await
            .unwrap();

        match outcome {
            Outcome::Inline { records, verdict } => {
                assert_eq!(records.len(), 25);
                assert_eq!(records[24]["metadata"]["seq"], 24);
                assert_eq!(verdict.classification, Classification::Inline);
            }
            other => panic!("expected inline, got {other:?}"),
        }
        // preview + 2 remaining pages
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn medium_result_is_written_to_a_csv_file() {
        let fetcher = Arc::new(MemoryFetcher::synthetic(2_500, 500));
        let f = fixture(fetcher.clone(), 4);
        let page = first_page(&fetcher).await;

        let outcome = f
            .router
            .handle(RouteRequest {
                operation: op(),
                preview: Preview::Page(page),
                hints: CallerHints {
                    project: Some("macro".into()),
                    filename: Some("unrate".into()),
                    ..CallerHints::default()
                },
            })
            .await
            .unwrap();

        let Outcome::File {
            location,
            rows_written,
            bytes_written,
            format,
        } = outcome
        else {
            panic!("expected file outcome");
        };
        assert_eq!(rows_written, 2_500);
        assert_eq!(format, OutputFormat::Csv);
        assert_eq!(location.file_name().unwrap(), "unrate.csv");
        assert_eq!(std::fs::metadata(&location).unwrap().len(), bytes_written);

        let mut reader = csv::Reader::from_path(&location).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert!(headers.contains(&"metadata_seq".to_string()));
        assert_eq!(reader.records().count(), 2_500);
        assert!(f.jobs.is_empty().await);
    }

    #[tokio::test]
    async fn forced_mode_overrides_the_verdict() {
        let fetcher = Arc::new(MemoryFetcher::synthetic(5, 10));
        let f = fixture(fetcher.clone(), 4);
        let page = first_page(&fetcher).await;

        let outcome = f
            .router
            .handle(RouteRequest {
                operation: op(),
                preview: Preview::Page(page),
                hints: CallerHints {
                    mode: OutputMode::File,
                    format: Some(OutputFormat::Json),
                    ..CallerHints::default()
                },
            })
            .await
            .unwrap();

        let Outcome::File { location, rows_written, .. } = outcome else {
            panic!("expected file outcome");
        };
        assert_eq!(rows_written, 5);
        let name = location.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("series_observations_"), "{name}");
        assert!(name.ends_with(".json"), "{name}");
        let parsed: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(&location).unwrap()).unwrap();
        assert_eq!(parsed.len(), 5);
    }

    #[tokio::test]
    async fn unknown_size_falls_back_to_file() {
        let fetcher = Arc::new(MemoryFetcher::synthetic(30, 10));
        let f = fixture(fetcher.clone(), 4);

        let verdict = f.router.verdict(&Preview::Unknown, None);
        assert_eq!(verdict.classification, Classification::File);
        assert_eq!(verdict.reason, VerdictReason::EstimationFailed);

        let outcome = f
            .router
            .route(
                verdict,
                RouteRequest {
                    operation: op(),
                    preview: Preview::Unknown,
                    hints: CallerHints::default(),
                },
            )
            .await
            .unwrap();
        let Outcome::File { rows_written, .. } = outcome else {
            panic!("expected file outcome");
        };
        assert_eq!(rows_written, 30);
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn unsafe_project_is_rejected_before_anything_runs() {
        let fetcher = Arc::new(MemoryFetcher::synthetic(10, 10));
        let f = fixture(fetcher.clone(), 4);

        let err = f
            .router
            .handle(RouteRequest {
                operation: op(),
                preview: Preview::DeclaredCount(50_000),
                hints: CallerHints {
                    project: Some("../etc".into()),
                    ..CallerHints::default()
                },
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SpillwayError::PathSecurity(_)));
        assert!(f.jobs.is_empty().await);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn large_declared_count_is_queued_as_a_job() {
        let fetcher = Arc::new(MemoryFetcher::synthetic(10, 10));
        let mut f = fixture(fetcher.clone(), 4);

        let outcome = f
            .router
            .handle(RouteRequest {
                operation: op(),
                preview: Preview::DeclaredCount(50_000),
                hints: CallerHints::default(),
            })
            .await
            .unwrap();

        let Outcome::Job {
            job_id,
            estimated_rows,
            estimated_duration,
            location,
        } = outcome
        else {
            panic!("expected job outcome");
        };
        assert_eq!(estimated_rows, 50_000);
        assert_eq!(estimated_duration, Duration::from_secs(50));
        assert!(location.extension().is_some_and(|e| e == "csv"));
        // routing a job never touches the provider
        assert_eq!(fetcher.calls(), 0);

        assert_eq!(f.queued.recv().await, Some(job_id));
        let job = f.jobs.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Accepted);
        assert_eq!(job.request.estimated_rows, Some(50_000));
    }

    #[tokio::test]
    async fn first_page_of_an_unknown_total_is_never_inline() {
        let fetcher = Arc::new(MemoryFetcher::synthetic(500, 10).with_total(false));
        let f = fixture(fetcher.clone(), 4);
        let page = first_page(&fetcher).await;
        assert!(page.total_count.is_none() && page.next_cursor.is_some());

        let verdict = f.router.verdict(&Preview::Page(page.clone()), None);
        assert_eq!(verdict.classification, Classification::File);
        assert_eq!(verdict.reason, VerdictReason::IncompleteSample);

        let outcome = f
            .router
            .handle(RouteRequest {
                operation: op(),
                preview: Preview::Page(page),
                hints: CallerHints::default(),
            })
            .await
            .unwrap();
        let Outcome::File { location, rows_written, .. } = outcome else {
            panic!("expected file outcome, got {outcome:?}");
        };
        assert_eq!(rows_written, 500);
        assert_eq!(csv::Reader::from_path(&location).unwrap().records().count(), 500);
    }

    #[tokio::test]
    async fn job_from_an_open_ended_page_has_no_row_estimate() {
        let fetcher = Arc::new(MemoryFetcher::synthetic(500, 10).with_total(false));
        let f = fixture(fetcher.clone(), 4);
        let page = first_page(&fetcher).await;

        let outcome = f
            .router
            .handle(RouteRequest {
                operation: op(),
                preview: Preview::Page(page),
                hints: CallerHints {
                    mode: OutputMode::Job,
                    ..CallerHints::default()
                },
            })
            .await
            .unwrap();

        let job = f.jobs.get(outcome.job_id().unwrap()).await.unwrap();
        assert_eq!(job.request.estimated_rows, None);
        assert_eq!(job.progress.percent_complete, None);
    }

    #[tokio::test]
    async fn inline_result_that_outgrows_its_estimate_is_written_to_a_file() {
        // small first page, bulky rest
        let records: Vec<serde_json::Value> = (0..50)
            .map(|i| {
                if i < 10 {
                    serde_json::json!({"i": i})
                } else {
                    serde_json::json!({"i": i, "blob": "x".repeat(20_000)})
                }
            })
            .collect();
        let fetcher = Arc::new(MemoryFetcher::new(records, 10));
        let f = fixture(fetcher.clone(), 4);
        let page = first_page(&fetcher).await;

        let verdict = f.router.verdict(&Preview::Page(page.clone()), None);
        assert_eq!(verdict.classification, Classification::Inline);

        let outcome = f
            .router
            .route(
                verdict,
                RouteRequest {
                    operation: op(),
                    preview: Preview::Page(page),
                    hints: CallerHints::default(),
                },
            )
            .await
            .unwrap();
        let Outcome::File { location, rows_written, .. } = outcome else {
            panic!("expected file outcome, got {outcome:?}");
        };
        assert_eq!(rows_written, 50);
        assert_eq!(csv::Reader::from_path(&location).unwrap().records().count(), 50);
    }

    #[tokio::test]
    async fn concurrent_default_named_routes_never_share_a_destination() {
        let fetcher = Arc::new(MemoryFetcher::synthetic(5, 10));
        let f = fixture(fetcher.clone(), 4);
        let job = || RouteRequest {
            operation: op(),
            preview: Preview::DeclaredCount(50_000),
            hints: CallerHints::default(),
        };
        let file = || RouteRequest {
            operation: op(),
            preview: Preview::DeclaredCount(5),
            hints: CallerHints {
                mode: OutputMode::File,
                ..CallerHints::default()
            },
        };

        let (a, b, c, d) = tokio::join!(
            f.router.handle(job()),
            f.router.handle(job()),
            f.router.handle(file()),
            f.router.handle(file()),
        );
        let location = |o: Outcome| match o {
            Outcome::Job { location, .. } | Outcome::File { location, .. } => location,
            other => panic!("unexpected {other:?}"),
        };
        let (a, b) = (location(a.unwrap()), location(b.unwrap()));
        let (c, d) = (location(c.unwrap()), location(d.unwrap()));

        assert_ne!(a, b);
        assert_ne!(c, d);
        for written in [&c, &d] {
            assert_eq!(csv::Reader::from_path(written).unwrap().records().count(), 5);
        }
    }

    #[tokio::test]
    async fn full_intake_cancels_the_new_job() {
        let fetcher = Arc::new(MemoryFetcher::synthetic(10, 10));
        let f = fixture(fetcher, 1);
        let request = || RouteRequest {
            operation: op(),
            preview: Preview::DeclaredCount(20_000),
            hints: CallerHints::default(),
        };

        f.router.handle(request()).await.unwrap();
        let err = f.router.handle(request()).await.unwrap_err();
        assert!(matches!(err, SpillwayError::QueueFull));

        let counts = f.jobs.counts().await;
        assert_eq!(counts.accepted, 1);
        assert_eq!(counts.cancelled, 1);
    }
}
