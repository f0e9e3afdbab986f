//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: アプリケーションの構築とワイヤリング
//! - **OutputRouter**: Inline / File / Job の振り分けと同期パスの実行
//! - **PagedFetch**: rate limit・リトライ・キャンセル付きのページ取得
//! - **WorkerGroup**: intake キューからジョブを取り出して実行するワーカー群
//! - **Sweeper**: 保持期間切れジョブの定期回収
//! - **StatusService**: ジョブ状態の問い合わせ

pub mod builder;
pub mod fetch;
pub mod retry;
pub mod router;
pub mod status;
pub mod sweeper;
pub mod worker;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::fetch::{PageFetchError, PagedFetch, RetryNotice, RetryObserver};
pub use self::retry::RetryPolicy;
pub use self::router::{CallerHints, OutputRouter, Preview, RouteRequest};
pub use self::status::StatusService;
pub use self::sweeper::Sweeper;
pub use self::worker::{BackgroundWorker, JobIntake, ShutdownReport, WorkerGroup};
