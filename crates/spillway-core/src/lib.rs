//! spillway-core
//!
//! Adaptive output routing for paged data fetches.
//!
//! 結果の大きさを見積もって、呼び出し元へそのまま返す（Inline）か、
//! ファイルへ同期で書き出す（File）か、バックグラウンドジョブにして
//! 後からポーリングさせる（Job）かを決めます。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, verdict, outcome, format, errors）
//! - **ports**: 抽象化レイヤー（Fetcher, PathResolver, Clock, IdGenerator）
//! - **estimate**: SizeEstimator
//! - **limiter**: スライディングウィンドウの rate limit + circuit breaker
//! - **writer**: チャンク単位で CSV / JSON を書き出す StreamingWriter
//! - **jobs**: JobManager（状態遷移・進捗・保持期間）
//! - **app**: router / worker / sweeper / status / builder
//! - **impls**: 実装（FsPathResolver, 開発用 MemoryFetcher）

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod estimate;
pub mod impls;
pub mod jobs;
pub mod limiter;
pub mod observability;
pub mod ports;
pub mod writer;

pub use app::{App, AppBuilder};
pub use config::Settings;
pub use error::SpillwayError;
