//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部の協調者（データ提供元, ファイルシステム, 時計など）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - 外部データ提供元へのリクエスト/レスポンス変換は Fetcher の向こう側
//! - 書き込み先パスの検証は PathResolver を必ず経由する
//! - 時刻と ID はテストで差し替え可能にする

pub mod clock;
pub mod fetcher;
pub mod id_generator;
pub mod path_resolver;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::fetcher::{FetchError, Fetcher, Page};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::path_resolver::{PathResolver, PathSecurityError};
