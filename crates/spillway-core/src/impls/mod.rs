//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **FsPathResolver**: 保存ルート配下に閉じたパス解決
//! - **MemoryFetcher**: 開発用・テスト用のページ付きインメモリ提供元
//!
//! 実際の外部データ提供元の Fetcher 実装は利用側のクレートに配置します。

pub mod fs_path_resolver;
pub mod memory_fetcher;

// 主要な型を再エクスポート
pub use self::fs_path_resolver::{FsPathResolver, sanitize_name};
pub use self::memory_fetcher::MemoryFetcher;
