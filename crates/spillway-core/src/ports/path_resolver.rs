//! PathResolver port - 書き込み先パスの解決と検証
//!
//! ファイルへの書き込みは必ずこの trait を経由します（迂回しない）。

use std::path::PathBuf;

/// Rejected destination.
#[derive(Debug, thiserror::Error)]
pub enum PathSecurityError {
    #[error("invalid {component} name: {value:?}")]
    InvalidComponent {
        component: &'static str,
        value: String,
    },

    #[error("path escapes the storage root: {0}")]
    OutsideRoot(PathBuf),

    #[error("directory is not writable: {0}")]
    NotWritable(PathBuf),

    #[error("cannot prepare directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// PathResolver は (project, subdir, filename) を保存ルート配下の絶対パスに解決
///
/// # 責務
/// - 名前のサニタイズ / トラバーサルの拒否
/// - 中間ディレクトリの作成
/// - 書き込み権限の確認
pub trait PathResolver: Send + Sync {
    fn resolve(
        &self,
        project: &str,
        subdir: Option<&str>,
        filename: &str,
    ) -> Result<PathBuf, PathSecurityError>;
}
