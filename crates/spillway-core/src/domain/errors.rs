//! Errors - 失敗の分類
//!
//! リトライ判断はメッセージ文字列ではなく、この分類だけを見て行います。

use serde::{Deserialize, Serialize};

/// ErrorClass は外部呼び出しの失敗の分類
///
/// # 分類
/// - RateLimit: レート制限 / サーキットオープン（バックオフしてリトライ）
/// - Transient: 一時的なエラー（5xx, ネットワーク, タイムアウト; リトライ）
/// - Permanent: 恒久的なエラー（バリデーション, 認証, not found; リトライ無意味）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    RateLimit,
    Transient,
    Permanent,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }
}
