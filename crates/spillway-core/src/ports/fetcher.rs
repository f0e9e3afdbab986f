//! Fetcher port - 外部データ提供元へのページ取得
//!
//! エンドポイントごとのリクエスト/レスポンス変換はこの trait の実装側の責務です。
//! 実装は冪等でなければならず、同じ (operation, cursor) で何度呼ばれてもよい。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{ErrorClass, FetchOperation, PageCursor};

/// One page of provider records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<serde_json::Value>,

    /// `None` when this is the last page.
    pub next_cursor: Option<PageCursor>,

    /// Total row count, when the provider reports it up front.
    pub total_count: Option<u64>,
}

/// Provider-side failure of a fetch call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("provider rate limit hit")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl FetchError {
    /// リトライ判断に使う分類
    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::RateLimited { .. } => ErrorClass::RateLimit,
            FetchError::Server { .. } | FetchError::Network(_) | FetchError::Timeout(_) => {
                ErrorClass::Transient
            }
            FetchError::InvalidRequest(_)
            | FetchError::NotFound(_)
            | FetchError::Unauthorized(_) => ErrorClass::Permanent,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Fetcher は外部データ提供元から 1 ページを取得
///
/// `cursor` が `None` なら最初のページ。
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        operation: &FetchOperation,
        cursor: Option<&PageCursor>,
    ) -> Result<Page, FetchError>;
}
