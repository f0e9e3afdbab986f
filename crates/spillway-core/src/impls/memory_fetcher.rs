//! In-memory paged provider.
//!
//! Serves a fixed record set in pages (cursor = row offset) and can be scripted
//! to fail, which makes it the fetcher of choice for tests and the CLI demo.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::domain::{FetchOperation, PageCursor};
use crate::ports::{FetchError, Fetcher, Page};

pub struct MemoryFetcher {
    records: Arc<Vec<serde_json::Value>>,
    page_size: usize,
    report_total: bool,
    latency: Duration,
    script: Mutex<VecDeque<FetchError>>,
    persistent_failure: Option<FetchError>,
    calls: AtomicUsize,
}

impl MemoryFetcher {
    pub fn new(records: Vec<serde_json::Value>, page_size: usize) -> Self {
        Self {
            records: Arc::new(records),
            page_size: page_size.max(1),
            report_total: true,
            latency: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            persistent_failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// `rows` synthetic observation records with a nested metadata object.
    pub fn synthetic(rows: usize, page_size: usize) -> Self {
        Self::new(synthetic_records(rows), page_size)
    }

    /// Whether pages carry `total_count`.
    pub fn with_total(mut self, report_total: bool) -> Self {
        self.report_total = report_total;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue one failure; queued failures are returned before any page.
    pub fn fail_next(self, error: FetchError) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
        self
    }

    /// Every call fails with `error`.
    pub fn fail_always(mut self, error: FetchError) -> Self {
        self.persistent_failure = Some(error);
        self
    }

    /// Number of `fetch` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn page_at(&self, offset: usize) -> Page {
        let end = (offset + self.page_size).min(self.records.len());
        let records = self.records.get(offset..end).unwrap_or_default().to_vec();
        let next_cursor = (end < self.records.len()).then(|| PageCursor::new(end.to_string()));
        Page {
            records,
            next_cursor,
            total_count: self.report_total.then_some(self.records.len() as u64),
        }
    }
}

pub fn synthetic_records(rows: usize) -> Vec<serde_json::Value> {
    (0..rows)
        .map(|i| {
            json!({
                "date": format!("2024-01-{:02}", i % 28 + 1),
                "value": i as f64 * 0.5,
                "metadata": { "units": "Percent", "seq": i },
            })
        })
        .collect()
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(
        &self,
        _operation: &FetchOperation,
        cursor: Option<&PageCursor>,
    ) -> Result<Page, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }
        if let Some(error) = &self.persistent_failure {
            return Err(error.clone());
        }

        let offset = match cursor {
            None => 0,
            Some(c) => c
                .as_str()
                .parse::<usize>()
                .map_err(|_| FetchError::InvalidRequest(format!("bad cursor {:?}", c.as_str())))?,
        };
        Ok(self.page_at(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op() -> FetchOperation {
        FetchOperation::new("series_observations", json!({"series_id": "GDP"}))
    }

    #[tokio::test]
    async fn pages_through_all_records() {
        let fetcher = MemoryFetcher::synthetic(5, 2);
        let mut cursor = None;
        let mut seen = 0;
        loop {
            let page = fetcher.fetch(&op(), cursor.as_ref()).await.unwrap();
            assert_eq!(page.total_count, Some(5));
            seen += page.records.len();
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, 5);
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let fetcher = MemoryFetcher::synthetic(1, 10)
            .fail_next(FetchError::Network("reset".into()));
        assert!(fetcher.fetch(&op(), None).await.is_err());
        assert_eq!(fetcher.fetch(&op(), None).await.unwrap().records.len(), 1);
    }
}
