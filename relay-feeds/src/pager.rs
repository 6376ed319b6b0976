//! Descending-watermark pagination
//!
//! Sources return pages ordered by `last_seen`, newest first. After each page
//! the upper bound moves to one millisecond below the oldest `last_seen` in
//! that page. Records sharing the exact boundary timestamp with records on
//! the next page are only fetched once if the source's upper bound is
//! inclusive and results are strictly ordered; the relay does not second-guess
//! the source here.

use async_trait::async_trait;
use futures::stream::{self, Stream};
use tracing::debug;

use relay_core::{RawIndicator, TimeWindow};

use crate::FeedError;

/// One bounded page query, `[from_ms, to_ms]` inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub from_ms: i64,
    pub to_ms: i64,
    pub page_size: usize,
}

/// A source that can answer bounded page queries
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn search_page(&self, request: &PageRequest) -> Result<Vec<RawIndicator>, FeedError>;
}

/// Walks a [`PageSource`] backwards through a time window
pub struct Pager<'a, S: PageSource + ?Sized> {
    source: &'a S,
    from_ms: i64,
    /// Next upper bound; `None` once exhausted
    cursor: Option<i64>,
    page_size: usize,
    queries: usize,
}

impl<'a, S: PageSource + ?Sized> Pager<'a, S> {
    /// Page through `window`; its exclusive end becomes the first inclusive bound
    pub fn new(source: &'a S, window: TimeWindow, page_size: usize) -> Self {
        Self {
            source,
            from_ms: window.from_ms,
            cursor: Some(window.to_ms - 1),
            page_size: page_size.max(1),
            queries: 0,
        }
    }

    /// Number of page queries issued so far
    pub fn queries(&self) -> usize {
        self.queries
    }

    /// Fetch the next page, or `None` when the window is exhausted
    pub async fn next_page(&mut self) -> Result<Option<Vec<RawIndicator>>, FeedError> {
        let bound = match self.cursor {
            Some(bound) if bound >= self.from_ms => bound,
            _ => {
                self.cursor = None;
                return Ok(None);
            }
        };

        let request = PageRequest {
            from_ms: self.from_ms,
            to_ms: bound,
            page_size: self.page_size,
        };
        self.queries += 1;
        let page = self.source.search_page(&request).await?;

        if page.is_empty() {
            debug!("Empty page at bound {}; pagination done", bound);
            self.cursor = None;
            return Ok(None);
        }

        let earliest = page
            .iter()
            .filter_map(|record| record.last_seen)
            .min()
            .ok_or(FeedError::MissingWatermark)?;

        if earliest > bound {
            self.cursor = None;
            return Err(FeedError::CursorOutOfRange {
                last_seen: earliest,
                bound,
            });
        }

        let next = earliest - 1;
        self.cursor = (next >= self.from_ms).then_some(next);
        debug!("Page of {} records; next bound {:?}", page.len(), self.cursor);
        Ok(Some(page))
    }

    /// Drain every page into one list
    pub async fn collect_all(mut self) -> Result<Vec<RawIndicator>, FeedError> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }

    /// Lazy stream of pages
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<RawIndicator>, FeedError>> + 'a
    where
        S: 'a,
    {
        stream::try_unfold(self, |mut pager| async move {
            let page = pager.next_page().await?;
            Ok::<_, FeedError>(page.map(|page| (page, pager)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory source ordered newest first
    struct SyntheticSource {
        records: Vec<RawIndicator>,
        calls: AtomicUsize,
    }

    impl SyntheticSource {
        fn with_timestamps(timestamps: &[i64]) -> Self {
            let mut records: Vec<RawIndicator> = timestamps
                .iter()
                .enumerate()
                .map(|(i, ts)| {
                    let mut raw = RawIndicator::new(&format!("10.0.0.{}", i), "IP4");
                    raw.last_seen = Some(*ts);
                    raw
                })
                .collect();
            records.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
            Self {
                records,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageSource for SyntheticSource {
        async fn search_page(&self, request: &PageRequest) -> Result<Vec<RawIndicator>, FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .records
                .iter()
                .filter(|r| {
                    let ts = r.last_seen.unwrap_or_default();
                    ts >= request.from_ms && ts <= request.to_ms
                })
                .take(request.page_size)
                .cloned()
                .collect())
        }
    }

    struct StaleSource;

    #[async_trait]
    impl PageSource for StaleSource {
        async fn search_page(&self, request: &PageRequest) -> Result<Vec<RawIndicator>, FeedError> {
            let mut raw = RawIndicator::new("evil.com", "DOMAIN");
            raw.last_seen = Some(request.to_ms + 10);
            Ok(vec![raw])
        }
    }

    fn window() -> TimeWindow {
        TimeWindow::new(1_000, 100_000).unwrap()
    }

    #[tokio::test]
    async fn test_pages_through_all_records_without_duplicates() {
        let timestamps: Vec<i64> = (0..23).map(|i| 90_000 - i * 1_000).collect();
        let source = SyntheticSource::with_timestamps(&timestamps);

        let mut pager = Pager::new(&source, window(), 5);
        let mut seen = HashSet::new();
        let mut total = 0;
        while let Some(page) = pager.next_page().await.unwrap() {
            for record in page {
                total += 1;
                assert!(seen.insert(record.value));
            }
        }

        assert_eq!(total, 23);
        // ceil(23 / 5) + 1
        assert!(pager.queries() <= 6);
        assert_eq!(source.calls.load(Ordering::SeqCst), pager.queries());
    }

    #[tokio::test]
    async fn test_exact_multiple_of_page_size() {
        let timestamps: Vec<i64> = (0..10).map(|i| 50_000 - i * 100).collect();
        let source = SyntheticSource::with_timestamps(&timestamps);

        let mut pager = Pager::new(&source, window(), 5);
        let mut total = 0;
        while let Some(page) = pager.next_page().await.unwrap() {
            total += page.len();
        }
        assert_eq!(total, 10);
        assert!(pager.queries() <= 3);
    }

    #[tokio::test]
    async fn test_stops_when_bound_crosses_from() {
        // The oldest record sits exactly on `from`, so the next bound is below it
        let source = SyntheticSource::with_timestamps(&[5_000, 1_000]);
        let mut pager = Pager::new(&source, window(), 10);

        let page = pager.next_page().await.unwrap().unwrap();
        assert_eq!(page.len(), 2);
        assert!(pager.next_page().await.unwrap().is_none());
        assert_eq!(pager.queries(), 1);
    }

    #[tokio::test]
    async fn test_records_outside_window_are_not_requested() {
        let source = SyntheticSource::with_timestamps(&[500, 100_000, 150_000, 99_999]);
        let all = Pager::new(&source, window(), 10).collect_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].last_seen, Some(99_999));
    }

    #[tokio::test]
    async fn test_cursor_out_of_range_aborts() {
        let mut pager = Pager::new(&StaleSource, window(), 10);
        let err = pager.next_page().await.unwrap_err();
        assert!(matches!(err, FeedError::CursorOutOfRange { .. }));
        assert!(pager.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_yields_same_pages() {
        let timestamps: Vec<i64> = (0..7).map(|i| 60_000 - i * 10).collect();
        let source = SyntheticSource::with_timestamps(&timestamps);

        let pages: Vec<Vec<RawIndicator>> = Pager::new(&source, window(), 3)
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages.iter().map(Vec::len).sum::<usize>(), 7);
    }

    #[tokio::test]
    async fn test_empty_source_uses_one_query() {
        let source = SyntheticSource::with_timestamps(&[]);
        let mut pager = Pager::new(&source, window(), 10);
        assert!(pager.next_page().await.unwrap().is_none());
        assert_eq!(pager.queries(), 1);
    }
}
