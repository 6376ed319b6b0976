//! Report-centric export
//!
//! Walks the enclave reports in a window and lists every indicator of each
//! report under the report's enclave tags. A report whose tags or indicators
//! cannot be read is skipped; the rest of the export goes on.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{info, warn};

use relay_core::{ReportRow, TagEntry};

use crate::{FeedError, FeedQuery};

/// A report as listed by the report search
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Epoch milliseconds; the search is ordered on it, newest first
    #[serde(default)]
    pub updated: Option<i64>,
}

/// An indicator extracted from a report
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportIndicator {
    pub value: String,
    pub indicator_type: String,
}

/// 1.3 page envelope
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "T: Deserialize<'de>"))]
pub(crate) struct ItemPage<T> {
    #[serde(default)]
    pub items: Vec<T>,
    #[serde(default)]
    pub has_next: bool,
}

/// Where reports, their tags and their indicators come from
#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Reports in the query's enclaves and window
    async fn reports(&self, query: &FeedQuery) -> Result<Vec<Report>, FeedError>;

    /// Enclave tags attached to a report
    async fn report_tags(&self, report_id: &str) -> Result<Vec<TagEntry>, FeedError>;

    async fn report_indicators(
        &self,
        report_id: &str,
        page_size: usize,
    ) -> Result<Vec<ReportIndicator>, FeedError>;
}

/// Rows of a report export and the ids of the reports left out
#[derive(Debug, Default)]
pub struct ReportExport {
    pub rows: Vec<ReportRow>,
    /// Reports written
    pub reports: usize,
    pub skipped: Vec<String>,
}

/// Add a page of reports to `reports`, dropping ids already seen.
///
/// Returns the `to` bound of the next page, or `None` when the search is
/// exhausted.
pub(crate) fn absorb_report_page(
    page: ItemPage<Report>,
    seen: &mut HashSet<String>,
    reports: &mut Vec<Report>,
    from_ms: i64,
) -> Option<i64> {
    let next_to = page.items.last().and_then(|report| report.updated);
    let before = reports.len();
    for report in page.items {
        if seen.insert(report.id.clone()) {
            reports.push(report);
        }
    }

    match next_to {
        Some(to) if page.has_next && reports.len() > before && to > from_ms => Some(to),
        _ => None,
    }
}

/// One row per indicator, all carrying the report's `;`-joined tags
pub fn report_rows(report: &Report, tags: &[TagEntry], indicators: Vec<ReportIndicator>) -> Vec<ReportRow> {
    let joined = tags.iter().filter_map(TagEntry::name).collect::<Vec<_>>().join(";");
    indicators
        .into_iter()
        .map(|indicator| ReportRow {
            report_id: report.id.clone(),
            report_title: report.title.clone(),
            report_tags: joined.clone(),
            indicator_value: indicator.value,
            indicator_type: indicator.indicator_type,
        })
        .collect()
}

async fn rows_for(
    source: &dyn ReportSource,
    report: &Report,
    page_size: usize,
) -> Result<Vec<ReportRow>, FeedError> {
    let tags = source.report_tags(&report.id).await?;
    let indicators = source.report_indicators(&report.id, page_size).await?;
    Ok(report_rows(report, &tags, indicators))
}

/// Collect the rows of every report in the window.
///
/// Only a failure to list the reports is an error.
pub async fn collect_report_rows(
    source: &dyn ReportSource,
    query: &FeedQuery,
) -> Result<ReportExport, FeedError> {
    let reports = source.reports(query).await?;
    let mut export = ReportExport::default();

    for report in &reports {
        info!("Found report {}", report.id);
        match rows_for(source, report, query.page_size).await {
            Ok(rows) => {
                info!("Wrote {} indicators for report", rows.len());
                export.rows.extend(rows);
                export.reports += 1;
            }
            Err(e) => {
                warn!("Can't get IOCs for report {}: {}. Skipping.", report.id, e);
                export.skipped.push(report.id.clone());
            }
        }
    }

    info!("Found {} reports", export.reports);
    Ok(export)
}
