//! Common traits for indicator destinations

use async_trait::async_trait;
use reqwest::Response;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

use relay_core::Indicator;
use relay_feeds::FeedError;

/// Errors from destination operations
#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Http(#[from] FeedError),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not authenticated; call authenticate() first")]
    NotAuthenticated,

    #[error("Unexpected HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Could not decode response: {0}")]
    Decode(String),

    #[error("Invalid destination configuration: {0}")]
    Config(String),
}

/// How one submitted batch fared
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    Accepted {
        count: usize,
    },
    Rejected {
        count: usize,
        status: Option<u16>,
        reason: String,
    },
    /// Rejected once, then accepted after removing `removed` entries
    Resubmitted {
        removed: usize,
        count: usize,
    },
}

/// Result of delivering a set of indicators to one destination
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryReport {
    pub destination: String,
    pub submitted: usize,
    pub accepted: usize,
    pub failed: usize,
    pub batches: Vec<BatchOutcome>,
    /// Indicators not sent, by reason
    pub skipped: BTreeMap<String, usize>,
}

impl DeliveryReport {
    pub fn new(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            ..Default::default()
        }
    }

    /// Record a batch outcome and update the counters
    pub fn record(&mut self, outcome: BatchOutcome) {
        match &outcome {
            BatchOutcome::Accepted { count } => {
                self.submitted += count;
                self.accepted += count;
            }
            BatchOutcome::Rejected { count, .. } => {
                self.submitted += count;
                self.failed += count;
            }
            BatchOutcome::Resubmitted { removed, count } => {
                self.submitted += removed + count;
                self.accepted += count;
                *self.skipped.entry("duplicate".to_string()).or_insert(0) += removed;
            }
        }
        self.batches.push(outcome);
    }

    /// Count an indicator the destination cannot take
    pub fn skip(&mut self, reason: &str) {
        *self.skipped.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }

    /// No batch was rejected
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Common interface for all destinations.
///
/// A destination owns its session: `authenticate` creates it and it lives
/// until the destination is dropped.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Destination name for logs and reports
    fn name(&self) -> &str;

    /// Establish a session with the destination
    async fn authenticate(&mut self) -> Result<(), SinkError>;

    /// Encode and submit indicators; per-batch failures land in the report
    async fn deliver(&mut self, indicators: &[Indicator]) -> Result<DeliveryReport, SinkError>;
}

/// Human diagnostic for an HTTP status returned by a destination
pub fn describe_status(status: u16) -> &'static str {
    match status {
        200 | 201 => "Accepted",
        301 => "Looks like things moved; the endpoint URL may be outdated",
        400 => "Bad request; the destination rejected the payload",
        401 => "Credential error; check your API credentials and try again",
        403 => "This operation is not allowed for your account type or the user lacks the required role",
        404 => "Resource not found",
        405 => "Unsupported method for URL",
        415 => "Invalid content type",
        429 => "API rate limit encountered",
        500 => "Internal error, please try again later",
        503 => "Service unavailable, try again later",
        _ => "Unknown status code",
    }
}

/// Judge a submit response: any status in `accepted` accepts the batch
pub async fn batch_outcome(response: Response, accepted: &[u16], count: usize) -> BatchOutcome {
    let status = response.status().as_u16();
    if accepted.contains(&status) {
        return BatchOutcome::Accepted { count };
    }
    let body = response.text().await.unwrap_or_default();
    warn!("{} (HTTP {}): {}", describe_status(status), status, body);
    BatchOutcome::Rejected {
        count,
        status: Some(status),
        reason: body,
    }
}

/// A batch that never got a response
pub fn transport_failure(err: &reqwest::Error, count: usize) -> BatchOutcome {
    warn!("Request failed: {}", err);
    BatchOutcome::Rejected {
        count,
        status: None,
        reason: err.to_string(),
    }
}

/// Split `items` into chunks of at most `size`
pub fn batches<T>(items: &[T], size: usize) -> impl Iterator<Item = &[T]> {
    items.chunks(size.max(1))
}
