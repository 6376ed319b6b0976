//! Relay Pipeline
//!
//! One run moves through fixed stages:
//! Init -> Authenticated -> Fetched -> Normalized -> Done.
//! Each destination authenticates and delivers on its own; a failing
//! destination is reported and the rest still run.

use anyhow::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use relay_core::{normalize_all, reclassify, Indicator, NormalizeReport};
use relay_feeds::{FeedError, FeedQuery, IndicatorFeed};
use relay_sinks::{DeliveryReport, Destination, SinkError};

use crate::ConfigError;

/// Stage of a relay run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Authenticated,
    Fetched,
    Normalized,
    Done,
}

impl RunState {
    /// Whether `next` directly follows this stage
    pub fn can_advance_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Init, RunState::Authenticated)
                | (RunState::Authenticated, RunState::Fetched)
                | (RunState::Fetched, RunState::Normalized)
                | (RunState::Normalized, RunState::Done)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Errors from a relay run
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Destination error: {0}")]
    Sink(#[from] SinkError),

    #[error("Invalid stage transition {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },
}

/// What happened at one destination
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DestinationOutcome {
    Delivered { report: DeliveryReport },
    AuthFailed { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DestinationResult {
    pub destination: String,
    #[serde(flatten)]
    pub outcome: DestinationOutcome,
}

impl DestinationResult {
    pub fn is_failure(&self) -> bool {
        match &self.outcome {
            DestinationOutcome::Delivered { report } => !report.is_success(),
            _ => true,
        }
    }
}

/// Summary of a complete run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub source: String,
    /// Records returned by the feed
    pub fetched: usize,
    /// Records that survived normalization
    pub normalized: usize,
    pub skipped: BTreeMap<&'static str, usize>,
    pub destinations: Vec<DestinationResult>,
}

impl RunReport {
    /// True when destinations were attempted and none succeeded
    pub fn all_destinations_failed(&self) -> bool {
        !self.destinations.is_empty() && self.destinations.iter().all(DestinationResult::is_failure)
    }

    pub fn failed_destinations(&self) -> Vec<&str> {
        self.destinations
            .iter()
            .filter(|d| d.is_failure())
            .map(|d| d.destination.as_str())
            .collect()
    }
}

/// A single fetch/normalize/dispatch run
pub struct Pipeline {
    feed: Box<dyn IndicatorFeed>,
    destinations: Vec<Box<dyn Destination>>,
    reclassify: bool,
    state: RunState,
}

impl Pipeline {
    pub fn new(feed: Box<dyn IndicatorFeed>) -> Self {
        Self {
            feed,
            destinations: Vec::new(),
            reclassify: true,
            state: RunState::Init,
        }
    }

    pub fn with_destination(mut self, destination: Box<dyn Destination>) -> Self {
        self.destinations.push(destination);
        self
    }

    pub fn with_destinations(mut self, destinations: Vec<Box<dyn Destination>>) -> Self {
        self.destinations.extend(destinations);
        self
    }

    /// Rewrite domain-shaped URLs as domains after normalization (on by default)
    pub fn with_reclassify(mut self, reclassify: bool) -> Self {
        self.reclassify = reclassify;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn advance(&mut self, next: RunState) -> Result<(), RunError> {
        if !self.state.can_advance_to(next) {
            return Err(RunError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("Run stage {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Authenticate to the feed, fetch the window and normalize the records
    pub async fn collect(&mut self, query: &FeedQuery) -> Result<NormalizeReport, RunError> {
        if self.state != RunState::Init {
            return Err(RunError::InvalidTransition {
                from: self.state,
                to: RunState::Authenticated,
            });
        }

        self.feed.authenticate().await?;
        self.advance(RunState::Authenticated)?;
        info!("Authenticated to {}", self.feed.name());

        let raws = self.feed.fetch(query).await?;
        self.advance(RunState::Fetched)?;
        info!("Fetched {} records from {}", raws.len(), self.feed.name());

        let mut report = normalize_all(&raws, &self.feed.normalize_options());
        if self.reclassify {
            report.indicators = report.indicators.iter().map(reclassify).collect();
        }
        if !report.skipped.is_empty() {
            warn!("{} records skipped during normalization", report.skipped.len());
        }
        self.advance(RunState::Normalized)?;

        Ok(report)
    }

    /// Authenticate to and deliver into every destination in turn
    pub async fn dispatch(&mut self, indicators: &[Indicator]) -> Result<Vec<DestinationResult>, RunError> {
        if self.state != RunState::Normalized {
            return Err(RunError::InvalidTransition {
                from: self.state,
                to: RunState::Done,
            });
        }

        let mut results = Vec::with_capacity(self.destinations.len());
        if indicators.is_empty() {
            info!("No IOCs found. Nothing to do.");
            self.advance(RunState::Done)?;
            return Ok(results);
        }

        for destination in self.destinations.iter_mut() {
            let name = destination.name().to_string();

            if let Err(e) = destination.authenticate().await {
                error!("Authentication to {} failed: {}", name, e);
                results.push(DestinationResult {
                    destination: name,
                    outcome: DestinationOutcome::AuthFailed { reason: e.to_string() },
                });
                continue;
            }

            info!("Delivering {} IOCs to {}", indicators.len(), name);
            let outcome = match destination.deliver(indicators).await {
                Ok(report) => {
                    info!(
                        "{}: {} accepted, {} failed, {} skipped",
                        name,
                        report.accepted,
                        report.failed,
                        report.skipped_total()
                    );
                    DestinationOutcome::Delivered { report }
                }
                Err(e) => {
                    error!("Delivery to {} failed: {}", name, e);
                    DestinationOutcome::Failed { reason: e.to_string() }
                }
            };
            results.push(DestinationResult {
                destination: name,
                outcome,
            });
        }

        self.advance(RunState::Done)?;
        Ok(results)
    }

    /// Full run: collect then dispatch
    pub async fn run(&mut self, query: &FeedQuery) -> anyhow::Result<RunReport> {
        let source = self.feed.name().to_string();
        let normalized = self
            .collect(query)
            .await
            .with_context(|| format!("Collecting IOCs from {}", source))?;

        let destinations = self
            .dispatch(&normalized.indicators)
            .await
            .context("Dispatching IOCs")?;

        Ok(RunReport {
            source,
            fetched: normalized.total(),
            normalized: normalized.indicators.len(),
            skipped: normalized.skip_counts(),
            destinations,
        })
    }
}
