//! Common interface for threat-intel feeds

use async_trait::async_trait;
use thiserror::Error;

use relay_core::{NormalizeOptions, RawIndicator, TimeWindow};

use crate::Enclave;

/// Errors from feed operations
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

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

    #[error("Indicator last_seen {last_seen} is outside the queried range (bound {bound})")]
    CursorOutOfRange { last_seen: i64, bound: i64 },

    #[error("Page contained no last_seen timestamps to advance the cursor")]
    MissingWatermark,
}

/// What to pull from a feed
#[derive(Debug, Clone)]
pub struct FeedQuery {
    pub window: TimeWindow,
    /// Enclave ids (TruSTAR); empty means feed default
    pub enclaves: Vec<String>,
    /// Vendor type filter; empty means feed default
    pub types: Vec<String>,
    /// Records per page request
    pub page_size: usize,
}

impl FeedQuery {
    pub fn new(window: TimeWindow) -> Self {
        Self {
            window,
            enclaves: Vec::new(),
            types: Vec::new(),
            page_size: 1000,
        }
    }

    pub fn with_enclaves(mut self, enclaves: Vec<String>) -> Self {
        self.enclaves = enclaves;
        self
    }

    pub fn with_types(mut self, types: Vec<String>) -> Self {
        self.types = types;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

/// Common interface for all indicator feeds
#[async_trait]
pub trait IndicatorFeed: Send + Sync {
    /// Feed name for logs and reports
    fn name(&self) -> &str;

    /// Mapper options for this feed's records
    fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions::default()
    }

    /// Establish a session with the feed
    async fn authenticate(&mut self) -> Result<(), FeedError>;

    /// Pull every record matching `query`
    async fn fetch(&self, query: &FeedQuery) -> Result<Vec<RawIndicator>, FeedError>;
}

/// Feeds that partition indicators into enclaves
#[async_trait]
pub trait EnclaveDirectory: IndicatorFeed {
    /// Enclaves the authenticated user can see
    async fn list_enclaves(&self) -> Result<Vec<Enclave>, FeedError>;
}
