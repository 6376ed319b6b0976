//! TOML configuration
//!
//! One file holds every source and destination table; each command only
//! requires the tables it uses.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use relay_feeds::{
    EnclaveDirectory, HttpConfig, IndicatorFeed, Misp, MispConfig, TruStarConfig, TruStarV1,
    TruStarV2,
};
use relay_sinks::{
    CrowdStrike, CrowdStrikeConfig, Destination, GraphConfig, InsightIdr, InsightIdrConfig,
    MicrosoftGraph, SentinelOne, SentinelOneConfig, Splunk, SplunkConfig, SumoLogic,
    SumoLogicConfig,
};

use crate::RunError;

/// File looked up when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "ioc-relay.toml";

/// Errors loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file {0} not found")]
    NotFound(PathBuf),

    #[error("Could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Missing config section [{0}]; check the example configuration and try again")]
    MissingSection(&'static str),
}

/// Every table the relay understands
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub http: HttpConfig,
    pub trustar: Option<TruStarConfig>,
    pub trustar2: Option<TruStarConfig>,
    pub misp: Option<MispConfig>,
    pub splunk: Option<SplunkConfig>,
    pub crowdstrike: Option<CrowdStrikeConfig>,
    pub microsoft: Option<GraphConfig>,
    pub sentinelone: Option<SentinelOneConfig>,
    pub insightidr: Option<InsightIdrConfig>,
    pub sumologic: Option<SumoLogicConfig>,
}

fn require<'a, T>(table: &'a Option<T>, name: &'static str) -> Result<&'a T, ConfigError> {
    table.as_ref().ok_or(ConfigError::MissingSection(name))
}

impl RelayConfig {
    /// Load from `path`, or from `ioc-relay.toml` in the working directory
    /// or its parent
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) if path.is_file() => path.to_path_buf(),
            Some(path) => return Err(ConfigError::NotFound(path.to_path_buf())),
            None => Self::locate().ok_or_else(|| ConfigError::NotFound(PathBuf::from(DEFAULT_CONFIG_FILE)))?,
        };
        debug!("Loading config from {}", path.display());

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Self::parse(&text).map_err(|message| ConfigError::Parse { path, message })
    }

    fn locate() -> Option<PathBuf> {
        [
            PathBuf::from(DEFAULT_CONFIG_FILE),
            Path::new("..").join(DEFAULT_CONFIG_FILE),
        ]
        .into_iter()
        .find(|candidate| candidate.is_file())
    }

    /// Parse TOML text
    pub fn parse(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    pub fn require_trustar(&self) -> Result<&TruStarConfig, ConfigError> {
        require(&self.trustar, "trustar")
    }

    pub fn require_trustar2(&self) -> Result<&TruStarConfig, ConfigError> {
        require(&self.trustar2, "trustar2")
    }

    pub fn require_misp(&self) -> Result<&MispConfig, ConfigError> {
        require(&self.misp, "misp")
    }

    pub fn require_splunk(&self) -> Result<&SplunkConfig, ConfigError> {
        require(&self.splunk, "splunk")
    }

    pub fn require_crowdstrike(&self) -> Result<&CrowdStrikeConfig, ConfigError> {
        require(&self.crowdstrike, "crowdstrike")
    }

    pub fn require_microsoft(&self) -> Result<&GraphConfig, ConfigError> {
        require(&self.microsoft, "microsoft")
    }

    pub fn require_sentinelone(&self) -> Result<&SentinelOneConfig, ConfigError> {
        require(&self.sentinelone, "sentinelone")
    }

    pub fn require_insightidr(&self) -> Result<&InsightIdrConfig, ConfigError> {
        require(&self.insightidr, "insightidr")
    }

    pub fn require_sumologic(&self) -> Result<&SumoLogicConfig, ConfigError> {
        require(&self.sumologic, "sumologic")
    }

    /// Build the feed for `source`
    pub fn feed(&self, source: SourceKind, min_calls: bool) -> Result<Box<dyn IndicatorFeed>, RunError> {
        let feed: Box<dyn IndicatorFeed> = match source {
            SourceKind::Trustar2 => Box::new(TruStarV2::new(self.require_trustar2()?.clone(), &self.http)?),
            SourceKind::Trustar => Box::new(
                TruStarV1::new(self.require_trustar()?.clone(), &self.http)?.with_min_calls(min_calls),
            ),
            SourceKind::Misp => Box::new(Misp::new(self.require_misp()?.clone(), &self.http)?),
        };
        Ok(feed)
    }

    /// TruSTAR 1.3 client for the report-centric export
    pub fn report_source(&self, min_calls: bool) -> Result<TruStarV1, RunError> {
        Ok(TruStarV1::new(self.require_trustar()?.clone(), &self.http)?.with_min_calls(min_calls))
    }

    /// Build an enclave directory for either TruSTAR generation
    pub fn enclave_directory(&self, v1: bool) -> Result<Box<dyn EnclaveDirectory>, RunError> {
        if v1 {
            Ok(Box::new(TruStarV1::new(self.require_trustar()?.clone(), &self.http)?))
        } else {
            Ok(Box::new(TruStarV2::new(self.require_trustar2()?.clone(), &self.http)?))
        }
    }

    /// Build the destination client for `kind`
    pub fn destination(&self, kind: DestinationKind) -> Result<Box<dyn Destination>, RunError> {
        let http = &self.http;
        let destination: Box<dyn Destination> = match kind {
            DestinationKind::Splunk => Box::new(Splunk::new(self.require_splunk()?.clone(), http)?),
            DestinationKind::CrowdStrike => {
                Box::new(CrowdStrike::new(self.require_crowdstrike()?.clone(), http)?)
            }
            DestinationKind::Microsoft => {
                Box::new(MicrosoftGraph::new(self.require_microsoft()?.clone(), http)?)
            }
            DestinationKind::SentinelOne => {
                Box::new(SentinelOne::new(self.require_sentinelone()?.clone(), http)?)
            }
            DestinationKind::InsightIdr => {
                Box::new(InsightIdr::new(self.require_insightidr()?.clone(), http)?)
            }
            DestinationKind::SumoLogic => {
                Box::new(SumoLogic::new(self.require_sumologic()?.clone(), http)?)
            }
        };
        Ok(destination)
    }
}

/// Indicator sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Trustar2,
    Trustar,
    Misp,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Trustar2 => "trustar2",
            SourceKind::Trustar => "trustar",
            SourceKind::Misp => "misp",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trustar2" => Ok(SourceKind::Trustar2),
            "trustar" => Ok(SourceKind::Trustar),
            "misp" => Ok(SourceKind::Misp),
            other => Err(format!("unknown source '{}' (expected trustar2, trustar or misp)", other)),
        }
    }
}

/// Delivery destinations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Splunk,
    CrowdStrike,
    Microsoft,
    SentinelOne,
    InsightIdr,
    SumoLogic,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Splunk => "splunk",
            DestinationKind::CrowdStrike => "crowdstrike",
            DestinationKind::Microsoft => "microsoft",
            DestinationKind::SentinelOne => "sentinelone",
            DestinationKind::InsightIdr => "insightidr",
            DestinationKind::SumoLogic => "sumologic",
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DestinationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "splunk" => Ok(DestinationKind::Splunk),
            "crowdstrike" | "falcon" => Ok(DestinationKind::CrowdStrike),
            "microsoft" | "graph" => Ok(DestinationKind::Microsoft),
            "sentinelone" => Ok(DestinationKind::SentinelOne),
            "insightidr" | "rapid7" => Ok(DestinationKind::InsightIdr),
            "sumologic" | "sumo" => Ok(DestinationKind::SumoLogic),
            other => Err(format!("unknown destination '{}'", other)),
        }
    }
}
