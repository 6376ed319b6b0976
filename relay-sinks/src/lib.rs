//! ioc-relay Sinks
//!
//! Destination encoders and delivery clients:
//! - Splunk (KV store and Enterprise Security threat intel)
//! - CrowdStrike Falcon
//! - Microsoft Graph security
//! - SentinelOne
//! - Rapid7 InsightIDR
//! - Sumo Logic

pub mod traits;
pub mod splunk;
pub mod crowdstrike;
pub mod graph;
pub mod sentinelone;
pub mod insightidr;
pub mod sumologic;

pub use traits::*;
pub use splunk::{Splunk, SplunkConfig, SplunkMode};
pub use crowdstrike::{CrowdStrike, CrowdStrikeConfig};
pub use graph::{GraphConfig, MicrosoftGraph};
pub use sentinelone::{SentinelOne, SentinelOneConfig};
pub use insightidr::{InsightIdr, InsightIdrConfig};
pub use sumologic::{SumoLogic, SumoLogicConfig};
