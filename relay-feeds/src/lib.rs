//! ioc-relay Feeds
//!
//! Clients for the upstream indicator sources:
//! - Shared HTTP client factory and OAuth helpers
//! - Descending-watermark pagination
//! - TruSTAR 1.3 and 2.0 APIs, with enclave discovery
//! - TruSTAR 1.3 report walk for report-centric exports
//! - MISP attribute search

pub mod client;
pub mod feed;
pub mod pager;
pub mod enclaves;
pub mod trustar;
pub mod trustar2;
pub mod reports;
pub mod misp;

pub use client::*;
pub use feed::*;
pub use pager::*;
pub use enclaves::*;
pub use trustar::*;
pub use trustar2::*;
pub use reports::*;
pub use misp::*;
