//! ioc-relay Core - Indicator model and transforms shared by every feed and sink
//!
//! This crate provides the network-free primitives:
//! - Normalized indicator records and the vendor type vocabulary
//! - Time windows for feed queries
//! - The field mapper (raw feed record -> normalized indicator)
//! - The URL/domain reclassifier
//! - CSV/JSON export

pub mod indicator;
pub mod window;
pub mod normalize;
pub mod classify;
pub mod export;

pub use indicator::*;
pub use window::*;
pub use normalize::*;
pub use classify::*;
pub use export::*;

/// Enclave holding the vetted indicator feed, used when none is configured
pub const VETTED_ENCLAVE_ID: &str = "59cd8570-5dce-4e5b-b09c-9807530a7086";

/// MISP tag marking attributes selected for distribution
pub const VETTED_TAG: &str = "rhisac: vetted";

/// Source label stamped on records pushed downstream
pub const DEFAULT_SOURCE_LABEL: &str = "RH-ISAC Vetted";

/// Default query window in hours
pub const DEFAULT_WINDOW_HOURS: i64 = 24;

/// Indicator types searched when the caller gives no type filter
pub const DEFAULT_SEARCH_TYPES: &[&str] = &[
    "IP4",
    "IP6",
    "DOMAIN",
    "CIDR_BLOCK",
    "EMAIL_ADDRESS",
    "PHONE_NUMBER",
    "URL",
    "MD5",
    "SHA1",
    "SHA256",
    "REGISTRY_KEY",
    "SOFTWARE",
    "BITCOIN_ADDRESS",
];
