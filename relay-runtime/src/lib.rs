//! ioc-relay Runtime
//!
//! Ties feeds and destinations together:
//! - TOML configuration and client construction
//! - The staged fetch/normalize/dispatch pipeline

pub mod config;
pub mod pipeline;

pub use config::*;
pub use pipeline::*;
