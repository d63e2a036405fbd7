//! Builders
//!
//! Fluent builder patterns for marketplace configuration.

pub mod config;

pub use config::{marketplace_config, MarketplaceConfigBuilder};
