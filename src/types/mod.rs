//! Marketplace Types
//!
//! Token and configuration type definitions.

pub mod config;
pub mod token;

pub use config::*;
pub use token::*;
