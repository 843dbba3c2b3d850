//! Core types and utilities for BigEarthNet multi-label training.
//!
//! This crate provides the foundational types used across the workspace:
//! Sentinel-2 band definitions, label schemes, the run configuration,
//! the error type and the streaming multi-label metrics accumulator.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use cli::*;
pub use config::*;
pub use error::{Error, Result};
pub use metrics::*;
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::*;
    pub use crate::types::*;
}
