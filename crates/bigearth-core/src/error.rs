//! Error types for the BigEarthNet training workspace.

use thiserror::Error;

use crate::types::Band;

/// Main error type for the workspace.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dataset error
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// A sample or batch did not provide one of the declared bands
    #[error("Missing band {band} in {context}")]
    MissingBand { band: Band, context: String },

    /// A band raster does not have its native spatial resolution
    #[error("Shape mismatch for band {band}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        band: Band,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Model name not present in the registry
    #[error("Unknown model '{0}'")]
    UnknownModel(String),

    /// Model error
    #[error("Model error: {0}")]
    Model(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// Checkpoint persistence error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Collective communication error between workers
    #[error("Distributed error: {0}")]
    Distributed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Specialized Result type for workspace operations.
pub type Result<T> = std::result::Result<T, Error>;
