//! Error types for the Zonelimit service.

use thiserror::Error;

/// Main error type for Zonelimit operations.
#[derive(Error, Debug)]
pub enum ZonelimitError {
    /// Configuration-related errors, fatal at startup or reload
    #[error("Configuration error: {0}")]
    Config(String),

    /// A zone's arena could not fit a new record, even after a forced sweep
    #[error("could not allocate record in zone \"{zone}\"")]
    Capacity {
        /// Name of the exhausted zone
        zone: String,
    },

    /// Rules document could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Layered service settings could not be loaded
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ZonelimitError {
    /// Shorthand for building a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        ZonelimitError::Config(msg.into())
    }
}

/// Result type alias for Zonelimit operations.
pub type Result<T> = std::result::Result<T, ZonelimitError>;
