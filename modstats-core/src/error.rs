//! Error types for modstats-core

use thiserror::Error;

/// Main error type for the modstats-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Preference store error
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Report submission error
    #[error("report error: {0}")]
    Report(String),
}

/// Result type alias for modstats-core
pub type Result<T> = std::result::Result<T, Error>;
