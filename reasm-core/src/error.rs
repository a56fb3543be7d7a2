#![forbid(unsafe_code)]

//! Common error type for reassembly crates.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReasmError {
    /// I/O related failures.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parsing failures.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration serialization failures.
    #[error("Config encode error: {0}")]
    ConfigEncode(#[from] toml::ser::Error),

    /// Configuration values that parse but cannot be used together.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenient alias for results throughout the reassembly crates.
pub type ReasmResult<T> = Result<T, ReasmError>;
