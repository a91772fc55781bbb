//! Error types for Palisade core infrastructure

use thiserror::Error;

/// Result type alias using Palisade's core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types with helpful messages
#[derive(Error, Debug)]
pub enum Error {
    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown configuration key: {0}. Run `palisade config show` to see all keys.")]
    UnknownConfigKey(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Key errors (E900-E999)
    #[error("Invalid trusted key: {0}")]
    InvalidKey(String),

    // Generic errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "E600",
            Self::UnknownConfigKey(_) => "E601",
            Self::InvalidInput(_) => "E800",
            Self::InvalidKey(_) => "E900",
            Self::Serialization(_) => "E9998",
            Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::UnknownConfigKey(_) => Some("palisade config show".to_string()),
            Self::InvalidKey(_) => Some("palisade keygen --out <dir>".to_string()),
            _ => None,
        }
    }
}
