//! Error types shared across SDP crates

use thiserror::Error;

/// Result type alias for SDP operations
pub type Result<T> = std::result::Result<T, SdpError>;

/// Errors common to every SDP component
#[derive(Error, Debug)]
pub enum SdpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl SdpError {
    /// Configuration error with context
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
