//! Multiclaw error types

use thiserror::Error;

/// Multiclaw error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Agent protocol or process error
    #[error("Agent error: {0}")]
    Agent(String),

    /// Request attempted against an agent without a live process
    #[error("Agent {0} is offline")]
    AgentOffline(String),

    /// No response arrived within the request window
    #[error("Agent request timed out: {command}")]
    Timeout {
        /// Command type of the request that timed out
        command: String,
    },

    /// Channel error
    #[error("Channel error: {0}")]
    Channel(String),

    /// Gateway error
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Multiclaw operations
pub type Result<T> = std::result::Result<T, Error>;
