//! Unified error types for Duewatch.

use thiserror::Error;

/// Result type alias using DuewatchError.
pub type Result<T> = std::result::Result<T, DuewatchError>;

#[derive(Error, Debug)]
pub enum DuewatchError {
    // Config errors — fatal at startup, never raised during steady-state scanning
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Deadline store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Deadline not found: {0}")]
    DeadlineNotFound(String),

    // Notification ledger errors
    #[error("Ledger error: {0}")]
    Ledger(String),

    // Dispatch errors
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // Channel errors
    #[error("Channel error: {0}")]
    Channel(String),

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl DuewatchError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn ledger(msg: impl Into<String>) -> Self {
        Self::Ledger(msg.into())
    }

    pub fn dispatch(msg: impl Into<String>) -> Self {
        Self::Dispatch(msg.into())
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }
}
