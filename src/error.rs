//! Error types for groundlink

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GroundlinkError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server rejected request: {0}")]
    Rejected(String),

    #[error("Not connected to a server")]
    NotConnected,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Local server error: {0}")]
    LocalServer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GroundlinkError>;
