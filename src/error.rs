use thiserror::Error;

use crate::duration::DurationError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no available agent")]
    NoAvailableAgent,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    AlreadyRegistered(String),
}

/// Per-command failures on the agent. Each one is reported inline in the
/// reply's `err` field and never ends the session.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to parse timeout: {0}")]
    Timeout(#[from] DurationError),

    #[error("failed to create request: invalid method {0:?}")]
    InvalidMethod(String),

    #[error("failed to create request: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("failed to create request: {0}")]
    Build(reqwest::Error),

    #[error("failed to do request: {0}")]
    Transport(reqwest::Error),

    #[error("failed to read response body: {0}")]
    BodyRead(reqwest::Error),

    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode result: {0}")]
    Json(#[from] serde_json::Error),
}
