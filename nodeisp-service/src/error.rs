//! Error types for the service manager.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors reported by a container runtime gateway.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime API rejected the request or could not be reached.
    #[error("runtime API error: {0}")]
    Api(String),

    /// The referenced container, network or exec session does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Reading an output stream failed.
    #[error("stream error: {0}")]
    Stream(String),

    /// The runtime answered with something we cannot interpret.
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// Errors returned by [`crate::Manager`] operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("service not found: {0}")]
    NotFound(String),

    #[error("reconciling {service} timed out after {timeout:?}")]
    Timeout { service: String, timeout: Duration },
}

/// Errors from loading or storing the persisted state snapshot.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file IO error: {0}")]
    Io(#[from] io::Error),

    #[error("state file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
