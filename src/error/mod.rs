//! Error types and handlers for registry and sync operations

pub mod handlers;

use thiserror::Error;

use crate::sync::SyncReport;

pub type Result<T> = std::result::Result<T, SyncerError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncerError {
    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),
    /// Registry type not known to the factory
    #[error("Unsupported registry type: {0}")]
    UnsupportedRegistryType(String),
    /// Credentials rejected by a registry
    #[error("Authentication error: {0}")]
    Auth(String),
    /// Transport failures, unreachable hosts and unexpected statuses
    #[error("Network error: {0}")]
    Network(String),
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// Malformed response body
    #[error("Decode error: {0}")]
    Decode(String),
    /// Operation the backend refuses by contract
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Operation cancelled")]
    Cancelled,
    /// Content store IO errors
    #[error("IO error: {0}")]
    Io(String),
    /// Run-level aggregate failure
    #[error("Sync error: {0}")]
    Sync(String),
}

impl SyncerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncerError::NotFound(_))
    }

    /// Errors a later retry could plausibly clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncerError::Network(_))
    }

    /// Configuration problems are fatal at startup.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            SyncerError::Config(_) | SyncerError::UnsupportedRegistryType(_)
        )
    }

    /// Short category name used in report output
    pub fn kind(&self) -> &'static str {
        match self {
            SyncerError::Config(_) => "config",
            SyncerError::UnsupportedRegistryType(_) => "config",
            SyncerError::Auth(_) => "auth",
            SyncerError::Network(_) => "network",
            SyncerError::NotFound(_) => "not-found",
            SyncerError::Decode(_) => "decode",
            SyncerError::UnsupportedOperation(_) => "unsupported",
            SyncerError::Cancelled => "cancelled",
            SyncerError::Io(_) => "io",
            SyncerError::Sync(_) => "sync",
        }
    }
}

impl From<std::io::Error> for SyncerError {
    fn from(err: std::io::Error) -> Self {
        SyncerError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SyncerError {
    fn from(err: serde_json::Error) -> Self {
        SyncerError::Decode(err.to_string())
    }
}

impl From<serde_yaml::Error> for SyncerError {
    fn from(err: serde_yaml::Error) -> Self {
        SyncerError::Config(format!("invalid YAML: {}", err))
    }
}

impl From<reqwest::Error> for SyncerError {
    fn from(err: reqwest::Error) -> Self {
        handlers::NetworkErrorHandler::handle_network_error(&err, "request")
    }
}

impl From<url::ParseError> for SyncerError {
    fn from(err: url::ParseError) -> Self {
        SyncerError::Decode(format!("invalid URL: {}", err))
    }
}

impl From<regex::Error> for SyncerError {
    fn from(err: regex::Error) -> Self {
        SyncerError::Config(format!("invalid tag filter: {}", err))
    }
}

/// A sync run that finished with a run-level error.
///
/// The partial report is kept so callers can still log every outcome.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SyncFailure {
    pub report: SyncReport,
    #[source]
    pub error: SyncerError,
}
