//! Error types for chip dispatch

use crate::db::schemas::ChipStatus;

/// Main error type for chip dispatch operations
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Illegal transition for chip {chip_id}: {from} -> {to}")]
    IllegalTransition {
        chip_id: String,
        from: ChipStatus,
        to: ChipStatus,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Reservoir error: {0}")]
    Reservoir(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Notifier error: {0}")]
    Notifier(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Whether the error came from shared infrastructure (store, lock, reservoir)
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Lock(_) | Self::Reservoir(_))
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        Self::Notifier(err.to_string())
    }
}

/// Result type alias for chip dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;
