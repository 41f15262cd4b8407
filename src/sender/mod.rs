//! Sender abstraction
//!
//! One [`Sender`] per chip speaks to the chip's messaging backend. Concrete
//! transports live outside this crate; they are plugged in through a
//! [`SenderFactory`] per [`ProviderKind`] and looked up via the
//! [`SenderRegistry`].
//!
//! - `dry_run` - logs instead of sending, for local operation
//! - `mock` - scriptable sender for tests

pub mod dry_run;
pub mod mock;
pub mod registry;

pub use dry_run::{DryRunSender, DryRunSenderFactory};
pub use mock::{MockSender, MockSenderFactory};
pub use registry::SenderRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::schemas::{Chip, DispatchOutcome, ProviderKind};

/// Errors surfaced by a sender, already classified at the boundary
#[derive(Debug, Clone, thiserror::Error)]
pub enum SenderError {
    /// Provider throttled this chip
    #[error("Rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Provider-side breaker or account block rejected the send
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Chip session is not connected
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Any other provider failure
    #[error("Provider error: {0}")]
    Provider(String),
}

impl SenderError {
    /// Terminal dispatch outcome for this failure
    pub fn outcome(&self) -> DispatchOutcome {
        match self {
            SenderError::RateLimited { .. } => DispatchOutcome::FailedRateLimit,
            SenderError::CircuitOpen(_) => DispatchOutcome::FailedCircuitOpen,
            SenderError::Disconnected(_) | SenderError::Provider(_) => {
                DispatchOutcome::FailedProvider
            }
        }
    }
}

/// Provider acknowledgement of an accepted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Provider message id, the reconciliation key
    pub message_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
}

/// Session state reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    /// Backend-specific state label (e.g. "open", "qr_pending")
    pub state: String,
}

impl ConnectionStatus {
    pub fn connected() -> Self {
        Self {
            connected: true,
            state: "open".to_string(),
        }
    }

    pub fn disconnected(state: impl Into<String>) -> Self {
        Self {
            connected: false,
            state: state.into(),
        }
    }
}

/// Messaging capability of one chip
#[async_trait]
pub trait Sender: Send + Sync {
    fn provider(&self) -> ProviderKind;

    async fn send_text(&self, destination: &str, body: &str) -> Result<SendReceipt, SenderError>;

    async fn send_media(
        &self,
        destination: &str,
        url: &str,
        caption: Option<&str>,
        kind: MediaKind,
    ) -> Result<SendReceipt, SenderError>;

    async fn status(&self) -> Result<ConnectionStatus, SenderError>;
}

/// Builds senders for one provider kind
pub trait SenderFactory: Send + Sync {
    fn provider(&self) -> ProviderKind;

    fn create(&self, chip: &Chip) -> Result<Arc<dyn Sender>, SenderError>;
}
