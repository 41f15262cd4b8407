//! Sender that logs instead of delivering

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::{ConnectionStatus, MediaKind, SendReceipt, Sender, SenderError, SenderFactory};
use crate::db::schemas::{Chip, ProviderKind};

/// Accepts every message and returns a synthetic provider id
pub struct DryRunSender {
    chip_id: String,
    provider: ProviderKind,
}

impl DryRunSender {
    pub fn new(chip_id: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            chip_id: chip_id.into(),
            provider,
        }
    }

    fn receipt(&self) -> SendReceipt {
        SendReceipt {
            message_id: format!("dry-{}", Uuid::new_v4()),
        }
    }
}

#[async_trait]
impl Sender for DryRunSender {
    fn provider(&self) -> ProviderKind {
        self.provider
    }

    async fn send_text(&self, destination: &str, body: &str) -> Result<SendReceipt, SenderError> {
        let receipt = self.receipt();
        info!(
            chip_id = %self.chip_id,
            destination = %destination,
            chars = body.chars().count(),
            message_id = %receipt.message_id,
            "[dry-run] text"
        );
        Ok(receipt)
    }

    async fn send_media(
        &self,
        destination: &str,
        url: &str,
        _caption: Option<&str>,
        kind: MediaKind,
    ) -> Result<SendReceipt, SenderError> {
        let receipt = self.receipt();
        info!(
            chip_id = %self.chip_id,
            destination = %destination,
            url = %url,
            kind = ?kind,
            message_id = %receipt.message_id,
            "[dry-run] media"
        );
        Ok(receipt)
    }

    async fn status(&self) -> Result<ConnectionStatus, SenderError> {
        Ok(ConnectionStatus::connected())
    }
}

/// Factory producing [`DryRunSender`]s for one provider kind
pub struct DryRunSenderFactory {
    provider: ProviderKind,
}

impl DryRunSenderFactory {
    pub fn new(provider: ProviderKind) -> Self {
        Self { provider }
    }
}

impl SenderFactory for DryRunSenderFactory {
    fn provider(&self) -> ProviderKind {
        self.provider
    }

    fn create(&self, chip: &Chip) -> Result<Arc<dyn Sender>, SenderError> {
        Ok(Arc::new(DryRunSender::new(chip.id.clone(), self.provider)))
    }
}
