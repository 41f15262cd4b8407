//! Per-chip sender lookup

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::{Sender, SenderError, SenderFactory};
use crate::db::schemas::{Chip, ProviderKind};

/// Caches one sender per chip, built by the factory for the chip's provider
#[derive(Default)]
pub struct SenderRegistry {
    factories: DashMap<ProviderKind, Arc<dyn SenderFactory>>,
    senders: DashMap<String, Arc<dyn Sender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_factory(&self, factory: Arc<dyn SenderFactory>) {
        self.factories.insert(factory.provider(), factory);
    }

    /// Pin an explicit sender to a chip, bypassing the factory
    pub fn insert(&self, chip_id: impl Into<String>, sender: Arc<dyn Sender>) {
        self.senders.insert(chip_id.into(), sender);
    }

    /// Drop the cached sender (e.g. after the chip is retired)
    pub fn evict(&self, chip_id: &str) {
        self.senders.remove(chip_id);
    }

    pub fn sender_for(&self, chip: &Chip) -> Result<Arc<dyn Sender>, SenderError> {
        if let Some(sender) = self.senders.get(&chip.id) {
            return Ok(sender.clone());
        }
        let factory = self
            .factories
            .get(&chip.provider)
            .map(|f| f.clone())
            .ok_or_else(|| {
                SenderError::Provider(format!(
                    "no sender factory for provider {}",
                    chip.provider.as_str()
                ))
            })?;
        let sender = factory.create(chip)?;
        debug!(chip_id = %chip.id, provider = chip.provider.as_str(), "Created sender");
        Ok(self
            .senders
            .entry(chip.id.clone())
            .or_insert(sender)
            .clone())
    }
}
