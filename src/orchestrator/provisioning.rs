//! Provisioning of new sending identities

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::db::schemas::ProviderKind;
use crate::types::Result;

/// Identity handed back by a provisioning backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedIdentity {
    pub phone_number: String,
    pub provider: ProviderKind,
    /// Backend reference (order id, SIM id, ...)
    #[serde(default)]
    pub external_ref: Option<String>,
}

/// Requests new sending identities
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Request up to `count` identities; may return fewer
    async fn provision(&self, count: u32) -> Result<Vec<ProvisionedIdentity>>;
}

/// Hands out identities from a fixed inventory
#[derive(Debug, Default)]
pub struct InventoryProvisioner {
    inventory: Mutex<VecDeque<ProvisionedIdentity>>,
}

impl InventoryProvisioner {
    pub fn new(identities: impl IntoIterator<Item = ProvisionedIdentity>) -> Self {
        Self {
            inventory: Mutex::new(identities.into_iter().collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.inventory.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl Provisioner for InventoryProvisioner {
    async fn provision(&self, count: u32) -> Result<Vec<ProvisionedIdentity>> {
        let mut inventory = self.inventory.lock().unwrap_or_else(|e| e.into_inner());
        let take = (count as usize).min(inventory.len());
        Ok(inventory.drain(..take).collect())
    }
}
