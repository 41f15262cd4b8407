//! Administrative operations on the pool
//!
//! Manual lifecycle moves go through the same edge table and
//! compare-and-set store calls as the automatic cycle, and every action is
//! written to the operation log.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::{CycleReport, PoolOrchestrator, PoolStatus};
use crate::db::schemas::{
    Alert, AlertFilter, Chip, ChipStatus, OperationKind, OperationLog, PoolConfig,
};
use crate::types::{DispatchError, Result};

pub struct PoolAdmin {
    orchestrator: Arc<PoolOrchestrator>,
}

impl PoolAdmin {
    pub fn new(orchestrator: Arc<PoolOrchestrator>) -> Self {
        Self { orchestrator }
    }

    async fn load_chip(&self, chip_id: &str) -> Result<Chip> {
        self.orchestrator
            .store
            .get_chip(chip_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("chip {}", chip_id)))
    }

    async fn apply(
        &self,
        chip: &Chip,
        to: ChipStatus,
        kind: OperationKind,
        reason: &str,
    ) -> Result<Chip> {
        let now = self.orchestrator.clock.now();
        if !self.orchestrator.transition(chip, to, now).await? {
            return Err(DispatchError::BadRequest(format!(
                "chip {} changed status concurrently, retry",
                chip.id
            )));
        }
        self.orchestrator
            .log_operation(
                OperationLog::new(kind, Some(chip.id.clone()), reason, now).with_metadata(
                    serde_json::json!({ "from": chip.status.as_str(), "to": to.as_str() }),
                ),
            )
            .await;
        self.load_chip(&chip.id).await
    }

    /// Move a chip one step forward: provisioned/pending -> warming -> ready -> active
    pub async fn promote(&self, chip_id: &str, reason: &str) -> Result<Chip> {
        let chip = self.load_chip(chip_id).await?;
        let to = match chip.status {
            ChipStatus::Provisioned | ChipStatus::Pending => ChipStatus::Warming,
            ChipStatus::Warming => ChipStatus::Ready,
            ChipStatus::Ready => ChipStatus::Active,
            other => {
                return Err(DispatchError::BadRequest(format!(
                    "chip {} cannot be promoted from {}",
                    chip_id, other
                )))
            }
        };
        self.apply(&chip, to, OperationKind::ManualPromote, reason).await
    }

    /// Pull a chip out of rotation
    pub async fn demote(&self, chip_id: &str, reason: &str) -> Result<Chip> {
        let chip = self.load_chip(chip_id).await?;
        self.apply(&chip, ChipStatus::Degraded, OperationKind::ManualDemote, reason)
            .await
    }

    /// Bring a degraded, banned or cancelled chip back as `pending` or `ready`
    /// with a conservative trust score and a clean failure history
    pub async fn reactivate(&self, chip_id: &str, to: ChipStatus, reason: &str) -> Result<Chip> {
        let chip = self.load_chip(chip_id).await?;
        if !chip.status.is_reactivation(to) {
            return Err(DispatchError::IllegalTransition {
                chip_id: chip.id.clone(),
                from: chip.status,
                to,
            });
        }
        let config = self.orchestrator.store.load_pool_config().await?;
        let now = self.orchestrator.clock.now();
        let store = &self.orchestrator.store;

        // Reset while the chip is still unselectable; the status change goes last
        store
            .set_chip_trust(&chip.id, config.reactivation_trust, now)
            .await?;
        store.snapshot_chip_trust(&chip.id, now).await?;
        store.reset_chip_errors(&chip.id, now).await?;
        store.set_chip_cooldown(&chip.id, None, now).await?;
        self.orchestrator.breaker.reset(&chip.id);

        let moved = match self.orchestrator.transition(&chip, to, now).await {
            Ok(moved) => moved,
            Err(e) => {
                self.restore_trust(&chip, now).await;
                return Err(e);
            }
        };
        if !moved {
            self.restore_trust(&chip, now).await;
            return Err(DispatchError::BadRequest(format!(
                "chip {} changed status concurrently, retry",
                chip.id
            )));
        }

        info!(
            chip_id = %chip.id,
            from = %chip.status,
            to = %to,
            trust = config.reactivation_trust,
            "Chip reactivated"
        );
        self.orchestrator
            .log_operation(
                OperationLog::new(OperationKind::Reactivate, Some(chip.id.clone()), reason, now)
                    .with_metadata(serde_json::json!({
                        "from": chip.status.as_str(),
                        "to": to.as_str(),
                        "previous_trust": chip.trust_score,
                        "trust": config.reactivation_trust,
                    })),
            )
            .await;
        self.load_chip(&chip.id).await
    }

    async fn restore_trust(&self, chip: &Chip, now: DateTime<Utc>) {
        if let Err(e) = self
            .orchestrator
            .store
            .set_chip_trust(&chip.id, chip.trust_score, now)
            .await
        {
            warn!(
                chip_id = %chip.id,
                error = %e,
                "Failed to restore trust after aborted reactivation"
            );
        }
    }

    /// Mark a chip banned or cancelled
    pub async fn retire(&self, chip_id: &str, to: ChipStatus, reason: &str) -> Result<Chip> {
        if !to.is_terminal() {
            return Err(DispatchError::BadRequest(format!(
                "retire target must be banned or cancelled, got {}",
                to
            )));
        }
        let chip = self.load_chip(chip_id).await?;
        let retired = self.apply(&chip, to, OperationKind::Retire, reason).await?;
        self.orchestrator.senders.evict(&chip.id);
        Ok(retired)
    }

    /// Validate and persist a new pool configuration
    pub async fn update_config(&self, config: PoolConfig, reason: &str) -> Result<()> {
        config.validate().map_err(DispatchError::BadRequest)?;
        let metadata = serde_json::to_value(&config)?;
        self.orchestrator.store.save_pool_config(config).await?;
        let now = self.orchestrator.clock.now();
        info!(reason = %reason, "Pool configuration updated");
        self.orchestrator
            .log_operation(
                OperationLog::new(OperationKind::ConfigUpdate, None, reason, now)
                    .with_metadata(metadata),
            )
            .await;
        Ok(())
    }

    pub async fn pool_config(&self) -> Result<PoolConfig> {
        self.orchestrator.store.load_pool_config().await
    }

    /// Run one orchestration cycle now
    pub async fn trigger_cycle(&self) -> Result<CycleReport> {
        self.orchestrator.run_cycle().await
    }

    pub async fn pool_status(&self) -> Result<PoolStatus> {
        self.orchestrator.pool_status().await
    }

    pub async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        self.orchestrator.store.list_alerts(filter).await
    }

    pub async fn resolve_alert(&self, alert_id: Uuid) -> Result<bool> {
        let now = self.orchestrator.clock.now();
        self.orchestrator.store.resolve_alert(alert_id, now).await
    }

    pub async fn operations(
        &self,
        kind: Option<OperationKind>,
        limit: usize,
    ) -> Result<Vec<OperationLog>> {
        self.orchestrator.store.list_operations(kind, limit).await
    }
}
