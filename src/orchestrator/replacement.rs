//! Replacement of degraded chips
//!
//! A chip needs replacing when it is active but below the degraded trust
//! floor or disconnected, or when it is already degraded yet still carries
//! conversations. The best ready chip takes over: it is promoted to active,
//! the source's conversations are rebound to it in one store call, and the
//! source ends up degraded.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::{sort_by_trust, CycleReport, PoolOrchestrator};
use crate::db::schemas::{
    AlertKind, Chip, ChipStatus, OperationKind, OperationLog, PoolConfig, Severity,
};
use crate::db::ChipFilter;
use crate::notify::{notify_best_effort, Notification};
use crate::selector::is_replacement_candidate;
use crate::types::{DispatchError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplacementRecord {
    pub from: String,
    pub to: String,
    pub rebound: usize,
}

impl PoolOrchestrator {
    /// Chips that must hand their traffic to a ready chip, with the reason
    pub(crate) async fn replacement_needed(
        &self,
        config: &PoolConfig,
    ) -> Result<Vec<(Chip, String)>> {
        let mut needed = Vec::new();

        let active = self
            .store
            .list_chips(&ChipFilter::status(ChipStatus::Active))
            .await?;
        for chip in active {
            if chip.trust_score < config.trust_degraded {
                let reason = format!(
                    "trust {} below degraded floor {}",
                    chip.trust_score, config.trust_degraded
                );
                needed.push((chip, reason));
            } else if !chip.connected {
                needed.push((chip, "disconnected".to_string()));
            }
        }

        let degraded = self
            .store
            .list_chips(&ChipFilter::status(ChipStatus::Degraded))
            .await?;
        for chip in degraded {
            let bound = self.store.active_bindings_for_chip(&chip.id).await?.len();
            if bound > 0 {
                let reason = format!("degraded with {} bound conversations", bound);
                needed.push((chip, reason));
            }
        }
        Ok(needed)
    }

    pub(crate) async fn replace_degraded(
        &self,
        config: &PoolConfig,
        report: &mut CycleReport,
    ) -> Result<()> {
        let needed = self.replacement_needed(config).await?;
        if needed.is_empty() {
            return Ok(());
        }

        let mut ready: Vec<Chip> = self
            .store
            .list_chips(&ChipFilter::status(ChipStatus::Ready))
            .await?
            .into_iter()
            .filter(|c| is_replacement_candidate(c, config, &self.breaker))
            .collect();
        sort_by_trust(&mut ready);
        let mut ready = ready.into_iter();

        let now = self.clock.now();
        let mut first_error = None;
        for (source, reason) in needed {
            let Some(replacement) = ready.next() else {
                warn!(chip_id = %source.id, reason = %reason, "No ready chip for replacement");
                let message = format!(
                    "chip {} needs replacing ({}) but no ready chip exists",
                    source.id, reason
                );
                self.raise_alert(
                    Some(&source.id),
                    AlertKind::ReplacementUnavailable,
                    Severity::Critical,
                    message,
                    now,
                )
                .await;
                report.unreplaced.push(source.id.clone());
                continue;
            };

            match self.replace_one(&source, &replacement, &reason, now).await {
                Ok(record) => report.replaced.push(record),
                Err(e) => {
                    warn!(
                        from = %source.id,
                        to = %replacement.id,
                        error = %e,
                        "Replacement failed"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn replace_one(
        &self,
        source: &Chip,
        replacement: &Chip,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ReplacementRecord> {
        if !self.transition(replacement, ChipStatus::Active, now).await? {
            return Err(DispatchError::Store(format!(
                "replacement {} left ready before promotion",
                replacement.id
            )));
        }

        let rebound = self
            .store
            .rebind_conversations(&source.id, &replacement.id, now)
            .await?;

        if source.status == ChipStatus::Active {
            self.transition(source, ChipStatus::Degraded, now).await?;
        }

        info!(
            from = %source.id,
            to = %replacement.id,
            rebound,
            reason = %reason,
            "Degraded chip replaced"
        );
        self.log_operation(
            OperationLog::new(
                OperationKind::AutoReplace,
                Some(source.id.clone()),
                reason,
                now,
            )
            .with_related(replacement.id.clone())
            .with_metadata(serde_json::json!({
                "rebound_conversations": rebound,
                "source_trust": source.trust_score,
                "replacement_trust": replacement.trust_score,
            })),
        )
        .await;

        let n = Notification::new("Chip replaced", Severity::Warning)
            .line(format!(
                "{} -> {} ({}), {} conversations moved",
                source.id, replacement.id, reason, rebound
            ))
            .for_chip(source.id.clone());
        notify_best_effort(self.notifier.as_ref(), n).await;

        Ok(ReplacementRecord {
            from: source.id.clone(),
            to: replacement.id.clone(),
            rebound,
        })
    }
}
