//! Touch reconciliation
//!
//! Repairs recipient touch attribution from already-sent messages. Each
//! candidate is claimed through a unique ledger row keyed by provider message
//! id, so overlapping runs and retries never apply the same message twice.
//! Touch state only moves forward, which makes the outcome independent of
//! candidate order.

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::db::schemas::{LedgerStatus, ReconcileCandidate, TouchAdvance, TouchState};
use crate::db::Store;
use crate::types::Result;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Only messages sent within this window are considered
    pub lookback: ChronoDuration,
    pub batch_size: usize,
    /// Claims stuck in `processing` longer than this are abandoned
    pub claim_timeout: ChronoDuration,
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            lookback: ChronoDuration::hours(48),
            batch_size: 200,
            claim_timeout: ChronoDuration::minutes(10),
            interval: Duration::from_secs(300),
        }
    }
}

/// Per-status counts of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub ok: usize,
    pub skipped_no_change: usize,
    pub skipped_already_newer: usize,
    pub skipped_already_processed: usize,
    pub failed: usize,
    /// Stuck claims flagged abandoned before the batch ran
    pub abandoned: usize,
}

impl ReconcileReport {
    pub fn processed(&self) -> usize {
        self.ok
            + self.skipped_no_change
            + self.skipped_already_newer
            + self.skipped_already_processed
            + self.failed
    }

    fn count(&mut self, status: LedgerStatus) {
        match status {
            LedgerStatus::Ok => self.ok += 1,
            LedgerStatus::SkippedNoChange => self.skipped_no_change += 1,
            LedgerStatus::SkippedAlreadyNewer => self.skipped_already_newer += 1,
            LedgerStatus::SkippedAlreadyProcessed => self.skipped_already_processed += 1,
            LedgerStatus::Failed => self.failed += 1,
            LedgerStatus::Processing | LedgerStatus::Abandoned => {}
        }
    }
}

pub struct TouchReconciler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
}

impl TouchReconciler {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: ReconcilerConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Sweep stuck claims, then reconcile the next batch of sent messages
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let abandoned = self.reclaim_stuck_claims().await?;
        let since = self.clock.now() - self.config.lookback;
        let candidates = self
            .store
            .reconcile_candidates(since, self.config.batch_size)
            .await?;

        let mut report = self.reconcile_batch(&candidates).await;
        report.abandoned = abandoned;

        if report.processed() > 0 || abandoned > 0 {
            info!(
                ok = report.ok,
                no_change = report.skipped_no_change,
                already_newer = report.skipped_already_newer,
                already_processed = report.skipped_already_processed,
                failed = report.failed,
                abandoned,
                "Touch reconciliation pass complete"
            );
        }
        Ok(report)
    }

    /// Reconcile candidates in the given order. Per-item failures are recorded
    /// in the ledger and never stop the batch.
    pub async fn reconcile_batch(&self, candidates: &[ReconcileCandidate]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for candidate in candidates {
            report.count(self.reconcile_one(candidate).await);
        }
        report
    }

    async fn reconcile_one(&self, candidate: &ReconcileCandidate) -> LedgerStatus {
        let id = candidate.provider_message_id.as_str();
        let now = self.clock.now();

        match self.store.claim_ledger(id, now).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(provider_message_id = %id, "Already reconciled");
                return LedgerStatus::SkippedAlreadyProcessed;
            }
            Err(e) => {
                warn!(provider_message_id = %id, error = %e, "Ledger claim failed");
                return LedgerStatus::Failed;
            }
        }

        let touch = TouchState {
            recipient: candidate.recipient.clone(),
            last_touch_at: candidate.sent_at,
            method: candidate.method,
            campaign_id: candidate.campaign_id.clone(),
            chip_id: candidate.chip_id.clone(),
        };
        let (status, detail) = match self.store.advance_touch_state(touch).await {
            Ok(TouchAdvance::Advanced) => (LedgerStatus::Ok, None),
            Ok(TouchAdvance::AlreadyNewer) => (LedgerStatus::SkippedAlreadyNewer, None),
            Ok(TouchAdvance::Unchanged) => (LedgerStatus::SkippedNoChange, None),
            Err(e) => {
                warn!(provider_message_id = %id, error = %e, "Touch update failed");
                (LedgerStatus::Failed, Some(e.to_string()))
            }
        };

        if let Err(e) = self
            .store
            .finish_ledger(id, status, detail, self.clock.now())
            .await
        {
            // Row stays processing; the stuck-claim sweep picks it up
            warn!(provider_message_id = %id, error = %e, "Failed to finish ledger row");
        }
        debug!(provider_message_id = %id, status = status.as_str(), "Candidate reconciled");
        status
    }

    /// Flag claims stuck in `processing` as abandoned; returns how many
    pub async fn reclaim_stuck_claims(&self) -> Result<usize> {
        let now = self.clock.now();
        let abandoned = self
            .store
            .abandon_stale_claims(now - self.config.claim_timeout, now)
            .await?;
        if abandoned > 0 {
            warn!(abandoned, "Abandoned stuck reconciliation claims");
        }
        Ok(abandoned)
    }

    /// Abandoned ledger rows awaiting a new claim
    pub async fn abandoned_claims(&self) -> Result<usize> {
        self.store.count_ledger(LedgerStatus::Abandoned).await
    }
}

/// Run the reconciler on its interval until the task is aborted
pub fn spawn_reconciler_task(reconciler: Arc<TouchReconciler>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = reconciler.config().interval;
        info!(interval_secs = interval.as_secs(), "Touch reconciler started");
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = reconciler.run_once().await {
                error!(error = %e, "Reconciliation pass failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::schemas::MessageType;
    use crate::db::InMemoryStore;
    use chrono::{DateTime, TimeZone, Utc};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 10, 9, 0, 0).unwrap()
    }

    fn candidate(id: &str, recipient: &str, sent_at: DateTime<Utc>) -> ReconcileCandidate {
        ReconcileCandidate {
            provider_message_id: id.to_string(),
            recipient: recipient.to_string(),
            sent_at,
            method: MessageType::Prospecting,
            campaign_id: None,
            chip_id: Some("chip-a".to_string()),
        }
    }

    #[tokio::test]
    async fn test_stuck_claim_is_abandoned_and_reclaimed() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(InMemoryStore::new());
        let reconciler =
            TouchReconciler::new(store.clone(), clock.clone(), ReconcilerConfig::default());

        assert!(store.claim_ledger("m-1", start()).await.unwrap());
        clock.advance(ChronoDuration::minutes(11));

        assert_eq!(reconciler.reclaim_stuck_claims().await.unwrap(), 1);
        assert_eq!(reconciler.abandoned_claims().await.unwrap(), 1);

        let report = reconciler
            .reconcile_batch(&[candidate("m-1", "15550001", start())])
            .await;
        assert_eq!(report.ok, 1);
        let row = store.ledger_entry("m-1").await.unwrap().unwrap();
        assert_eq!(row.status, LedgerStatus::Ok);
        assert_eq!(row.claims, 2);
        assert_eq!(reconciler.abandoned_claims().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_recipient_fails_without_stopping_batch() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(InMemoryStore::new());
        let reconciler = TouchReconciler::new(store.clone(), clock, ReconcilerConfig::default());

        let report = reconciler
            .reconcile_batch(&[
                candidate("m-1", " ", start()),
                candidate("m-2", "15550002", start()),
            ])
            .await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.ok, 1);
        assert_eq!(
            store.ledger_entry("m-1").await.unwrap().unwrap().status,
            LedgerStatus::Failed
        );
    }
}
