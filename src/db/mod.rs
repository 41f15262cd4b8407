//! Durable storage boundary
//!
//! The [`Store`] trait is the only way services touch persistent rows. Chip
//! mutations are split into field-disjoint operations so that the orchestrator,
//! health monitor, selector and dispatcher can write concurrently without
//! clobbering each other; status changes are compare-and-set on the expected
//! current status.
//!
//! [`InMemoryStore`] backs tests and the standalone binary.

pub mod memory;
pub mod schemas;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use crate::types::Result;
use schemas::{
    Alert, AlertFilter, AlertKind, Chip, ChipStatus, ContactRecord, ConversationBinding,
    DispatchRecord, LedgerEntry, LedgerStatus, OperationKind, OperationLog, PoolConfig,
    QualityTier, ReconcileCandidate, SelectionDecisionLog, TouchAdvance, TouchState, WarmupPhase,
};

/// Filter for listing chips
#[derive(Debug, Clone, Default)]
pub struct ChipFilter {
    /// Empty means any status
    pub statuses: HashSet<ChipStatus>,
    pub connected: Option<bool>,
}

impl ChipFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn status(status: ChipStatus) -> Self {
        Self::statuses([status])
    }

    pub fn statuses(statuses: impl IntoIterator<Item = ChipStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            connected: None,
        }
    }

    pub fn matches(&self, chip: &Chip) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&chip.status))
            && self.connected.map_or(true, |c| c == chip.connected)
    }
}

/// Persistent storage for every row the subsystem owns
#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Chips
    // ------------------------------------------------------------------

    /// Insert a new chip; fails if the id already exists
    async fn insert_chip(&self, chip: Chip) -> Result<()>;

    async fn get_chip(&self, id: &str) -> Result<Option<Chip>>;

    async fn list_chips(&self, filter: &ChipFilter) -> Result<Vec<Chip>>;

    /// Move a chip from `from` to `to` only if it is still in `from`.
    /// Returns false when the chip had already moved.
    async fn transition_chip_status(
        &self,
        id: &str,
        from: ChipStatus,
        to: ChipStatus,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Set trust (already clamped to the trust range)
    async fn set_chip_trust(&self, id: &str, trust: u8, at: DateTime<Utc>) -> Result<()>;

    /// Roll the 24h trust baseline to the current score
    async fn snapshot_chip_trust(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn set_chip_connected(&self, id: &str, connected: bool, at: DateTime<Utc>)
        -> Result<()>;

    async fn set_chip_warmup_phase(
        &self,
        id: &str,
        phase: WarmupPhase,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_chip_quality(&self, id: &str, tier: QualityTier, at: DateTime<Utc>)
        -> Result<()>;

    async fn set_chip_response_rate(&self, id: &str, rate: f64, at: DateTime<Utc>) -> Result<()>;

    async fn set_chip_cooldown(
        &self,
        id: &str,
        until: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Count one successful send against the chip's rate and rolling counters
    async fn record_chip_send(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Count one failed send against the chip's rolling counters
    async fn record_chip_error(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Reset rolling send/error counters
    async fn reset_chip_errors(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    // ------------------------------------------------------------------
    // Conversation bindings and contact history (normalized destinations)
    // ------------------------------------------------------------------

    async fn bind_conversation(&self, binding: ConversationBinding) -> Result<()>;

    async fn conversation_binding(&self, conversation_id: &str)
        -> Result<Option<ConversationBinding>>;

    async fn active_bindings_for_chip(&self, chip_id: &str) -> Result<Vec<ConversationBinding>>;

    /// Atomically move every active binding of `from` to `to`; returns the count
    async fn rebind_conversations(&self, from: &str, to: &str, at: DateTime<Utc>)
        -> Result<usize>;

    async fn record_contact(&self, record: ContactRecord) -> Result<()>;

    /// Contact history for a destination, newest first
    async fn contact_history(&self, destination: &str) -> Result<Vec<ContactRecord>>;

    async fn count_contacts_since(&self, destination: &str, since: DateTime<Utc>) -> Result<u32>;

    // ------------------------------------------------------------------
    // Pool configuration
    // ------------------------------------------------------------------

    async fn load_pool_config(&self) -> Result<PoolConfig>;

    async fn save_pool_config(&self, config: PoolConfig) -> Result<()>;

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    /// Unresolved alert of this kind for this chip (or pool when None)
    async fn find_open_alert(&self, kind: AlertKind, chip_id: Option<&str>)
        -> Result<Option<Alert>>;

    /// Most recent alert of this kind, resolved or not
    async fn latest_alert(&self, kind: AlertKind, chip_id: Option<&str>) -> Result<Option<Alert>>;

    async fn insert_alert(&self, alert: Alert) -> Result<()>;

    /// Refresh the dedup timestamp of an open alert
    async fn touch_alert(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>>;

    /// Returns false if the alert was unknown or already resolved
    async fn resolve_alert(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// Resolve open alerts created before `older_than`; returns the count
    async fn expire_alerts(&self, older_than: DateTime<Utc>, at: DateTime<Utc>) -> Result<usize>;

    // ------------------------------------------------------------------
    // Audit logs
    // ------------------------------------------------------------------

    async fn append_operation(&self, entry: OperationLog) -> Result<()>;

    /// Operation log, newest first, optionally restricted to one kind
    async fn list_operations(
        &self,
        kind: Option<OperationKind>,
        limit: usize,
    ) -> Result<Vec<OperationLog>>;

    async fn record_selection(&self, entry: SelectionDecisionLog) -> Result<()>;

    // ------------------------------------------------------------------
    // Consent and touch attribution
    //
    // Destinations and recipients are keyed by `normalize_destination`,
    // so "+1 555 0100" and "15550100" name the same row.
    // ------------------------------------------------------------------

    async fn is_opted_out(&self, destination: &str) -> Result<bool>;

    async fn record_opt_out(&self, destination: &str, at: DateTime<Utc>) -> Result<()>;

    async fn touch_state(&self, recipient: &str) -> Result<Option<TouchState>>;

    /// Write `candidate` only if no state exists or the stored touch is older
    async fn advance_touch_state(&self, candidate: TouchState) -> Result<TouchAdvance>;

    // ------------------------------------------------------------------
    // Dispatch records
    // ------------------------------------------------------------------

    async fn record_dispatch(&self, record: DispatchRecord) -> Result<()>;

    async fn dispatch_records(&self, request_id: Uuid) -> Result<Vec<DispatchRecord>>;

    /// Delivered messages sent since `since` that have no ledger row
    /// (or only an abandoned one), oldest first
    async fn reconcile_candidates(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReconcileCandidate>>;

    // ------------------------------------------------------------------
    // Reconciliation ledger
    // ------------------------------------------------------------------

    /// Insert a `processing` row. Returns false on unique-key conflict
    /// (a non-reclaimable row already exists).
    async fn claim_ledger(&self, provider_message_id: &str, at: DateTime<Utc>) -> Result<bool>;

    async fn finish_ledger(
        &self,
        provider_message_id: &str,
        status: LedgerStatus,
        detail: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn ledger_entry(&self, provider_message_id: &str) -> Result<Option<LedgerEntry>>;

    /// Flag `processing` rows claimed before `claimed_before` as abandoned
    async fn abandon_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<usize>;

    async fn count_ledger(&self, status: LedgerStatus) -> Result<usize>;
}
