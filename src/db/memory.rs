//! In-memory store
//!
//! Process-local implementation of [`Store`]. Unique-key semantics match what
//! a durable backend provides: chip ids and ledger message ids are primary
//! keys, and touch updates are compare-and-set under the row's shard lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::schemas::{
    Alert, AlertFilter, AlertKind, Chip, ChipStatus, ContactRecord, ConversationBinding,
    DispatchRecord, LedgerEntry, LedgerStatus, OperationKind, OperationLog, OptOut, PoolConfig,
    QualityTier, ReconcileCandidate, SelectionDecisionLog, TouchAdvance, TouchState, WarmupPhase,
};
use super::schemas::normalize_destination;
use super::{ChipFilter, Store};
use crate::types::{DispatchError, Result};

/// Selection decisions kept before the oldest are dropped
const SELECTION_LOG_CAPACITY: usize = 10_000;

/// In-memory store
pub struct InMemoryStore {
    chips: DashMap<String, Chip>,
    bindings: RwLock<HashMap<String, ConversationBinding>>,
    contacts: RwLock<Vec<ContactRecord>>,
    pool_config: RwLock<PoolConfig>,
    alerts: RwLock<Vec<Alert>>,
    operations: RwLock<Vec<OperationLog>>,
    selections: RwLock<VecDeque<SelectionDecisionLog>>,
    opt_outs: DashMap<String, OptOut>,
    touches: DashMap<String, TouchState>,
    dispatches: RwLock<Vec<DispatchRecord>>,
    ledger: DashMap<String, LedgerEntry>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        Self {
            chips: DashMap::new(),
            bindings: RwLock::new(HashMap::new()),
            contacts: RwLock::new(Vec::new()),
            pool_config: RwLock::new(config),
            alerts: RwLock::new(Vec::new()),
            operations: RwLock::new(Vec::new()),
            selections: RwLock::new(VecDeque::new()),
            opt_outs: DashMap::new(),
            touches: DashMap::new(),
            dispatches: RwLock::new(Vec::new()),
            ledger: DashMap::new(),
        }
    }

    /// Number of persisted dispatch records
    pub async fn dispatch_count(&self) -> usize {
        self.dispatches.read().await.len()
    }

    /// All persisted dispatch records, oldest first
    pub async fn all_dispatches(&self) -> Vec<DispatchRecord> {
        self.dispatches.read().await.clone()
    }

    /// Recorded selection decisions, oldest first
    pub async fn selection_log(&self) -> Vec<SelectionDecisionLog> {
        self.selections.read().await.iter().cloned().collect()
    }

    fn update_chip<F>(&self, id: &str, at: DateTime<Utc>, f: F) -> Result<()>
    where
        F: FnOnce(&mut Chip),
    {
        let mut chip = self
            .chips
            .get_mut(id)
            .ok_or_else(|| DispatchError::NotFound(format!("chip {}", id)))?;
        f(&mut chip);
        chip.updated_at = at;
        Ok(())
    }
}

fn alert_matches(alert: &Alert, kind: AlertKind, chip_id: Option<&str>) -> bool {
    alert.kind == kind && alert.chip_id.as_deref() == chip_id
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_chip(&self, chip: Chip) -> Result<()> {
        match self.chips.entry(chip.id.clone()) {
            Entry::Occupied(_) => Err(DispatchError::BadRequest(format!(
                "chip {} already exists",
                chip.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(chip);
                Ok(())
            }
        }
    }

    async fn get_chip(&self, id: &str) -> Result<Option<Chip>> {
        Ok(self.chips.get(id).map(|c| c.clone()))
    }

    async fn list_chips(&self, filter: &ChipFilter) -> Result<Vec<Chip>> {
        let mut chips: Vec<Chip> = self
            .chips
            .iter()
            .filter(|c| filter.matches(c.value()))
            .map(|c| c.value().clone())
            .collect();
        chips.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(chips)
    }

    async fn transition_chip_status(
        &self,
        id: &str,
        from: ChipStatus,
        to: ChipStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut chip = self
            .chips
            .get_mut(id)
            .ok_or_else(|| DispatchError::NotFound(format!("chip {}", id)))?;
        if chip.status != from {
            return Ok(false);
        }
        chip.status = to;
        chip.status_changed_at = at;
        chip.updated_at = at;
        if to == ChipStatus::Warming {
            chip.warmup_started_at = Some(at);
            chip.warmup_phase = WarmupPhase::Initial;
        }
        Ok(true)
    }

    async fn set_chip_trust(&self, id: &str, trust: u8, at: DateTime<Utc>) -> Result<()> {
        self.update_chip(id, at, |chip| chip.trust_score = trust.min(100))
    }

    async fn snapshot_chip_trust(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_chip(id, at, |chip| chip.trust_score_24h_ago = Some(chip.trust_score))
    }

    async fn set_chip_connected(
        &self,
        id: &str,
        connected: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update_chip(id, at, |chip| chip.connected = connected)
    }

    async fn set_chip_warmup_phase(
        &self,
        id: &str,
        phase: WarmupPhase,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update_chip(id, at, |chip| chip.warmup_phase = phase)
    }

    async fn set_chip_quality(
        &self,
        id: &str,
        tier: QualityTier,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update_chip(id, at, |chip| chip.quality_tier = tier)
    }

    async fn set_chip_response_rate(&self, id: &str, rate: f64, at: DateTime<Utc>) -> Result<()> {
        self.update_chip(id, at, |chip| chip.response_rate = Some(rate.clamp(0.0, 1.0)))
    }

    async fn set_chip_cooldown(
        &self,
        id: &str,
        until: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update_chip(id, at, |chip| chip.cooldown_until = until)
    }

    async fn record_chip_send(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_chip(id, at, |chip| {
            chip.counters.register_send(at);
            chip.rolling_sent += 1;
            chip.last_activity_at = Some(at);
        })
    }

    async fn record_chip_error(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_chip(id, at, |chip| {
            chip.rolling_errors += 1;
            chip.last_error_at = Some(at);
            chip.last_activity_at = Some(at);
        })
    }

    async fn reset_chip_errors(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_chip(id, at, |chip| {
            chip.rolling_errors = 0;
            chip.rolling_sent = 0;
        })
    }

    async fn bind_conversation(&self, binding: ConversationBinding) -> Result<()> {
        self.bindings
            .write()
            .await
            .insert(binding.conversation_id.clone(), binding);
        Ok(())
    }

    async fn conversation_binding(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationBinding>> {
        Ok(self.bindings.read().await.get(conversation_id).cloned())
    }

    async fn active_bindings_for_chip(&self, chip_id: &str) -> Result<Vec<ConversationBinding>> {
        let bindings = self.bindings.read().await;
        let mut found: Vec<_> = bindings
            .values()
            .filter(|b| b.active && b.chip_id == chip_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        Ok(found)
    }

    async fn rebind_conversations(
        &self,
        from: &str,
        to: &str,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let mut bindings = self.bindings.write().await;
        let mut moved = 0;
        for binding in bindings.values_mut() {
            if binding.active && binding.chip_id == from {
                binding.chip_id = to.to_string();
                binding.bound_at = at;
                moved += 1;
            }
        }
        debug!(from = %from, to = %to, moved, "Rebound conversations");
        Ok(moved)
    }

    async fn record_contact(&self, mut record: ContactRecord) -> Result<()> {
        record.destination = normalize_destination(&record.destination);
        self.contacts.write().await.push(record);
        Ok(())
    }

    async fn contact_history(&self, destination: &str) -> Result<Vec<ContactRecord>> {
        let destination = normalize_destination(destination);
        let contacts = self.contacts.read().await;
        let mut history: Vec<_> = contacts
            .iter()
            .filter(|c| c.destination == destination)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.contacted_at.cmp(&a.contacted_at));
        Ok(history)
    }

    async fn count_contacts_since(&self, destination: &str, since: DateTime<Utc>) -> Result<u32> {
        let destination = normalize_destination(destination);
        let contacts = self.contacts.read().await;
        Ok(contacts
            .iter()
            .filter(|c| c.destination == destination && c.contacted_at >= since)
            .count() as u32)
    }

    async fn load_pool_config(&self) -> Result<PoolConfig> {
        Ok(self.pool_config.read().await.clone())
    }

    async fn save_pool_config(&self, config: PoolConfig) -> Result<()> {
        config.validate().map_err(DispatchError::Config)?;
        *self.pool_config.write().await = config;
        Ok(())
    }

    async fn find_open_alert(
        &self,
        kind: AlertKind,
        chip_id: Option<&str>,
    ) -> Result<Option<Alert>> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .iter()
            .rev()
            .find(|a| !a.resolved && alert_matches(a, kind, chip_id))
            .cloned())
    }

    async fn latest_alert(&self, kind: AlertKind, chip_id: Option<&str>) -> Result<Option<Alert>> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .iter()
            .filter(|a| alert_matches(a, kind, chip_id))
            .max_by_key(|a| a.last_seen_at)
            .cloned())
    }

    async fn insert_alert(&self, alert: Alert) -> Result<()> {
        self.alerts.write().await.push(alert);
        Ok(())
    }

    async fn touch_alert(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut alerts = self.alerts.write().await;
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| DispatchError::NotFound(format!("alert {}", id)))?;
        alert.last_seen_at = at;
        Ok(())
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        let alerts = self.alerts.read().await;
        let mut found: Vec<_> = alerts
            .iter()
            .filter(|a| filter.include_resolved || !a.resolved)
            .filter(|a| filter.kind.map_or(true, |k| k == a.kind))
            .filter(|a| {
                filter
                    .chip_id
                    .as_deref()
                    .map_or(true, |id| a.chip_id.as_deref() == Some(id))
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn resolve_alert(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut alerts = self.alerts.write().await;
        match alerts.iter_mut().find(|a| a.id == id && !a.resolved) {
            Some(alert) => {
                alert.resolved = true;
                alert.resolved_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expire_alerts(&self, older_than: DateTime<Utc>, at: DateTime<Utc>) -> Result<usize> {
        let mut alerts = self.alerts.write().await;
        let mut expired = 0;
        for alert in alerts
            .iter_mut()
            .filter(|a| !a.resolved && a.created_at < older_than)
        {
            alert.resolved = true;
            alert.resolved_at = Some(at);
            expired += 1;
        }
        Ok(expired)
    }

    async fn append_operation(&self, entry: OperationLog) -> Result<()> {
        self.operations.write().await.push(entry);
        Ok(())
    }

    async fn list_operations(
        &self,
        kind: Option<OperationKind>,
        limit: usize,
    ) -> Result<Vec<OperationLog>> {
        let operations = self.operations.read().await;
        Ok(operations
            .iter()
            .rev()
            .filter(|op| kind.map_or(true, |k| k == op.kind))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_selection(&self, entry: SelectionDecisionLog) -> Result<()> {
        let mut selections = self.selections.write().await;
        if selections.len() >= SELECTION_LOG_CAPACITY {
            selections.pop_front();
        }
        selections.push_back(entry);
        Ok(())
    }

    async fn is_opted_out(&self, destination: &str) -> Result<bool> {
        Ok(self.opt_outs.contains_key(&normalize_destination(destination)))
    }

    async fn record_opt_out(&self, destination: &str, at: DateTime<Utc>) -> Result<()> {
        let key = normalize_destination(destination);
        if key.is_empty() {
            return Err(DispatchError::BadRequest(
                "opt-out requires a destination".to_string(),
            ));
        }
        self.opt_outs
            .entry(key.clone())
            .or_insert_with(|| OptOut {
                destination: key,
                opted_out_at: at,
            });
        Ok(())
    }

    async fn touch_state(&self, recipient: &str) -> Result<Option<TouchState>> {
        Ok(self
            .touches
            .get(&normalize_destination(recipient))
            .map(|t| t.clone()))
    }

    async fn advance_touch_state(&self, mut candidate: TouchState) -> Result<TouchAdvance> {
        candidate.recipient = normalize_destination(&candidate.recipient);
        if candidate.recipient.is_empty() {
            return Err(DispatchError::BadRequest(
                "touch state requires a recipient".to_string(),
            ));
        }
        match self.touches.entry(candidate.recipient.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(candidate);
                Ok(TouchAdvance::Advanced)
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get().last_touch_at;
                if candidate.last_touch_at > current {
                    slot.insert(candidate);
                    Ok(TouchAdvance::Advanced)
                } else if candidate.last_touch_at < current {
                    Ok(TouchAdvance::AlreadyNewer)
                } else {
                    Ok(TouchAdvance::Unchanged)
                }
            }
        }
    }

    async fn record_dispatch(&self, record: DispatchRecord) -> Result<()> {
        self.dispatches.write().await.push(record);
        Ok(())
    }

    async fn dispatch_records(&self, request_id: Uuid) -> Result<Vec<DispatchRecord>> {
        let dispatches = self.dispatches.read().await;
        Ok(dispatches
            .iter()
            .filter(|d| d.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn reconcile_candidates(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReconcileCandidate>> {
        let dispatches = self.dispatches.read().await;
        let mut candidates: Vec<_> = dispatches
            .iter()
            .filter(|d| d.created_at >= since)
            .filter_map(ReconcileCandidate::from_record)
            .filter(|c| {
                self.ledger
                    .get(&c.provider_message_id)
                    .map_or(true, |row| row.status.is_reclaimable())
            })
            .collect();
        candidates.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn claim_ledger(&self, provider_message_id: &str, at: DateTime<Utc>) -> Result<bool> {
        match self.ledger.entry(provider_message_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(LedgerEntry::processing(provider_message_id, at));
                Ok(true)
            }
            Entry::Occupied(mut slot) => {
                let row = slot.get_mut();
                if !row.status.is_reclaimable() {
                    return Ok(false);
                }
                row.status = LedgerStatus::Processing;
                row.claimed_at = at;
                row.updated_at = at;
                row.claims += 1;
                Ok(true)
            }
        }
    }

    async fn finish_ledger(
        &self,
        provider_message_id: &str,
        status: LedgerStatus,
        detail: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut row = self.ledger.get_mut(provider_message_id).ok_or_else(|| {
            DispatchError::NotFound(format!("ledger row {}", provider_message_id))
        })?;
        row.status = status;
        row.detail = detail;
        row.updated_at = at;
        Ok(())
    }

    async fn ledger_entry(&self, provider_message_id: &str) -> Result<Option<LedgerEntry>> {
        Ok(self.ledger.get(provider_message_id).map(|r| r.clone()))
    }

    async fn abandon_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let mut abandoned = 0;
        for mut row in self.ledger.iter_mut() {
            if row.status == LedgerStatus::Processing && row.claimed_at < claimed_before {
                row.status = LedgerStatus::Abandoned;
                row.updated_at = at;
                row.detail = Some("claim exceeded processing timeout".to_string());
                abandoned += 1;
            }
        }
        Ok(abandoned)
    }

    async fn count_ledger(&self, status: LedgerStatus) -> Result<usize> {
        Ok(self.ledger.iter().filter(|r| r.status == status).count())
    }
}
