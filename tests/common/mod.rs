//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use chip_dispatch::breaker::{CircuitBreaker, CircuitBreakerConfig};
use chip_dispatch::clock::{Clock, ManualClock};
use chip_dispatch::coordination::{
    AcquireMode, InMemoryLock, InMemoryReservoir, LockLease, MutualExclusionLock,
};
use chip_dispatch::db::schemas::{
    Alert, AlertFilter, AlertKind, Chip, ChipStatus, ContactRecord, ConversationBinding,
    DispatchRecord, LedgerEntry, LedgerStatus, OperationKind, OperationLog, PoolConfig,
    ProviderKind, QualityTier, ReconcileCandidate, SelectionDecisionLog, TouchAdvance, TouchState,
    WarmupPhase,
};
use chip_dispatch::db::{ChipFilter, InMemoryStore, Store};
use chip_dispatch::{DispatchError, Result};
use chip_dispatch::dispatch::{
    Allowlist, DispatchConfig, Environment, GuardrailConfig, OutboundDispatcher,
    StandardGuardrails,
};
use chip_dispatch::notify::RecordingNotifier;
use chip_dispatch::orchestrator::{OrchestratorConfig, PoolOrchestrator};
use chip_dispatch::reconcile::{ReconcilerConfig, TouchReconciler};
use chip_dispatch::selector::ChipSelector;
use chip_dispatch::sender::{MockSender, MockSenderFactory, SenderRegistry};

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 14, 10, 5, 0).unwrap()
}

/// Clock that moves forward on every read, like wall time under load
pub struct TickingClock {
    now: Mutex<DateTime<Utc>>,
    step: Duration,
}

impl TickingClock {
    pub fn new(start: DateTime<Utc>, step: Duration) -> Self {
        Self {
            now: Mutex::new(start),
            step,
        }
    }
}

impl Clock for TickingClock {
    fn now(&self) -> DateTime<Utc> {
        let mut now = self.now.lock().unwrap();
        let current = *now;
        *now += self.step;
        current
    }
}

/// In-memory infrastructure shared by every service under test
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryStore>,
    pub reservoir: Arc<InMemoryReservoir>,
    pub lock: Arc<InMemoryLock>,
    pub breaker: Arc<CircuitBreaker>,
    pub notifier: Arc<RecordingNotifier>,
    pub senders: Arc<SenderRegistry>,
    pub sender: Arc<MockSender>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let sender = Arc::new(MockSender::new());
        let senders = Arc::new(SenderRegistry::new());
        senders.register_factory(Arc::new(MockSenderFactory::new(
            ProviderKind::CloudApi,
            sender.clone(),
        )));
        Self {
            store: Arc::new(InMemoryStore::with_config(config)),
            reservoir: Arc::new(InMemoryReservoir::new(clock.clone())),
            lock: Arc::new(InMemoryLock::new(clock.clone())),
            breaker: Arc::new(CircuitBreaker::new(
                CircuitBreakerConfig::default(),
                clock.clone(),
            )),
            notifier: Arc::new(RecordingNotifier::new()),
            senders,
            sender,
            clock,
        }
    }

    /// Connected sender chip with every capability, not yet stored
    pub fn new_chip(&self, id: &str, status: ChipStatus, trust: i32) -> Chip {
        Chip::new(id, format!("+1555-{}", id), ProviderKind::CloudApi, start_time())
            .with_status(status)
            .with_trust(trust)
            .with_connected(true)
    }

    pub async fn add_chip(&self, id: &str, status: ChipStatus, trust: i32) -> Chip {
        self.insert(self.new_chip(id, status, trust)).await
    }

    pub async fn insert(&self, chip: Chip) -> Chip {
        self.store.insert_chip(chip.clone()).await.unwrap();
        chip
    }

    pub async fn chip(&self, id: &str) -> Chip {
        self.store.get_chip(id).await.unwrap().unwrap()
    }

    pub fn orchestrator(&self) -> PoolOrchestrator {
        PoolOrchestrator::new(
            self.store.clone(),
            self.lock.clone(),
            self.senders.clone(),
            self.breaker.clone(),
            self.notifier.clone(),
            self.clock.clone(),
            OrchestratorConfig::default(),
        )
    }

    /// Orchestrator over substitute store and lock backends
    pub fn orchestrator_with(
        &self,
        store: Arc<dyn Store>,
        lock: Arc<dyn MutualExclusionLock>,
    ) -> PoolOrchestrator {
        PoolOrchestrator::new(
            store,
            lock,
            self.senders.clone(),
            self.breaker.clone(),
            self.notifier.clone(),
            self.clock.clone(),
            OrchestratorConfig::default(),
        )
    }

    pub fn selector(&self) -> Arc<ChipSelector> {
        Arc::new(ChipSelector::new(
            self.store.clone(),
            self.reservoir.clone(),
            self.breaker.clone(),
            self.clock.clone(),
        ))
    }

    pub fn dispatcher(&self, allowlist: Allowlist) -> OutboundDispatcher {
        self.dispatcher_with_guardrails(allowlist, GuardrailConfig::default())
    }

    pub fn dispatcher_with_guardrails(
        &self,
        allowlist: Allowlist,
        guardrails: GuardrailConfig,
    ) -> OutboundDispatcher {
        OutboundDispatcher::new(
            self.store.clone(),
            self.selector(),
            self.senders.clone(),
            self.breaker.clone(),
            Arc::new(StandardGuardrails::new(self.store.clone(), guardrails)),
            self.reservoir.clone(),
            allowlist,
            self.clock.clone(),
            DispatchConfig::default(),
        )
    }

    /// Dispatcher reading time from `clock` instead of the shared manual clock
    pub fn dispatcher_with_clock(
        &self,
        allowlist: Allowlist,
        clock: Arc<dyn Clock>,
    ) -> OutboundDispatcher {
        OutboundDispatcher::new(
            self.store.clone(),
            self.selector(),
            self.senders.clone(),
            self.breaker.clone(),
            Arc::new(StandardGuardrails::new(
                self.store.clone(),
                GuardrailConfig::default(),
            )),
            self.reservoir.clone(),
            allowlist,
            clock,
            DispatchConfig::default(),
        )
    }

    pub fn reconciler(&self) -> TouchReconciler {
        TouchReconciler::new(
            self.store.clone(),
            self.clock.clone(),
            ReconcilerConfig::default(),
        )
    }
}

pub fn production() -> Allowlist {
    Allowlist::new(Environment::Production, Vec::<String>::new())
}

// =============================================================================
// Substitute backends
// =============================================================================

/// Lock that grants every acquire but keeps the lease only for a fixed
/// number of extensions
pub struct ExpiringLock {
    extensions_left: AtomicU32,
}

impl ExpiringLock {
    pub fn new(extensions: u32) -> Self {
        Self {
            extensions_left: AtomicU32::new(extensions),
        }
    }
}

#[async_trait]
impl MutualExclusionLock for ExpiringLock {
    async fn acquire(
        &self,
        key: &str,
        _lease: std::time::Duration,
        _mode: AcquireMode,
    ) -> Result<Option<LockLease>> {
        Ok(Some(LockLease {
            key: key.to_string(),
            token: Uuid::new_v4(),
            expires_at: start_time(),
        }))
    }

    async fn release(&self, _lease: &LockLease) -> Result<bool> {
        Ok(false)
    }

    async fn extend(&self, _lease: &mut LockLease, _by: std::time::Duration) -> Result<bool> {
        let kept = self
            .extensions_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(kept)
    }
}

/// In-memory store that remembers each chip row as it stood right before a
/// status change, and can fail a named operation once
pub struct ObservedStore {
    inner: Arc<InMemoryStore>,
    rows_before_transition: Mutex<Vec<Chip>>,
    failures: Mutex<Vec<&'static str>>,
}

impl ObservedStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            rows_before_transition: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// The next call to `operation` fails with a store error
    pub fn fail_once(&self, operation: &'static str) {
        self.failures.lock().unwrap().push(operation);
    }

    pub fn rows_before_transition(&self) -> Vec<Chip> {
        self.rows_before_transition.lock().unwrap().clone()
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        let mut failures = self.failures.lock().unwrap();
        match failures.iter().position(|op| *op == operation) {
            Some(i) => {
                failures.remove(i);
                Err(DispatchError::Store(format!("{} unavailable", operation)))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Store for ObservedStore {
    async fn insert_chip(&self, chip: Chip) -> Result<()> {
        self.check("insert_chip")?;
        self.inner.insert_chip(chip).await
    }

    async fn get_chip(&self, id: &str) -> Result<Option<Chip>> {
        self.inner.get_chip(id).await
    }

    async fn list_chips(&self, filter: &ChipFilter) -> Result<Vec<Chip>> {
        self.inner.list_chips(filter).await
    }

    async fn transition_chip_status(
        &self,
        id: &str,
        from: ChipStatus,
        to: ChipStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if let Some(row) = self.inner.get_chip(id).await? {
            self.rows_before_transition.lock().unwrap().push(row);
        }
        self.check("transition_chip_status")?;
        self.inner.transition_chip_status(id, from, to, at).await
    }

    async fn set_chip_trust(&self, id: &str, trust: u8, at: DateTime<Utc>) -> Result<()> {
        self.check("set_chip_trust")?;
        self.inner.set_chip_trust(id, trust, at).await
    }

    async fn snapshot_chip_trust(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.inner.snapshot_chip_trust(id, at).await
    }

    async fn set_chip_connected(
        &self,
        id: &str,
        connected: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.set_chip_connected(id, connected, at).await
    }

    async fn set_chip_warmup_phase(
        &self,
        id: &str,
        phase: WarmupPhase,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.set_chip_warmup_phase(id, phase, at).await
    }

    async fn set_chip_quality(
        &self,
        id: &str,
        tier: QualityTier,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.set_chip_quality(id, tier, at).await
    }

    async fn set_chip_response_rate(&self, id: &str, rate: f64, at: DateTime<Utc>) -> Result<()> {
        self.inner.set_chip_response_rate(id, rate, at).await
    }

    async fn set_chip_cooldown(
        &self,
        id: &str,
        until: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.set_chip_cooldown(id, until, at).await
    }

    async fn record_chip_send(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.inner.record_chip_send(id, at).await
    }

    async fn record_chip_error(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.inner.record_chip_error(id, at).await
    }

    async fn reset_chip_errors(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.check("reset_chip_errors")?;
        self.inner.reset_chip_errors(id, at).await
    }

    async fn bind_conversation(&self, binding: ConversationBinding) -> Result<()> {
        self.inner.bind_conversation(binding).await
    }

    async fn conversation_binding(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationBinding>> {
        self.inner.conversation_binding(conversation_id).await
    }

    async fn active_bindings_for_chip(&self, chip_id: &str) -> Result<Vec<ConversationBinding>> {
        self.inner.active_bindings_for_chip(chip_id).await
    }

    async fn rebind_conversations(
        &self,
        from: &str,
        to: &str,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        self.inner.rebind_conversations(from, to, at).await
    }

    async fn record_contact(&self, record: ContactRecord) -> Result<()> {
        self.inner.record_contact(record).await
    }

    async fn contact_history(&self, destination: &str) -> Result<Vec<ContactRecord>> {
        self.inner.contact_history(destination).await
    }

    async fn count_contacts_since(&self, destination: &str, since: DateTime<Utc>) -> Result<u32> {
        self.inner.count_contacts_since(destination, since).await
    }

    async fn load_pool_config(&self) -> Result<PoolConfig> {
        self.inner.load_pool_config().await
    }

    async fn save_pool_config(&self, config: PoolConfig) -> Result<()> {
        self.inner.save_pool_config(config).await
    }

    async fn find_open_alert(
        &self,
        kind: AlertKind,
        chip_id: Option<&str>,
    ) -> Result<Option<Alert>> {
        self.inner.find_open_alert(kind, chip_id).await
    }

    async fn latest_alert(&self, kind: AlertKind, chip_id: Option<&str>) -> Result<Option<Alert>> {
        self.inner.latest_alert(kind, chip_id).await
    }

    async fn insert_alert(&self, alert: Alert) -> Result<()> {
        self.inner.insert_alert(alert).await
    }

    async fn touch_alert(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.inner.touch_alert(id, at).await
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        self.inner.list_alerts(filter).await
    }

    async fn resolve_alert(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        self.inner.resolve_alert(id, at).await
    }

    async fn expire_alerts(&self, older_than: DateTime<Utc>, at: DateTime<Utc>) -> Result<usize> {
        self.inner.expire_alerts(older_than, at).await
    }

    async fn append_operation(&self, entry: OperationLog) -> Result<()> {
        self.inner.append_operation(entry).await
    }

    async fn list_operations(
        &self,
        kind: Option<OperationKind>,
        limit: usize,
    ) -> Result<Vec<OperationLog>> {
        self.inner.list_operations(kind, limit).await
    }

    async fn record_selection(&self, entry: SelectionDecisionLog) -> Result<()> {
        self.inner.record_selection(entry).await
    }

    async fn is_opted_out(&self, destination: &str) -> Result<bool> {
        self.inner.is_opted_out(destination).await
    }

    async fn record_opt_out(&self, destination: &str, at: DateTime<Utc>) -> Result<()> {
        self.inner.record_opt_out(destination, at).await
    }

    async fn touch_state(&self, recipient: &str) -> Result<Option<TouchState>> {
        self.inner.touch_state(recipient).await
    }

    async fn advance_touch_state(&self, candidate: TouchState) -> Result<TouchAdvance> {
        self.inner.advance_touch_state(candidate).await
    }

    async fn record_dispatch(&self, record: DispatchRecord) -> Result<()> {
        self.inner.record_dispatch(record).await
    }

    async fn dispatch_records(&self, request_id: Uuid) -> Result<Vec<DispatchRecord>> {
        self.inner.dispatch_records(request_id).await
    }

    async fn reconcile_candidates(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReconcileCandidate>> {
        self.inner.reconcile_candidates(since, limit).await
    }

    async fn claim_ledger(&self, provider_message_id: &str, at: DateTime<Utc>) -> Result<bool> {
        self.inner.claim_ledger(provider_message_id, at).await
    }

    async fn finish_ledger(
        &self,
        provider_message_id: &str,
        status: LedgerStatus,
        detail: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner
            .finish_ledger(provider_message_id, status, detail, at)
            .await
    }

    async fn ledger_entry(&self, provider_message_id: &str) -> Result<Option<LedgerEntry>> {
        self.inner.ledger_entry(provider_message_id).await
    }

    async fn abandon_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        self.inner.abandon_stale_claims(claimed_before, at).await
    }

    async fn count_ledger(&self, status: LedgerStatus) -> Result<usize> {
        self.inner.count_ledger(status).await
    }
}
