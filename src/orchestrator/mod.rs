//! Pool orchestrator - lifecycle driver for the chip pool
//!
//! ## Cycle
//!
//! Each cycle runs under a leased lock so only one instance drives the pool
//! at a time. Steps are isolated: a failing step is recorded in the
//! [`CycleReport`] and the next one still runs. The lease is extended before
//! every step; once it cannot be extended the remaining steps are abandoned.
//!
//! ```text
//! connect -> load config -> replace degraded -> warming->ready
//!         -> ready->active -> provision -> status snapshot
//! ```
//!
//! ## Modules
//!
//! - `replacement` - swap degraded chips for ready ones, migrating conversations
//! - `provisioning` - [`Provisioner`] seam for new identities
//! - `status` - [`PoolStatus`] snapshot and health verdict
//! - `admin` - manual operations ([`PoolAdmin`])

pub mod admin;
pub mod provisioning;
pub mod replacement;
pub mod status;

pub use admin::PoolAdmin;
pub use provisioning::{InventoryProvisioner, ProvisionedIdentity, Provisioner};
pub use replacement::ReplacementRecord;
pub use status::{PoolHealth, PoolStatus};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::coordination::{AcquireMode, LockLease, MutualExclusionLock};
use crate::db::schemas::{
    Alert, AlertKind, Chip, ChipStatus, OperationKind, OperationLog, PoolConfig, Severity,
    WarmupPhase,
};
use crate::db::{ChipFilter, Store};
use crate::notify::{notify_best_effort, Notification, Notifier};
use crate::selector::is_replacement_candidate;
use crate::sender::SenderRegistry;
use crate::types::{DispatchError, Result};

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Lock key shared by every instance driving the same pool
    pub lock_key: String,
    /// Lease taken (and re-extended) for each cycle
    pub lock_lease: Duration,
    /// Pause between cycles
    pub interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lock_key: "chip_pool_orchestrator".to_string(),
            lock_lease: Duration::from_secs(300),
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStep {
    Connect,
    LoadConfig,
    Replace,
    PromoteReady,
    PromoteActive,
    Provision,
    Status,
}

impl CycleStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStep::Connect => "connect",
            CycleStep::LoadConfig => "load_config",
            CycleStep::Replace => "replace",
            CycleStep::PromoteReady => "promote_ready",
            CycleStep::PromoteActive => "promote_active",
            CycleStep::Provision => "provision",
            CycleStep::Status => "status",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepError {
    pub step: CycleStep,
    pub error: String,
}

/// What one cycle did
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// Another instance held the lock
    pub skipped: bool,
    /// Lease lost mid-cycle; later steps did not run
    pub aborted: bool,
    pub connected: Vec<String>,
    pub replaced: Vec<ReplacementRecord>,
    /// Chips that needed replacing but had no ready successor
    pub unreplaced: Vec<String>,
    pub promoted_ready: Vec<String>,
    pub promoted_active: Vec<String>,
    pub provisioned: Vec<String>,
    pub status: Option<PoolStatus>,
    pub step_errors: Vec<StepError>,
}

impl CycleReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    fn fail(&mut self, step: CycleStep, error: DispatchError) {
        error!(step = step.as_str(), error = %error, "Orchestrator step failed");
        self.step_errors.push(StepError {
            step,
            error: error.to_string(),
        });
    }
}

pub struct PoolOrchestrator {
    store: Arc<dyn Store>,
    lock: Arc<dyn MutualExclusionLock>,
    senders: Arc<SenderRegistry>,
    breaker: Arc<CircuitBreaker>,
    notifier: Arc<dyn Notifier>,
    provisioner: Option<Arc<dyn Provisioner>>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl PoolOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        lock: Arc<dyn MutualExclusionLock>,
        senders: Arc<SenderRegistry>,
        breaker: Arc<CircuitBreaker>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            lock,
            senders,
            breaker,
            notifier,
            provisioner: None,
            clock,
            config,
        }
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one cycle if the pool lock is free
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let acquired = self
            .lock
            .acquire(
                &self.config.lock_key,
                self.config.lock_lease,
                AcquireMode::NonBlocking,
            )
            .await?;
        let Some(mut lease) = acquired else {
            debug!(key = %self.config.lock_key, "Pool lock held elsewhere, skipping cycle");
            return Ok(CycleReport::skipped());
        };

        let report = self.run_steps(&mut lease).await;

        match self.lock.release(&lease).await {
            Ok(true) => {}
            Ok(false) => warn!(key = %lease.key, "Pool lock lease was lost before release"),
            Err(e) => warn!(key = %lease.key, error = %e, "Failed to release pool lock"),
        }
        Ok(report)
    }

    async fn run_steps(&self, lease: &mut LockLease) -> CycleReport {
        let mut report = CycleReport::default();

        if let Err(e) = self.connect_chips(&mut report).await {
            report.fail(CycleStep::Connect, e);
        }

        let config = match self.store.load_pool_config().await {
            Ok(config) => config,
            Err(e) => {
                report.fail(CycleStep::LoadConfig, e);
                PoolConfig::default()
            }
        };

        let steps = [
            CycleStep::Replace,
            CycleStep::PromoteReady,
            CycleStep::PromoteActive,
            CycleStep::Provision,
            CycleStep::Status,
        ];
        for step in steps {
            if !self.keep_lease(lease).await {
                warn!(step = step.as_str(), "Pool lock lease lost, abandoning cycle");
                report.aborted = true;
                break;
            }
            let result = match step {
                CycleStep::Replace => self.replace_degraded(&config, &mut report).await,
                CycleStep::PromoteReady => self.promote_warming(&config, &mut report).await,
                CycleStep::PromoteActive => self.promote_ready(&config, &mut report).await,
                CycleStep::Provision => self.provision(&config, &mut report).await,
                CycleStep::Status => self.snapshot_status(&config, &mut report).await,
                CycleStep::Connect | CycleStep::LoadConfig => Ok(()),
            };
            if let Err(e) = result {
                report.fail(step, e);
            }
        }

        info!(
            connected = report.connected.len(),
            replaced = report.replaced.len(),
            promoted_ready = report.promoted_ready.len(),
            promoted_active = report.promoted_active.len(),
            provisioned = report.provisioned.len(),
            errors = report.step_errors.len(),
            "Orchestrator cycle complete"
        );
        report
    }

    async fn keep_lease(&self, lease: &mut LockLease) -> bool {
        match self.lock.extend(lease, self.config.lock_lease).await {
            Ok(extended) => extended,
            Err(e) => {
                warn!(error = %e, "Lease extension failed");
                false
            }
        }
    }

    /// Validated, compare-and-set status change
    pub(crate) async fn transition(
        &self,
        chip: &Chip,
        to: ChipStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !chip.status.can_transition_to(to) {
            return Err(DispatchError::IllegalTransition {
                chip_id: chip.id.clone(),
                from: chip.status,
                to,
            });
        }
        let moved = self
            .store
            .transition_chip_status(&chip.id, chip.status, to, now)
            .await?;
        if moved {
            info!(chip_id = %chip.id, from = %chip.status, to = %to, "Chip status changed");
        } else {
            debug!(chip_id = %chip.id, expected = %chip.status, "Chip moved concurrently");
        }
        Ok(moved)
    }

    pub(crate) async fn log_operation(&self, entry: OperationLog) {
        if let Err(e) = self.store.append_operation(entry).await {
            warn!(error = %e, "Failed to append operation log");
        }
    }

    /// Insert an alert unless one is already open for the same kind and chip
    pub(crate) async fn raise_alert(
        &self,
        chip_id: Option<&str>,
        kind: AlertKind,
        severity: Severity,
        message: String,
        now: DateTime<Utc>,
    ) {
        match self.store.find_open_alert(kind, chip_id).await {
            Ok(Some(open)) => {
                if let Err(e) = self.store.touch_alert(open.id, now).await {
                    warn!(alert_id = %open.id, error = %e, "Failed to refresh alert");
                }
            }
            Ok(None) => {
                let alert = Alert::new(
                    chip_id.map(str::to_string),
                    kind,
                    severity,
                    message.clone(),
                    now,
                );
                if let Err(e) = self.store.insert_alert(alert).await {
                    warn!(kind = %kind.label(), error = %e, "Failed to insert alert");
                    return;
                }
                let mut n = Notification::new(kind.label(), severity).line(message);
                if let Some(id) = chip_id {
                    n = n.for_chip(id);
                }
                notify_best_effort(self.notifier.as_ref(), n).await;
            }
            Err(e) => warn!(kind = %kind.label(), error = %e, "Alert lookup failed"),
        }
    }

    /// Refresh connectivity for every chip with a sender and start warmup
    /// for newly connected provisioned/pending chips
    async fn connect_chips(&self, report: &mut CycleReport) -> Result<()> {
        let chips: Vec<Chip> = self
            .store
            .list_chips(&ChipFilter::any())
            .await?
            .into_iter()
            .filter(|c| !c.status.is_terminal())
            .collect();

        let probes = chips.iter().map(|chip| async move {
            let sender = match self.senders.sender_for(chip) {
                Ok(sender) => sender,
                Err(e) => {
                    debug!(chip_id = %chip.id, error = %e, "No sender for chip");
                    return None;
                }
            };
            match sender.status().await {
                Ok(status) => Some(status.connected),
                Err(e) => {
                    warn!(chip_id = %chip.id, error = %e, "Status probe failed");
                    Some(false)
                }
            }
        });
        let results = join_all(probes).await;

        let now = self.clock.now();
        for (chip, connected) in chips.iter().zip(results) {
            let Some(connected) = connected else { continue };
            if connected != chip.connected {
                self.store.set_chip_connected(&chip.id, connected, now).await?;
                info!(chip_id = %chip.id, connected, "Chip connectivity changed");
            }
            let starts_warmup =
                matches!(chip.status, ChipStatus::Provisioned | ChipStatus::Pending);
            if connected && starts_warmup && self.transition(chip, ChipStatus::Warming, now).await?
            {
                self.log_operation(OperationLog::new(
                    OperationKind::WarmupStarted,
                    Some(chip.id.clone()),
                    "first successful connect",
                    now,
                ))
                .await;
                report.connected.push(chip.id.clone());
            }
        }
        Ok(())
    }

    /// Advance warmup sub-phases by elapsed time, then promote warmed chips
    async fn promote_warming(&self, config: &PoolConfig, report: &mut CycleReport) -> Result<()> {
        let now = self.clock.now();
        let duration = config.warmup_duration();
        let warming = self
            .store
            .list_chips(&ChipFilter::status(ChipStatus::Warming))
            .await?;

        for chip in warming {
            let elapsed = chip.warmup_elapsed(now).unwrap_or_else(ChronoDuration::zero);
            // Phases never move backwards
            let phase = warmup_phase_for(elapsed, duration).max(chip.warmup_phase);
            if phase != chip.warmup_phase {
                self.store.set_chip_warmup_phase(&chip.id, phase, now).await?;
                debug!(chip_id = %chip.id, phase = ?phase, "Warmup phase advanced");
            }

            let ready = chip.trust_score >= config.trust_ready
                && elapsed >= duration
                && phase == WarmupPhase::Operational;
            if ready && self.transition(&chip, ChipStatus::Ready, now).await? {
                self.log_operation(
                    OperationLog::new(
                        OperationKind::PromoteReady,
                        Some(chip.id.clone()),
                        "warmup complete",
                        now,
                    )
                    .with_metadata(serde_json::json!({
                        "trust_score": chip.trust_score,
                        "warmup_hours": elapsed.num_hours(),
                    })),
                )
                .await;
                report.promoted_ready.push(chip.id.clone());
            }
        }
        Ok(())
    }

    /// Promote ready chips, highest trust first, to close the production deficit
    async fn promote_ready(&self, config: &PoolConfig, report: &mut CycleReport) -> Result<()> {
        let now = self.clock.now();
        let active = self
            .store
            .list_chips(&ChipFilter::status(ChipStatus::Active))
            .await?
            .len() as u32;
        let deficit = config.min_active.saturating_sub(active);
        let headroom = config.max_active.saturating_sub(active);
        let wanted = deficit.min(headroom) as usize;
        if wanted == 0 {
            return Ok(());
        }

        let mut candidates: Vec<Chip> = self
            .store
            .list_chips(&ChipFilter::status(ChipStatus::Ready))
            .await?
            .into_iter()
            .filter(|c| is_replacement_candidate(c, config, &self.breaker))
            .collect();
        sort_by_trust(&mut candidates);

        let mut promoted = 0;
        for chip in candidates {
            if promoted >= wanted {
                break;
            }
            if self.transition(&chip, ChipStatus::Active, now).await? {
                self.log_operation(
                    OperationLog::new(
                        OperationKind::PromoteActive,
                        Some(chip.id.clone()),
                        format!("production deficit {}", deficit),
                        now,
                    )
                    .with_metadata(serde_json::json!({ "trust_score": chip.trust_score })),
                )
                .await;
                report.promoted_active.push(chip.id.clone());
                promoted += 1;
            }
        }
        if promoted < wanted {
            debug!(wanted, promoted, "Not enough ready chips to close deficit");
        }
        Ok(())
    }

    /// Top the warming buffer up from the provisioner
    async fn provision(&self, config: &PoolConfig, report: &mut CycleReport) -> Result<()> {
        if !config.auto_provision {
            return Ok(());
        }
        let pipeline = self
            .store
            .list_chips(&ChipFilter::statuses([
                ChipStatus::Provisioned,
                ChipStatus::Pending,
                ChipStatus::Warming,
            ]))
            .await?
            .len() as u32;
        let wanted = config
            .warming_buffer_target
            .saturating_sub(pipeline)
            .min(config.provision_batch_limit);
        if wanted == 0 {
            return Ok(());
        }
        let Some(provisioner) = &self.provisioner else {
            warn!(wanted, "Warming buffer below target but no provisioner configured");
            return Ok(());
        };

        let now = self.clock.now();
        let identities = provisioner.provision(wanted).await?;
        for identity in identities.into_iter().take(wanted as usize) {
            let chip = Chip::new(
                format!("chip-{}", Uuid::new_v4()),
                identity.phone_number.clone(),
                identity.provider,
                now,
            );
            let chip_id = chip.id.clone();
            if let Err(e) = self.store.insert_chip(chip).await {
                warn!(
                    phone_number = %identity.phone_number,
                    error = %e,
                    "Failed to store provisioned identity"
                );
                report.fail(CycleStep::Provision, e);
                continue;
            }
            info!(chip_id = %chip_id, provider = identity.provider.as_str(), "Chip provisioned");
            self.log_operation(
                OperationLog::new(
                    OperationKind::Provision,
                    Some(chip_id.clone()),
                    "warming buffer below target",
                    now,
                )
                .with_metadata(serde_json::json!({
                    "phone_number": identity.phone_number,
                    "external_ref": identity.external_ref,
                })),
            )
            .await;
            report.provisioned.push(chip_id);
        }
        Ok(())
    }

    /// Current pool status
    pub async fn pool_status(&self) -> Result<PoolStatus> {
        let config = self.store.load_pool_config().await?;
        let chips = self.store.list_chips(&ChipFilter::any()).await?;
        Ok(PoolStatus::compute(
            &chips,
            &config,
            self.clock.now(),
            &self.breaker,
        ))
    }

    async fn snapshot_status(&self, config: &PoolConfig, report: &mut CycleReport) -> Result<()> {
        let now = self.clock.now();
        let chips = self.store.list_chips(&ChipFilter::any()).await?;
        let status = PoolStatus::compute(&chips, config, now, &self.breaker);
        info!(
            health = status.health.as_str(),
            active = status.active,
            ready = status.ready,
            warming = status.warming_buffer,
            deficit = status.production_deficit,
            "Pool status"
        );
        if status.is_critical() {
            self.raise_alert(
                None,
                AlertKind::PoolCritical,
                Severity::Critical,
                format!("pool critical: {}", status.issues.join("; ")),
                now,
            )
            .await;
        }
        report.status = Some(status);
        Ok(())
    }
}

/// Warmup sub-phase implied by elapsed time: ramping after a third of the
/// warmup window, operational once it is complete
pub fn warmup_phase_for(elapsed: ChronoDuration, duration: ChronoDuration) -> WarmupPhase {
    if elapsed >= duration {
        WarmupPhase::Operational
    } else if elapsed * 3 >= duration {
        WarmupPhase::Ramping
    } else {
        WarmupPhase::Initial
    }
}

pub(crate) fn sort_by_trust(chips: &mut [Chip]) {
    chips.sort_by(|a, b| b.trust_score.cmp(&a.trust_score).then(a.id.cmp(&b.id)));
}

/// Spawn the periodic orchestration loop
pub fn spawn_orchestrator_task(orchestrator: Arc<PoolOrchestrator>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = orchestrator.config().interval;
        info!(interval_secs = interval.as_secs(), "Pool orchestrator started");
        loop {
            match orchestrator.run_cycle().await {
                Ok(report) if report.skipped => debug!("Cycle skipped"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Orchestrator cycle failed"),
            }
            tokio::time::sleep(interval).await;
        }
    })
}
