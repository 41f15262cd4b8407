//! Health monitor
//!
//! Periodically evaluates every chip in service and the pool as a whole:
//!
//! - per-chip checks raise alerts deduplicated by kind and chip
//! - chips past the hard limits are demoted to `degraded`
//! - pool-level findings are deduplicated with a cooldown and sent as one
//!   aggregated notification
//! - quiet chips get their rolling error counters reset, old alerts expire
//!
//! Store failures on the alerting path are logged and skipped so one bad row
//! never stops the sweep.

pub mod checks;

pub use checks::{check_chip, check_pool, demotion_reason, Finding};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::db::schemas::{
    Alert, AlertKind, Chip, ChipStatus, OperationKind, OperationLog, PoolConfig, Severity,
};
use crate::db::{ChipFilter, Store};
use crate::notify::{notify_best_effort, Notification, Notifier};
use crate::types::Result;

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub interval: Duration,
    /// How often the 24h trust baseline is rolled forward
    pub trust_snapshot_every: ChronoDuration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            trust_snapshot_every: ChronoDuration::hours(24),
        }
    }
}

/// Outcome of one monitor pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub chips_checked: usize,
    pub alerts_raised: usize,
    pub alerts_refreshed: usize,
    pub demoted: Vec<String>,
    pub pool_alerts: Vec<String>,
    pub errors_reset: usize,
    pub alerts_expired: usize,
}

enum Raised {
    New,
    Refreshed,
    Skipped,
}

pub struct HealthMonitor {
    store: Arc<dyn Store>,
    breaker: Arc<CircuitBreaker>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: HealthMonitorConfig,
    last_trust_snapshot: Mutex<Option<DateTime<Utc>>>,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        breaker: Arc<CircuitBreaker>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            store,
            breaker,
            notifier,
            clock,
            config,
            last_trust_snapshot: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// Run one full evaluation
    pub async fn run_once(&self) -> Result<HealthReport> {
        let now = self.clock.now();
        let config = self.store.load_pool_config().await?;
        let chips = self.store.list_chips(&ChipFilter::any()).await?;
        let mut report = HealthReport::default();

        for chip in chips.iter().filter(|c| checks::is_monitored(c.status)) {
            report.chips_checked += 1;
            self.evaluate_chip(chip, &config, now, &mut report).await;
        }

        // Re-read so demotions from this pass count against the pool
        let chips = match self.store.list_chips(&ChipFilter::any()).await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(error = %e, "Chip reload failed, using pre-demotion view");
                chips
            }
        };
        self.evaluate_pool(&chips, &config, now, &mut report).await;
        self.maintain(&chips, &config, now, &mut report).await;
        self.roll_trust_baseline(&chips, now).await;

        debug!(
            checked = report.chips_checked,
            raised = report.alerts_raised,
            demoted = report.demoted.len(),
            "Health pass complete"
        );
        Ok(report)
    }

    async fn evaluate_chip(
        &self,
        chip: &Chip,
        config: &PoolConfig,
        now: DateTime<Utc>,
        report: &mut HealthReport,
    ) {
        for finding in check_chip(chip, config) {
            match self.raise(Some(&chip.id), &finding, now).await {
                Raised::New => {
                    report.alerts_raised += 1;
                    if finding.severity == Severity::Critical {
                        let n = Notification::new(finding.kind.label(), finding.severity)
                            .line(finding.message.clone())
                            .for_chip(chip.id.clone());
                        notify_best_effort(self.notifier.as_ref(), n).await;
                    }
                }
                Raised::Refreshed => report.alerts_refreshed += 1,
                Raised::Skipped => {}
            }
        }

        let failures = self.breaker.consecutive_failures(&chip.id);
        if let Some(reason) = demotion_reason(chip, config, failures) {
            if self.demote(chip, &reason, now).await {
                report.demoted.push(chip.id.clone());
            }
        }
    }

    async fn demote(&self, chip: &Chip, reason: &str, now: DateTime<Utc>) -> bool {
        match self
            .store
            .transition_chip_status(&chip.id, chip.status, ChipStatus::Degraded, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(chip_id = %chip.id, "Chip moved before demotion, skipping");
                return false;
            }
            Err(e) => {
                error!(chip_id = %chip.id, error = %e, "Auto-demotion failed");
                return false;
            }
        }
        warn!(chip_id = %chip.id, from = %chip.status, reason = %reason, "Chip auto-demoted");

        let finding = Finding {
            kind: AlertKind::AutoDemoted,
            severity: Severity::Critical,
            message: format!("chip {} demoted from {}: {}", chip.id, chip.status, reason),
        };
        self.raise(Some(&chip.id), &finding, now).await;

        let entry = OperationLog::new(OperationKind::AutoDemote, Some(chip.id.clone()), reason, now)
            .with_metadata(serde_json::json!({
                "from": chip.status.as_str(),
                "trust_score": chip.trust_score,
                "consecutive_failures": self.breaker.consecutive_failures(&chip.id),
            }));
        if let Err(e) = self.store.append_operation(entry).await {
            warn!(chip_id = %chip.id, error = %e, "Failed to log auto-demotion");
        }

        let n = Notification::new("Chip auto-demoted", Severity::Critical)
            .line(finding.message)
            .for_chip(chip.id.clone());
        notify_best_effort(self.notifier.as_ref(), n).await;
        true
    }

    /// Insert a new alert or refresh the open one for the same kind and chip
    async fn raise(&self, chip_id: Option<&str>, finding: &Finding, now: DateTime<Utc>) -> Raised {
        match self.store.find_open_alert(finding.kind, chip_id).await {
            Ok(Some(open)) => match self.store.touch_alert(open.id, now).await {
                Ok(()) => Raised::Refreshed,
                Err(e) => {
                    warn!(alert_id = %open.id, error = %e, "Failed to refresh alert");
                    Raised::Skipped
                }
            },
            Ok(None) => {
                let alert = Alert::new(
                    chip_id.map(str::to_string),
                    finding.kind,
                    finding.severity,
                    finding.message.clone(),
                    now,
                );
                match self.store.insert_alert(alert).await {
                    Ok(()) => {
                        info!(
                            kind = %finding.kind.label(),
                            chip_id = ?chip_id,
                            severity = %finding.severity,
                            "Alert raised"
                        );
                        Raised::New
                    }
                    Err(e) => {
                        warn!(kind = %finding.kind.label(), error = %e, "Failed to insert alert");
                        Raised::Skipped
                    }
                }
            }
            Err(e) => {
                warn!(kind = %finding.kind.label(), error = %e, "Alert lookup failed");
                Raised::Skipped
            }
        }
    }

    async fn evaluate_pool(
        &self,
        chips: &[Chip],
        config: &PoolConfig,
        now: DateTime<Utc>,
        report: &mut HealthReport,
    ) {
        let findings = check_pool(chips, config, now, &self.breaker);
        let cooldown = config.health.pool_alert_cooldown();
        let mut fresh = Vec::new();

        for finding in findings {
            let latest = match self.store.latest_alert(finding.kind, None).await {
                Ok(latest) => latest,
                Err(e) => {
                    warn!(kind = %finding.kind.label(), error = %e, "Pool alert lookup failed");
                    continue;
                }
            };
            if let Some(alert) = &latest {
                if now - alert.created_at < cooldown {
                    if !alert.resolved {
                        if let Err(e) = self.store.touch_alert(alert.id, now).await {
                            warn!(alert_id = %alert.id, error = %e, "Failed to refresh pool alert");
                        }
                    }
                    continue;
                }
                // Cooldown over: close the stale alert and start a new one
                if !alert.resolved {
                    if let Err(e) = self.store.resolve_alert(alert.id, now).await {
                        warn!(alert_id = %alert.id, error = %e, "Failed to close stale pool alert");
                    }
                }
            }
            let alert = Alert::new(None, finding.kind, finding.severity, finding.message.clone(), now);
            if let Err(e) = self.store.insert_alert(alert).await {
                warn!(kind = %finding.kind.label(), error = %e, "Failed to insert pool alert");
                continue;
            }
            report.alerts_raised += 1;
            report.pool_alerts.push(finding.kind.label());
            fresh.push(finding);
        }

        if fresh.is_empty() {
            return;
        }
        let severity = fresh
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(Severity::Warning);
        let notification = fresh.into_iter().fold(
            Notification::new("Chip pool health", severity),
            |n, f| n.line(f.message),
        );
        notify_best_effort(self.notifier.as_ref(), notification).await;
    }

    async fn maintain(
        &self,
        chips: &[Chip],
        config: &PoolConfig,
        now: DateTime<Utc>,
        report: &mut HealthReport,
    ) {
        let quiet_since = now - config.health.quiet_reset();
        for chip in chips.iter().filter(|c| c.rolling_errors > 0) {
            let quiet = chip.last_error_at.map_or(true, |at| at <= quiet_since);
            if !quiet {
                continue;
            }
            match self.store.reset_chip_errors(&chip.id, now).await {
                Ok(()) => {
                    debug!(chip_id = %chip.id, "Reset rolling error counters");
                    report.errors_reset += 1;
                }
                Err(e) => warn!(chip_id = %chip.id, error = %e, "Failed to reset error counters"),
            }
        }

        match self
            .store
            .expire_alerts(now - config.health.alert_expiry(), now)
            .await
        {
            Ok(expired) => {
                if expired > 0 {
                    info!(expired, "Expired stale alerts");
                }
                report.alerts_expired = expired;
            }
            Err(e) => warn!(error = %e, "Alert expiry failed"),
        }
    }

    async fn roll_trust_baseline(&self, chips: &[Chip], now: DateTime<Utc>) {
        {
            let last = self
                .last_trust_snapshot
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(at) = *last {
                if now - at < self.config.trust_snapshot_every {
                    return;
                }
            }
        }
        for chip in chips.iter().filter(|c| !c.status.is_terminal()) {
            if let Err(e) = self.store.snapshot_chip_trust(&chip.id, now).await {
                warn!(chip_id = %chip.id, error = %e, "Trust snapshot failed");
            }
        }
        *self
            .last_trust_snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(now);
    }
}

/// Spawn the monitor loop
pub fn spawn_health_monitor_task(monitor: Arc<HealthMonitor>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = monitor.config().interval;
        info!(interval_secs = interval.as_secs(), "Health monitor started");
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = monitor.run_once().await {
                error!(error = %e, "Health pass failed");
            }
        }
    })
}
