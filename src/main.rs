//! Chip dispatch - outbound chip pool orchestration and dispatch

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chip_dispatch::{
    breaker::{CircuitBreaker, CircuitBreakerConfig},
    cli::{self, Command},
    clock::{Clock, SystemClock},
    config::Args,
    coordination::{spawn_reservoir_purge_task, InMemoryLock, InMemoryReservoir},
    db::{schemas::ProviderKind, InMemoryStore, Store},
    dispatch::{Allowlist, DispatchConfig, GuardrailConfig, OutboundDispatcher, StandardGuardrails},
    health::{spawn_health_monitor_task, HealthMonitor, HealthMonitorConfig},
    notify::{Notifier, TracingNotifier, WebhookNotifier, WebhookNotifierConfig},
    orchestrator::{
        spawn_orchestrator_task, InventoryProvisioner, OrchestratorConfig, PoolAdmin,
        PoolOrchestrator, ProvisionedIdentity,
    },
    reconcile::{spawn_reconciler_task, ReconcilerConfig, TouchReconciler},
    selector::ChipSelector,
    sender::{DryRunSenderFactory, SenderRegistry},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging; stdout carries command output
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("chip_dispatch={},info", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Chip Dispatch");
    info!("======================================");
    info!("Environment: {}", args.environment);
    info!("Allowlist: {} destination(s)", args.allowlist.len());
    info!("Senders: {}", if args.dry_run { "DRY RUN" } else { "LIVE" });
    info!("Orchestrator interval: {}s", args.orchestrator_interval_secs);
    info!("Health interval: {}s", args.health_interval_secs);
    info!("Reconcile interval: {}s", args.reconcile_interval_secs);
    info!("Reservoir purge interval: {}s", args.reservoir_purge_secs);
    info!(
        "Notifications: {}",
        args.webhook_url.as_deref().unwrap_or("log only")
    );
    info!("======================================");

    // Shared infrastructure
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let reservoir = Arc::new(InMemoryReservoir::new(clock.clone()));
    let lock = Arc::new(InMemoryLock::new(clock.clone()));
    let breaker = Arc::new(CircuitBreaker::new(
        CircuitBreakerConfig::default(),
        clock.clone(),
    ));
    let notifier: Arc<dyn Notifier> = match &args.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(WebhookNotifierConfig::new(url.clone()))),
        None => Arc::new(TracingNotifier),
    };

    let senders = Arc::new(SenderRegistry::new());
    for provider in [ProviderKind::CloudApi, ProviderKind::WebSession] {
        senders.register_factory(Arc::new(DryRunSenderFactory::new(provider)));
    }

    // Services
    let mut orchestrator = PoolOrchestrator::new(
        store.clone(),
        lock,
        senders.clone(),
        breaker.clone(),
        notifier.clone(),
        clock.clone(),
        OrchestratorConfig {
            lock_lease: args.lock_lease(),
            interval: args.orchestrator_interval(),
            ..Default::default()
        },
    );
    if !args.provision_inventory.is_empty() {
        let provider = args.provision_provider;
        let inventory = args
            .provision_inventory
            .iter()
            .map(|number| ProvisionedIdentity {
                phone_number: number.trim().to_string(),
                provider,
                external_ref: None,
            });
        orchestrator = orchestrator.with_provisioner(Arc::new(InventoryProvisioner::new(inventory)));
        info!(
            "Provisioning inventory: {} identities ({})",
            args.provision_inventory.len(),
            provider.as_str()
        );
    }
    let orchestrator = Arc::new(orchestrator);
    let admin = PoolAdmin::new(orchestrator.clone());

    if let Some(Command::Status) = args.command {
        let report = cli::pool_report(&admin).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let health = Arc::new(HealthMonitor::new(
        store.clone(),
        breaker.clone(),
        notifier.clone(),
        clock.clone(),
        HealthMonitorConfig {
            interval: args.health_interval(),
            ..Default::default()
        },
    ));

    let reconciler = Arc::new(TouchReconciler::new(
        store.clone(),
        clock.clone(),
        ReconcilerConfig {
            interval: args.reconcile_interval(),
            ..Default::default()
        },
    ));

    let selector = Arc::new(ChipSelector::new(
        store.clone(),
        reservoir.clone(),
        breaker.clone(),
        clock.clone(),
    ));
    let guardrails = Arc::new(StandardGuardrails::new(
        store.clone(),
        GuardrailConfig::default(),
    ));
    let dispatcher = OutboundDispatcher::new(
        store,
        selector,
        senders,
        breaker,
        guardrails,
        reservoir.clone(),
        Allowlist::new(args.environment, &args.allowlist),
        clock,
        DispatchConfig {
            dedup_window: args.dedup_window(),
        },
    );

    // Run one cycle up front so the pool status is known before the first tick
    match admin.trigger_cycle().await {
        Ok(report) => {
            if let Some(status) = &report.status {
                info!(
                    active = status.active,
                    ready = status.ready,
                    health = ?status.health,
                    "Initial pool status"
                );
            }
        }
        Err(e) => error!("Initial orchestrator cycle failed: {}", e),
    }

    let tasks = vec![
        spawn_orchestrator_task(orchestrator),
        spawn_health_monitor_task(health),
        spawn_reconciler_task(reconciler),
        spawn_reservoir_purge_task(reservoir, args.reservoir_purge_interval()),
    ];
    info!("Chip dispatch running, reading JSON messages from stdin, press Ctrl-C to stop");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = cli::dispatch_lines(&dispatcher, stdin, tokio::io::stdout()) => {
            match result {
                Ok(summary) => info!(
                    dispatched = summary.dispatched,
                    rejected = summary.rejected,
                    "Stdin closed, intake stopped"
                ),
                Err(e) => error!("Message intake failed: {}", e),
            }
            tokio::signal::ctrl_c().await?;
        }
        signal = tokio::signal::ctrl_c() => signal?,
    }
    info!("Shutting down");
    for task in &tasks {
        task.abort();
    }

    match admin.pool_status().await {
        Ok(status) => info!(
            active = status.active,
            ready = status.ready,
            health = ?status.health,
            "Pool status at shutdown"
        ),
        Err(e) => error!("Failed to read pool status: {}", e),
    }
    let stats = dispatcher.stats();
    info!(
        total = stats.total(),
        sent = stats.sent,
        blocked = stats.blocked,
        "Dispatcher stats at shutdown"
    );

    Ok(())
}
