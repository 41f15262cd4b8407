//! Chip dispatch - outbound chip pool orchestration and dispatch
//!
//! Manages a pool of sending identities ("chips") and routes outbound
//! messages through them.
//!
//! ## Services
//!
//! - **Orchestrator**: chip lifecycle, auto-replacement, promotion and
//!   provisioning, serialized across instances by a lease lock
//! - **Selector**: admission control, picks the chip for a message and
//!   reserves hourly capacity
//! - **Health**: per-chip and pool checks, alerting and auto-demotion
//! - **Dispatch**: allowlist, dedup and guardrail pipeline in front of the
//!   senders
//! - **Reconcile**: idempotent repair of recipient touch attribution

pub mod breaker;
pub mod cli;
pub mod clock;
pub mod config;
pub mod coordination;
pub mod db;
pub mod dispatch;
pub mod health;
pub mod notify;
pub mod orchestrator;
pub mod reconcile;
pub mod selector;
pub mod sender;
pub mod types;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Args;
pub use dispatch::{DispatchConfig, DispatchReport, OutboundDispatcher, OutboundMessage};
pub use health::{spawn_health_monitor_task, HealthMonitor, HealthMonitorConfig};
pub use orchestrator::{spawn_orchestrator_task, OrchestratorConfig, PoolAdmin, PoolOrchestrator};
pub use reconcile::{spawn_reconciler_task, ReconcilerConfig, TouchReconciler};
pub use selector::ChipSelector;
pub use types::{DispatchError, Result};
