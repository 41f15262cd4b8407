//! Row schemas
//!
//! Defines the records the store keeps for chips, pool configuration, alerts,
//! audit logs, touch attribution and the reconciliation ledger.

mod alert;
mod audit;
mod chip;
mod dispatch_record;
mod ledger;
mod pool_config;
mod touch;

pub use alert::{Alert, AlertFilter, AlertKind, Severity};
pub use audit::{OperationKind, OperationLog, SelectionDecisionLog};
pub use chip::{
    clamp_trust, hour_bucket_label, hour_start, Capabilities, Chip, ChipId, ChipRole, ChipStatus,
    MessageType, ProviderKind, QualityTier, RateCounters, WarmupPhase, DEFAULT_TRUST, MAX_TRUST,
};
pub use dispatch_record::{BlockReason, DispatchOutcome, DispatchRecord, ReconcileCandidate};
pub use ledger::{LedgerEntry, LedgerStatus};
pub use pool_config::{CapabilityMinimums, HealthThresholds, PoolConfig, TrustThresholds};
pub use touch::{
    normalize_destination, ContactRecord, ConversationBinding, OptOut, TouchAdvance, TouchState};
