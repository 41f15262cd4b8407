//! Dispatch outcome schema
//!
//! Every dispatch call persists exactly one record with its terminal outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::chip::{ChipId, MessageType};

/// Why a guardrail stage denied a send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Allowlist,
    OptOut,
    CoolingOff,
    ContactCap,
    CampaignCooldown,
    SafeMode,
}

impl BlockReason {
    pub fn code(&self) -> &'static str {
        match self {
            BlockReason::Allowlist => "BLOCKED_ALLOWLIST",
            BlockReason::OptOut => "BLOCKED_OPT_OUT",
            BlockReason::CoolingOff => "BLOCKED_COOLING_OFF",
            BlockReason::ContactCap => "BLOCKED_CONTACT_CAP",
            BlockReason::CampaignCooldown => "BLOCKED_CAMPAIGN_COOLDOWN",
            BlockReason::SafeMode => "BLOCKED_SAFE_MODE",
        }
    }

    /// Pacing rules a human may override; consent and environment rules never are
    pub fn is_bypassable(&self) -> bool {
        matches!(
            self,
            BlockReason::CoolingOff | BlockReason::ContactCap | BlockReason::CampaignCooldown
        )
    }
}

/// Terminal outcome of a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Sent,
    /// Sent under a human-authorized guardrail override
    Bypass,
    Deduped,
    Blocked(BlockReason),
    FailedNoCapacity,
    FailedRateLimit,
    FailedCircuitOpen,
    FailedProvider,
    /// Configuration or infrastructure failure on the dispatch path
    Fatal,
}

impl DispatchOutcome {
    /// Machine-readable reason code
    pub fn reason_code(&self) -> &'static str {
        match self {
            DispatchOutcome::Sent => "SENT",
            DispatchOutcome::Bypass => "BYPASS",
            DispatchOutcome::Deduped => "DEDUPED",
            DispatchOutcome::Blocked(reason) => reason.code(),
            DispatchOutcome::FailedNoCapacity => "FAILED_NO_CAPACITY",
            DispatchOutcome::FailedRateLimit => "FAILED_RATE_LIMIT",
            DispatchOutcome::FailedCircuitOpen => "FAILED_CIRCUIT_OPEN",
            DispatchOutcome::FailedProvider => "FAILED_PROVIDER",
            DispatchOutcome::Fatal => "FATAL",
        }
    }

    /// The message reached the provider
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Sent | DispatchOutcome::Bypass)
    }

    /// Transient failures a caller may retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::FailedRateLimit
                | DispatchOutcome::FailedCircuitOpen
                | DispatchOutcome::FailedProvider
        )
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason_code())
    }
}

/// Persisted record of one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub id: Uuid,
    pub request_id: Uuid,
    pub destination: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub chip_id: Option<ChipId>,
    pub outcome: DispatchOutcome,
    pub reason_code: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub provider_message_id: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    /// Guardrail that was overridden, if any
    #[serde(default)]
    pub bypassed: Option<BlockReason>,
    pub created_at: DateTime<Utc>,
}

/// Sent message awaiting touch reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileCandidate {
    pub provider_message_id: String,
    pub recipient: String,
    pub sent_at: DateTime<Utc>,
    pub method: MessageType,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub chip_id: Option<ChipId>,
}

impl ReconcileCandidate {
    /// Build a candidate from a delivered dispatch record
    pub fn from_record(record: &DispatchRecord) -> Option<Self> {
        if !record.outcome.is_delivered() {
            return None;
        }
        let provider_message_id = record.provider_message_id.clone()?;
        Some(Self {
            provider_message_id,
            recipient: record.destination.clone(),
            sent_at: record.created_at,
            method: record.message_type,
            campaign_id: record.campaign_id.clone(),
            chip_id: record.chip_id.clone(),
        })
    }
}
