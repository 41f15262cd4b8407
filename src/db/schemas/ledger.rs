//! Reconciliation ledger schema
//!
//! One row per provider message id. The row's existence is the claim: the
//! store must reject a second insert for the same id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ledger row status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Processing,
    Ok,
    SkippedNoChange,
    SkippedAlreadyNewer,
    SkippedAlreadyProcessed,
    Abandoned,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Processing => "processing",
            LedgerStatus::Ok => "ok",
            LedgerStatus::SkippedNoChange => "skipped_no_change",
            LedgerStatus::SkippedAlreadyNewer => "skipped_already_newer",
            LedgerStatus::SkippedAlreadyProcessed => "skipped_already_processed",
            LedgerStatus::Abandoned => "abandoned",
            LedgerStatus::Failed => "failed",
        }
    }

    /// Rows in these states may be claimed again
    pub fn is_reclaimable(&self) -> bool {
        matches!(self, LedgerStatus::Abandoned)
    }
}

/// Ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub provider_message_id: String,
    pub status: LedgerStatus,
    pub claimed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub detail: Option<String>,
    /// Number of times the row was claimed (1 unless reclaimed)
    #[serde(default = "default_claims")]
    pub claims: u32,
}

fn default_claims() -> u32 {
    1
}

impl LedgerEntry {
    pub fn processing(provider_message_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            provider_message_id: provider_message_id.into(),
            status: LedgerStatus::Processing,
            claimed_at: now,
            updated_at: now,
            detail: None,
            claims: 1,
        }
    }
}
