//! Audit schemas: operation log and selection decision log
//!
//! Both are append-only. The operation log is the audit trail of lifecycle
//! actions; the selection log is debug output that nothing depends on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::chip::{ChipId, MessageType};

/// Kind of lifecycle action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Provisioned/pending chip connected and started warming
    WarmupStarted,
    /// Degraded chip replaced by a ready chip
    AutoReplace,
    PromoteReady,
    PromoteActive,
    AutoDemote,
    Provision,
    ManualPromote,
    ManualDemote,
    Reactivate,
    Retire,
    ConfigUpdate,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::WarmupStarted => "warmup_started",
            OperationKind::AutoReplace => "auto_replace",
            OperationKind::PromoteReady => "promote_ready",
            OperationKind::PromoteActive => "promote_active",
            OperationKind::AutoDemote => "auto_demote",
            OperationKind::Provision => "provision",
            OperationKind::ManualPromote => "manual_promote",
            OperationKind::ManualDemote => "manual_demote",
            OperationKind::Reactivate => "reactivate",
            OperationKind::Retire => "retire",
            OperationKind::ConfigUpdate => "config_update",
        }
    }
}

/// Append-only record of an orchestrator or admin action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLog {
    pub id: Uuid,
    pub kind: OperationKind,
    pub chip_id: Option<ChipId>,
    /// Second chip involved, e.g. the replacement in an auto-replace
    pub related_chip_id: Option<ChipId>,
    pub reason: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl OperationLog {
    pub fn new(
        kind: OperationKind,
        chip_id: Option<ChipId>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            chip_id,
            related_chip_id: None,
            reason: reason.into(),
            metadata: serde_json::Value::Null,
            created_at: now,
        }
    }

    pub fn with_related(mut self, chip_id: ChipId) -> Self {
        self.related_chip_id = Some(chip_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Record of one selection decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionDecisionLog {
    pub id: Uuid,
    pub message_type: MessageType,
    pub conversation_id: Option<String>,
    pub destination: Option<String>,
    pub eligible_count: usize,
    pub chosen_chip: Option<ChipId>,
    pub reason: String,
    pub fallback: bool,
    pub created_at: DateTime<Utc>,
}
