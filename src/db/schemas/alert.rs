//! Alert schema
//!
//! Alerts are raised by the health monitor and the orchestrator. A chip-less
//! alert is a pool-level alert.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::chip::{ChipId, MessageType};

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the alert is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Disconnected,
    LowResponseRate,
    HighErrorRate,
    TrustDrop,
    TrustCritical,
    AutoDemoted,
    /// A chip needs replacing and no ready chip exists
    ReplacementUnavailable,
    /// Too few chips available for one message type
    PoolCapacity(MessageType),
    /// Too small a fraction of the pool is healthy
    PoolUnhealthy,
    /// Pool status snapshot computed as critical
    PoolCritical,
}

impl AlertKind {
    pub fn label(&self) -> String {
        match self {
            AlertKind::Disconnected => "disconnected".to_string(),
            AlertKind::LowResponseRate => "low_response_rate".to_string(),
            AlertKind::HighErrorRate => "high_error_rate".to_string(),
            AlertKind::TrustDrop => "trust_drop".to_string(),
            AlertKind::TrustCritical => "trust_critical".to_string(),
            AlertKind::AutoDemoted => "auto_demoted".to_string(),
            AlertKind::ReplacementUnavailable => "replacement_unavailable".to_string(),
            AlertKind::PoolCapacity(t) => format!("pool_capacity_{}", t.as_str()),
            AlertKind::PoolUnhealthy => "pool_unhealthy".to_string(),
            AlertKind::PoolCritical => "pool_critical".to_string(),
        }
    }
}

/// Alert row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    /// None for pool-level alerts
    pub chip_id: Option<ChipId>,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    /// Refreshed every time the same condition is observed again
    pub last_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(
        chip_id: Option<ChipId>,
        kind: AlertKind,
        severity: Severity,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            chip_id,
            kind,
            severity,
            message: message.into(),
            resolved: false,
            created_at: now,
            last_seen_at: now,
            resolved_at: None,
        }
    }

    pub fn is_pool_level(&self) -> bool {
        self.chip_id.is_none()
    }
}

/// Filter for listing alerts
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub chip_id: Option<ChipId>,
    pub kind: Option<AlertKind>,
    pub include_resolved: bool,
    pub limit: Option<usize>,
}
