//! Pool status snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::breaker::CircuitBreaker;
use crate::db::schemas::{Chip, ChipStatus, MessageType, PoolConfig};
use crate::selector::is_available_for;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealth {
    Healthy,
    Warning,
    Critical,
}

impl PoolHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolHealth::Healthy => "healthy",
            PoolHealth::Warning => "warning",
            PoolHealth::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Chip count per lifecycle status
    pub by_status: BTreeMap<ChipStatus, usize>,
    /// Chips able to carry each message type right now
    pub available: BTreeMap<String, usize>,
    pub active: usize,
    pub ready: usize,
    /// Provisioned, pending and warming chips
    pub warming_buffer: usize,
    /// Active chips missing to reach the configured minimum
    pub production_deficit: usize,
    pub health: PoolHealth,
    /// Reasons behind a non-healthy verdict
    pub issues: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

impl PoolStatus {
    pub fn compute(
        chips: &[Chip],
        config: &PoolConfig,
        now: DateTime<Utc>,
        breaker: &CircuitBreaker,
    ) -> Self {
        let mut by_status: BTreeMap<ChipStatus, usize> =
            ChipStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for chip in chips {
            *by_status.entry(chip.status).or_default() += 1;
        }
        let count = |s: ChipStatus| by_status.get(&s).copied().unwrap_or(0);

        let active = count(ChipStatus::Active);
        let ready = count(ChipStatus::Ready);
        let warming_buffer =
            count(ChipStatus::Provisioned) + count(ChipStatus::Pending) + count(ChipStatus::Warming);
        let production_deficit = (config.min_active as usize).saturating_sub(active);

        let mut issues = Vec::new();
        let mut health = PoolHealth::Healthy;
        let mut available = BTreeMap::new();

        for message_type in MessageType::ALL {
            let n = chips
                .iter()
                .filter(|c| is_available_for(c, message_type, config, now, breaker))
                .count();
            available.insert(message_type.as_str().to_string(), n);
            if n == 0 && config.min_available.for_type(message_type) > 0 {
                health = PoolHealth::Critical;
                issues.push(format!("no chip available for {}", message_type));
            }
        }

        if active == 0 && config.min_active > 0 {
            health = PoolHealth::Critical;
            issues.push("no active chips".to_string());
        } else if production_deficit > 0 {
            health = health.max(PoolHealth::Warning);
            issues.push(format!(
                "active {} below minimum {}",
                active, config.min_active
            ));
        }
        if ready < config.min_ready_buffer as usize {
            health = health.max(PoolHealth::Warning);
            issues.push(format!(
                "ready buffer {} below minimum {}",
                ready, config.min_ready_buffer
            ));
        }

        Self {
            by_status,
            available,
            active,
            ready,
            warming_buffer,
            production_deficit,
            health,
            issues,
            computed_at: now,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.health == PoolHealth::Critical
    }
}
