//! Chip eligibility rules shared by the selector, orchestrator and health monitor

use chrono::{DateTime, Utc};
use std::fmt;

use crate::breaker::CircuitBreaker;
use crate::db::schemas::{Chip, ChipRole, ChipStatus, MessageType, PoolConfig};

/// Why a chip cannot take a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligible {
    NotActive(ChipStatus),
    NotSender,
    MissingCapability,
    LowTrust { trust: u8, threshold: u8 },
    Disconnected,
    CoolingDown,
    OverHourlyCap,
    OverDailyCap,
    CircuitOpen,
    Excluded,
}

impl fmt::Display for Ineligible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ineligible::NotActive(s) => write!(f, "status {}", s),
            Ineligible::NotSender => f.write_str("not a sender"),
            Ineligible::MissingCapability => f.write_str("missing capability"),
            Ineligible::LowTrust { trust, threshold } => {
                write!(f, "trust {} below {}", trust, threshold)
            }
            Ineligible::Disconnected => f.write_str("disconnected"),
            Ineligible::CoolingDown => f.write_str("cooling down"),
            Ineligible::OverHourlyCap => f.write_str("hourly cap reached"),
            Ineligible::OverDailyCap => f.write_str("daily cap reached"),
            Ineligible::CircuitOpen => f.write_str("circuit open"),
            Ineligible::Excluded => f.write_str("excluded"),
        }
    }
}

/// Full admission check for routing a message of `message_type` to `chip`
pub fn check_eligibility(
    chip: &Chip,
    message_type: MessageType,
    threshold: u8,
    now: DateTime<Utc>,
    circuit_open: bool,
    excluded: bool,
) -> Result<(), Ineligible> {
    if excluded {
        return Err(Ineligible::Excluded);
    }
    if chip.status != ChipStatus::Active {
        return Err(Ineligible::NotActive(chip.status));
    }
    if chip.role != ChipRole::Sender {
        return Err(Ineligible::NotSender);
    }
    if !chip.capabilities.allows(message_type) {
        return Err(Ineligible::MissingCapability);
    }
    if chip.trust_score < threshold {
        return Err(Ineligible::LowTrust {
            trust: chip.trust_score,
            threshold,
        });
    }
    if !chip.connected {
        return Err(Ineligible::Disconnected);
    }
    if chip.is_cooling_down(now) {
        return Err(Ineligible::CoolingDown);
    }
    if chip.counters.hourly_at(now) >= chip.counters.hourly_limit {
        return Err(Ineligible::OverHourlyCap);
    }
    if chip.counters.daily_at(now) >= chip.counters.daily_limit {
        return Err(Ineligible::OverDailyCap);
    }
    if circuit_open {
        return Err(Ineligible::CircuitOpen);
    }
    Ok(())
}

/// Whether the chip counts toward available capacity for `message_type`.
/// Uses the fallback threshold and ignores transient hourly caps.
pub fn is_available_for(
    chip: &Chip,
    message_type: MessageType,
    config: &PoolConfig,
    now: DateTime<Utc>,
    breaker: &CircuitBreaker,
) -> bool {
    chip.status == ChipStatus::Active
        && chip.role == ChipRole::Sender
        && chip.capabilities.allows(message_type)
        && chip.trust_score >= config.threshold(message_type, true)
        && chip.connected
        && !chip.is_cooling_down(now)
        && !breaker.is_open(&chip.id)
}

/// Ready chip fit to take over for a degraded one
pub fn is_replacement_candidate(chip: &Chip, config: &PoolConfig, breaker: &CircuitBreaker) -> bool {
    chip.status == ChipStatus::Ready
        && chip.role == ChipRole::Sender
        && chip.trust_score >= config.trust_ready
        && chip.connected
        && !breaker.is_open(&chip.id)
}
