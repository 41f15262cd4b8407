//! Pure health checks over chip rows

use chrono::{DateTime, Utc};

use crate::breaker::CircuitBreaker;
use crate::db::schemas::{AlertKind, Chip, ChipStatus, MessageType, PoolConfig, QualityTier, Severity};
use crate::selector::is_available_for;

/// Condition observed on a chip or the pool
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
}

impl Finding {
    fn new(kind: AlertKind, severity: Severity, message: String) -> Self {
        Self {
            kind,
            severity,
            message,
        }
    }
}

/// Chips the monitor evaluates individually
pub fn is_monitored(status: ChipStatus) -> bool {
    matches!(
        status,
        ChipStatus::Warming | ChipStatus::Ready | ChipStatus::Active
    )
}

/// Chips counted in the in-service pool for the healthy-fraction check
pub fn is_in_service(status: ChipStatus) -> bool {
    is_monitored(status) || status == ChipStatus::Degraded
}

pub fn check_chip(chip: &Chip, config: &PoolConfig) -> Vec<Finding> {
    let health = &config.health;
    let mut findings = Vec::new();

    if !chip.connected {
        let severity = if chip.status == ChipStatus::Active {
            Severity::Critical
        } else {
            Severity::Warning
        };
        findings.push(Finding::new(
            AlertKind::Disconnected,
            severity,
            format!("{} chip {} is disconnected", chip.status, chip.id),
        ));
    }

    let sampled = chip.rolling_attempts() >= health.min_sample;
    if sampled {
        if let Some(rate) = chip.response_rate {
            if rate < health.response_rate_floor {
                findings.push(Finding::new(
                    AlertKind::LowResponseRate,
                    Severity::Warning,
                    format!(
                        "chip {} response rate {:.1}% below {:.1}%",
                        chip.id,
                        rate * 100.0,
                        health.response_rate_floor * 100.0
                    ),
                ));
            }
        }
        let error_rate = chip.error_rate();
        if error_rate > health.error_rate_ceiling {
            findings.push(Finding::new(
                AlertKind::HighErrorRate,
                Severity::Warning,
                format!(
                    "chip {} error rate {:.1}% above {:.1}% ({} of {})",
                    chip.id,
                    error_rate * 100.0,
                    health.error_rate_ceiling * 100.0,
                    chip.rolling_errors,
                    chip.rolling_attempts()
                ),
            ));
        }
    }

    if let Some(previous) = chip.trust_score_24h_ago {
        let drop = previous.saturating_sub(chip.trust_score);
        if drop >= health.trust_drop_24h && drop > 0 {
            findings.push(Finding::new(
                AlertKind::TrustDrop,
                Severity::Warning,
                format!(
                    "chip {} trust fell {} points in 24h ({} -> {})",
                    chip.id, drop, previous, chip.trust_score
                ),
            ));
        }
    }

    if chip.trust_score < config.trust_critical {
        findings.push(Finding::new(
            AlertKind::TrustCritical,
            Severity::Critical,
            format!(
                "chip {} trust {} below critical floor {}",
                chip.id, chip.trust_score, config.trust_critical
            ),
        ));
    }

    findings
}

/// Reason to force a chip into `degraded`, if any
pub fn demotion_reason(
    chip: &Chip,
    config: &PoolConfig,
    consecutive_failures: u32,
) -> Option<String> {
    if chip.trust_score < config.trust_critical {
        return Some(format!(
            "trust {} below critical floor {}",
            chip.trust_score, config.trust_critical
        ));
    }
    if consecutive_failures >= config.health.breaker_demote_failures {
        return Some(format!("{} consecutive send failures", consecutive_failures));
    }
    if chip.quality_tier == QualityTier::Red {
        return Some("provider quality rating is red".to_string());
    }
    None
}

/// A chip in service that is fit to carry traffic
pub fn is_healthy(chip: &Chip, config: &PoolConfig, breaker: &CircuitBreaker) -> bool {
    chip.connected
        && chip.status != ChipStatus::Degraded
        && chip.trust_score >= config.trust_degraded
        && chip.quality_tier != QualityTier::Red
        && !breaker.is_open(&chip.id)
}

pub fn check_pool(
    chips: &[Chip],
    config: &PoolConfig,
    now: DateTime<Utc>,
    breaker: &CircuitBreaker,
) -> Vec<Finding> {
    let mut findings = Vec::new();

    for message_type in MessageType::ALL {
        let minimum = config.min_available.for_type(message_type);
        let available = chips
            .iter()
            .filter(|c| is_available_for(c, message_type, config, now, breaker))
            .count() as u32;
        if available < minimum {
            let severity = if available == 0 {
                Severity::Critical
            } else {
                Severity::Warning
            };
            findings.push(Finding::new(
                AlertKind::PoolCapacity(message_type),
                severity,
                format!(
                    "{} capacity {} below minimum {}",
                    message_type, available, minimum
                ),
            ));
        }
    }

    let in_service: Vec<&Chip> = chips.iter().filter(|c| is_in_service(c.status)).collect();
    if !in_service.is_empty() {
        let healthy = in_service
            .iter()
            .filter(|c| is_healthy(c, config, breaker))
            .count();
        let fraction = healthy as f64 / in_service.len() as f64;
        if fraction < config.health.healthy_fraction_floor {
            findings.push(Finding::new(
                AlertKind::PoolUnhealthy,
                Severity::Warning,
                format!(
                    "{} of {} chips healthy ({:.0}% < {:.0}%)",
                    healthy,
                    in_service.len(),
                    fraction * 100.0,
                    config.health.healthy_fraction_floor * 100.0
                ),
            ));
        }
    }

    findings
}
