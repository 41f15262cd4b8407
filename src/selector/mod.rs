//! Chip selection and admission control
//!
//! Picks the chip that carries an outbound message:
//!
//! 1. Replies stay on the chip bound to the conversation when it can still
//!    carry them.
//! 2. Otherwise the eligible set is built from active chips
//!    (see [`eligibility::check_eligibility`]); an empty set is retried once
//!    with the relaxed fallback trust thresholds.
//! 3. A chip that already talked to the destination goes first; the rest are
//!    ordered by load this hour, then trust.
//!
//! [`ChipSelector::select_chip_with_reservation`] additionally takes an
//! atomic per-chip-per-hour slot from the [`RateReservoir`] so concurrent
//! dispatches cannot overshoot a chip's hourly limit.

pub mod eligibility;

pub use eligibility::{check_eligibility, is_available_for, is_replacement_candidate, Ineligible};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::coordination::RateReservoir;
use crate::db::schemas::{hour_bucket_label, Chip, ChipStatus, MessageType, SelectionDecisionLog};
use crate::db::{ChipFilter, Store};
use crate::types::Result;

/// Reservation counters outlive their hour bucket by a minute
pub const RESERVATION_TTL: Duration = Duration::from_secs(3660);

/// Selection input
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub message_type: MessageType,
    pub conversation_id: Option<String>,
    pub destination: Option<String>,
    pub excluded: HashSet<String>,
    /// Start directly with relaxed thresholds
    pub fallback: bool,
}

impl SelectionRequest {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            conversation_id: None,
            destination: None,
            excluded: HashSet::new(),
            fallback: false,
        }
    }

    pub fn conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn exclude(mut self, chip_id: impl Into<String>) -> Self {
        self.excluded.insert(chip_id.into());
        self
    }

    pub fn with_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    ConversationSticky,
    DestinationAffinity,
    LeastLoaded,
}

impl SelectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionReason::ConversationSticky => "conversation_sticky",
            SelectionReason::DestinationAffinity => "destination_affinity",
            SelectionReason::LeastLoaded => "least_loaded",
        }
    }
}

/// Hourly slot held on a chip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub key: String,
    /// Counter value right after this reservation
    pub count: u64,
}

#[derive(Debug, Clone)]
pub struct SelectedChip {
    pub chip: Chip,
    pub reason: SelectionReason,
    /// Chosen under relaxed thresholds
    pub fallback: bool,
    pub eligible_count: usize,
    pub reservation: Option<Reservation>,
}

/// Selection result; `NoChip` is a normal terminal condition, not an error
#[derive(Debug, Clone)]
pub enum Selection {
    Selected(SelectedChip),
    NoChip,
}

impl Selection {
    pub fn chip(&self) -> Option<&Chip> {
        match self {
            Selection::Selected(s) => Some(&s.chip),
            Selection::NoChip => None,
        }
    }

    pub fn into_selected(self) -> Option<SelectedChip> {
        match self {
            Selection::Selected(s) => Some(s),
            Selection::NoChip => None,
        }
    }
}

/// Reservation key for a chip's hour bucket
pub fn reservation_key(chip_id: &str, bucket: &str) -> String {
    format!("chip_rate:{}:{}", chip_id, bucket)
}

pub struct ChipSelector {
    store: Arc<dyn Store>,
    reservoir: Arc<dyn RateReservoir>,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
}

impl ChipSelector {
    pub fn new(
        store: Arc<dyn Store>,
        reservoir: Arc<dyn RateReservoir>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            reservoir,
            breaker,
            clock,
        }
    }

    pub async fn select_chip(&self, request: &SelectionRequest) -> Result<Selection> {
        self.select(request, false).await
    }

    /// Same as [`select_chip`](Self::select_chip), but every candidate must
    /// win an hourly reservation before it is returned
    pub async fn select_chip_with_reservation(
        &self,
        request: &SelectionRequest,
    ) -> Result<Selection> {
        self.select(request, true).await
    }

    /// Give back a reservation for a send that did not happen
    pub async fn release_reservation(&self, reservation: &Reservation) -> Result<()> {
        self.reservoir.decrement(&reservation.key).await?;
        debug!(key = %reservation.key, "Released rate reservation");
        Ok(())
    }

    /// Eligible active chips for a message type, unordered
    pub async fn eligible_chips(
        &self,
        message_type: MessageType,
        fallback: bool,
    ) -> Result<Vec<Chip>> {
        let config = self.store.load_pool_config().await?;
        let threshold = config.threshold(message_type, fallback);
        let now = self.clock.now();
        let chips = self.store.list_chips(&ChipFilter::status(ChipStatus::Active)).await?;
        Ok(chips
            .into_iter()
            .filter(|chip| {
                check_eligibility(
                    chip,
                    message_type,
                    threshold,
                    now,
                    self.breaker.is_open(&chip.id),
                    false,
                )
                .is_ok()
            })
            .collect())
    }

    async fn select(&self, request: &SelectionRequest, reserve: bool) -> Result<Selection> {
        if request.message_type == MessageType::Reply {
            if let Some(selected) = self.sticky_chip(request, reserve).await? {
                self.log_decision(request, Some(&selected)).await;
                return Ok(Selection::Selected(selected));
            }
        }

        let config = self.store.load_pool_config().await?;
        let now = self.clock.now();
        let active = self.store.list_chips(&ChipFilter::status(ChipStatus::Active)).await?;

        let passes = if request.fallback {
            vec![true]
        } else {
            vec![false, true]
        };
        for fallback in passes {
            let threshold = config.threshold(request.message_type, fallback);
            let mut eligible: Vec<Chip> = active
                .iter()
                .filter(|chip| {
                    check_eligibility(
                        chip,
                        request.message_type,
                        threshold,
                        now,
                        self.breaker.is_open(&chip.id),
                        request.excluded.contains(&chip.id),
                    )
                    .is_ok()
                })
                .cloned()
                .collect();
            if eligible.is_empty() {
                debug!(
                    message_type = %request.message_type,
                    fallback,
                    threshold,
                    "No eligible chips"
                );
                continue;
            }

            let affinity = self.order_candidates(&mut eligible, request, now).await;
            let eligible_count = eligible.len();
            for chip in eligible {
                let reservation = if reserve {
                    match self.try_reserve(&chip, now).await? {
                        Some(r) => Some(r),
                        None => continue,
                    }
                } else {
                    None
                };
                let reason = if affinity.as_deref() == Some(chip.id.as_str()) {
                    SelectionReason::DestinationAffinity
                } else {
                    SelectionReason::LeastLoaded
                };
                let selected = SelectedChip {
                    chip,
                    reason,
                    fallback,
                    eligible_count,
                    reservation,
                };
                self.log_decision(request, Some(&selected)).await;
                return Ok(Selection::Selected(selected));
            }
        }

        self.log_decision(request, None).await;
        Ok(Selection::NoChip)
    }

    /// Bound chip for a reply, if it can still carry the conversation
    async fn sticky_chip(
        &self,
        request: &SelectionRequest,
        reserve: bool,
    ) -> Result<Option<SelectedChip>> {
        let Some(conversation_id) = request.conversation_id.as_deref() else {
            return Ok(None);
        };
        let Some(binding) = self.store.conversation_binding(conversation_id).await? else {
            return Ok(None);
        };
        if !binding.active {
            return Ok(None);
        }
        let Some(chip) = self.store.get_chip(&binding.chip_id).await? else {
            return Ok(None);
        };
        if !chip.connected
            || !chip.capabilities.can_reply
            || request.excluded.contains(&chip.id)
            || self.breaker.is_open(&chip.id)
        {
            return Ok(None);
        }
        let reservation = if reserve {
            match self.try_reserve(&chip, self.clock.now()).await? {
                Some(r) => Some(r),
                None => return Ok(None),
            }
        } else {
            None
        };
        Ok(Some(SelectedChip {
            chip,
            reason: SelectionReason::ConversationSticky,
            fallback: false,
            eligible_count: 1,
            reservation,
        }))
    }

    /// Sort by load then trust; move the destination's affinity chip to the
    /// front. Returns the affinity chip id when one applied.
    async fn order_candidates(
        &self,
        eligible: &mut [Chip],
        request: &SelectionRequest,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<String> {
        eligible.sort_by(|a, b| {
            a.counters
                .hourly_at(now)
                .cmp(&b.counters.hourly_at(now))
                .then(b.trust_score.cmp(&a.trust_score))
                .then(a.id.cmp(&b.id))
        });

        let destination = request.destination.as_deref()?;
        let history = match self.store.contact_history(destination).await {
            Ok(history) => history,
            Err(e) => {
                warn!(destination = %destination, error = %e, "Affinity lookup failed");
                return None;
            }
        };
        let affinity = history
            .iter()
            .find_map(|contact| eligible.iter().position(|c| c.id == contact.chip_id))?;
        eligible[..=affinity].rotate_right(1);
        Some(eligible[0].id.clone())
    }

    /// Increment → check → conditional decrement
    async fn try_reserve(
        &self,
        chip: &Chip,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<Reservation>> {
        let key = reservation_key(&chip.id, &hour_bucket_label(now));
        let count = self.reservoir.increment(&key, RESERVATION_TTL).await?;
        if count > chip.counters.hourly_limit as u64 {
            // The refusal stands either way; an unreturned slot expires with the hour
            if let Err(e) = self.reservoir.decrement(&key).await {
                warn!(key = %key, error = %e, "Failed to return refused reservation");
            }
            debug!(
                chip_id = %chip.id,
                count,
                limit = chip.counters.hourly_limit,
                "Reservation refused"
            );
            return Ok(None);
        }
        Ok(Some(Reservation { key, count }))
    }

    async fn log_decision(&self, request: &SelectionRequest, selected: Option<&SelectedChip>) {
        let entry = SelectionDecisionLog {
            id: Uuid::new_v4(),
            message_type: request.message_type,
            conversation_id: request.conversation_id.clone(),
            destination: request.destination.clone(),
            eligible_count: selected.map_or(0, |s| s.eligible_count),
            chosen_chip: selected.map(|s| s.chip.id.clone()),
            reason: selected.map_or("no_chip", |s| s.reason.as_str()).to_string(),
            fallback: selected.map_or(request.fallback, |s| s.fallback),
            created_at: self.clock.now(),
        };
        if let Err(e) = self.store.record_selection(entry).await {
            warn!(error = %e, "Failed to record selection decision");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::clock::ManualClock;
    use crate::coordination::InMemoryReservoir;
    use crate::db::schemas::{ContactRecord, ConversationBinding, ProviderKind};
    use crate::db::InMemoryStore;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        store: Arc<InMemoryStore>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<ManualClock>,
        selector: ChipSelector,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 15, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::default(),
            clock.clone(),
        ));
        let reservoir = Arc::new(InMemoryReservoir::new(clock.clone()));
        let selector = ChipSelector::new(store.clone(), reservoir, breaker.clone(), clock.clone());
        Fixture {
            store,
            breaker,
            clock,
            selector,
        }
    }

    async fn add_active(f: &Fixture, id: &str, trust: i32) {
        let chip = Chip::new(id, format!("+1555{}", id), ProviderKind::CloudApi, f.clock.now())
            .with_status(ChipStatus::Active)
            .with_trust(trust)
            .with_connected(true);
        f.store.insert_chip(chip).await.unwrap();
    }

    #[tokio::test]
    async fn test_prefers_least_loaded_then_trust() {
        let f = fixture();
        add_active(&f, "a", 85).await;
        add_active(&f, "b", 95).await;
        f.store.record_chip_send("b", f.clock.now()).await.unwrap();

        let selection = f
            .selector
            .select_chip(&SelectionRequest::new(MessageType::Prospecting))
            .await
            .unwrap();
        let selected = selection.into_selected().unwrap();
        assert_eq!(selected.chip.id, "a");
        assert_eq!(selected.reason, SelectionReason::LeastLoaded);
        assert_eq!(selected.eligible_count, 2);
    }

    #[tokio::test]
    async fn test_destination_affinity_wins() {
        let f = fixture();
        add_active(&f, "a", 95).await;
        add_active(&f, "b", 85).await;
        f.store
            .record_contact(ContactRecord {
                destination: "+4470000".into(),
                chip_id: "b".into(),
                contacted_at: f.clock.now(),
            })
            .await
            .unwrap();

        let selected = f
            .selector
            .select_chip(&SelectionRequest::new(MessageType::Followup).destination("+4470000"))
            .await
            .unwrap()
            .into_selected()
            .unwrap();
        assert_eq!(selected.chip.id, "b");
        assert_eq!(selected.reason, SelectionReason::DestinationAffinity);
    }

    #[tokio::test]
    async fn test_reply_sticks_to_bound_chip() {
        let f = fixture();
        add_active(&f, "a", 95).await;
        add_active(&f, "b", 45).await;
        f.store
            .bind_conversation(ConversationBinding::new("conv-1", "b", f.clock.now()))
            .await
            .unwrap();

        let selected = f
            .selector
            .select_chip(&SelectionRequest::new(MessageType::Reply).conversation("conv-1"))
            .await
            .unwrap()
            .into_selected()
            .unwrap();
        assert_eq!(selected.chip.id, "b");
        assert_eq!(selected.reason, SelectionReason::ConversationSticky);

        for _ in 0..5 {
            f.breaker.record_failure("b");
        }
        let selected = f
            .selector
            .select_chip(&SelectionRequest::new(MessageType::Reply).conversation("conv-1"))
            .await
            .unwrap()
            .into_selected()
            .unwrap();
        assert_eq!(selected.chip.id, "a");
    }

    #[tokio::test]
    async fn test_excluded_chip_is_skipped() {
        let f = fixture();
        add_active(&f, "a", 95).await;
        let selection = f
            .selector
            .select_chip(&SelectionRequest::new(MessageType::Prospecting).exclude("a"))
            .await
            .unwrap();
        assert!(matches!(selection, Selection::NoChip));
    }

    #[tokio::test]
    async fn test_selection_is_logged() {
        let f = fixture();
        add_active(&f, "a", 95).await;
        f.selector
            .select_chip(&SelectionRequest::new(MessageType::Prospecting))
            .await
            .unwrap();
        let log = f.store.selection_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].chosen_chip.as_deref(), Some("a"));
        assert_eq!(log[0].reason, "least_loaded");
    }

    #[tokio::test]
    async fn test_reservation_released() {
        let f = fixture();
        let chip = Chip::new("a", "+15550001", ProviderKind::CloudApi, f.clock.now())
            .with_status(ChipStatus::Active)
            .with_trust(95)
            .with_connected(true)
            .with_limits(1, 100);
        f.store.insert_chip(chip).await.unwrap();
        let request = SelectionRequest::new(MessageType::Prospecting);

        let first = f.selector.select_chip_with_reservation(&request).await.unwrap();
        let reservation = first.into_selected().unwrap().reservation.unwrap();
        assert_eq!(reservation.count, 1);
        assert!(matches!(
            f.selector.select_chip_with_reservation(&request).await.unwrap(),
            Selection::NoChip
        ));

        f.selector.release_reservation(&reservation).await.unwrap();
        assert!(f
            .selector
            .select_chip_with_reservation(&request)
            .await
            .unwrap()
            .chip()
            .is_some());
    }

    /// Counts like the in-memory reservoir but cannot give slots back
    struct NoDecrementReservoir(InMemoryReservoir);

    #[async_trait::async_trait]
    impl RateReservoir for NoDecrementReservoir {
        async fn increment(&self, key: &str, ttl: std::time::Duration) -> Result<u64> {
            self.0.increment(key, ttl).await
        }

        async fn decrement(&self, _key: &str) -> Result<u64> {
            Err(crate::types::DispatchError::Reservoir("connection reset".into()))
        }

        async fn current(&self, key: &str) -> Result<u64> {
            self.0.current(key).await
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.0.remove(key).await
        }
    }

    #[tokio::test]
    async fn test_refused_reservation_survives_decrement_failure() {
        let f = fixture();
        let reservoir = Arc::new(NoDecrementReservoir(InMemoryReservoir::new(f.clock.clone())));
        let selector = ChipSelector::new(
            f.store.clone(),
            reservoir,
            f.breaker.clone(),
            f.clock.clone(),
        );
        let chip = Chip::new("a", "+15550001", ProviderKind::CloudApi, f.clock.now())
            .with_status(ChipStatus::Active)
            .with_trust(95)
            .with_connected(true)
            .with_limits(1, 100);
        f.store.insert_chip(chip).await.unwrap();
        let request = SelectionRequest::new(MessageType::Prospecting);

        assert!(selector
            .select_chip_with_reservation(&request)
            .await
            .unwrap()
            .chip()
            .is_some());
        assert!(matches!(
            selector.select_chip_with_reservation(&request).await.unwrap(),
            Selection::NoChip
        ));
    }
}
