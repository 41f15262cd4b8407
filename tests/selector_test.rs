//! Chip selector integration tests
//!
//! Tests admission control against the in-memory store and reservoir:
//! - relaxed-threshold fallback pass
//! - circuit breaker exclusion
//! - atomic hourly reservations under concurrency
//! - conversation stickiness and destination affinity

mod common;

use chip_dispatch::db::schemas::{ChipStatus, ContactRecord, ConversationBinding, MessageType};
use chip_dispatch::db::Store;
use chip_dispatch::selector::{Selection, SelectionReason, SelectionRequest};
use common::{start_time, Harness};

fn open_circuit(h: &Harness, chip_id: &str) {
    for _ in 0..h.breaker.config().failure_threshold {
        h.breaker.record_failure(chip_id);
    }
    assert!(h.breaker.is_open(chip_id));
}

// =============================================================================
// Fallback
// =============================================================================

#[tokio::test]
async fn test_prospecting_falls_back_to_relaxed_threshold() {
    let h = Harness::new();
    h.add_chip("chip-65", ChipStatus::Active, 65).await;
    h.add_chip("chip-50", ChipStatus::Active, 50).await;
    let selector = h.selector();

    let selection = selector
        .select_chip(&SelectionRequest::new(MessageType::Prospecting))
        .await
        .unwrap();

    let selected = selection.into_selected().expect("fallback should find a chip");
    assert_eq!(selected.chip.id, "chip-65");
    assert!(selected.fallback);
    assert_eq!(selected.eligible_count, 1);
}

#[tokio::test]
async fn test_primary_pass_preferred_over_fallback() {
    let h = Harness::new();
    h.add_chip("chip-65", ChipStatus::Active, 65).await;
    h.add_chip("chip-85", ChipStatus::Active, 85).await;

    let selected = h
        .selector()
        .select_chip(&SelectionRequest::new(MessageType::Prospecting))
        .await
        .unwrap()
        .into_selected()
        .unwrap();

    assert_eq!(selected.chip.id, "chip-85");
    assert!(!selected.fallback);
}

#[tokio::test]
async fn test_no_chip_is_a_value_not_an_error() {
    let h = Harness::new();
    h.add_chip("chip-ready", ChipStatus::Ready, 95).await;
    h.add_chip("chip-low", ChipStatus::Active, 30).await;

    let selection = h
        .selector()
        .select_chip(&SelectionRequest::new(MessageType::Prospecting))
        .await
        .unwrap();
    assert!(matches!(selection, Selection::NoChip));
}

// =============================================================================
// Circuit breaker
// =============================================================================

#[tokio::test]
async fn test_open_circuit_chip_is_never_selected() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    h.add_chip("chip-b", ChipStatus::Active, 85).await;
    open_circuit(&h, "chip-a");
    let selector = h.selector();

    for _ in 0..5 {
        let selected = selector
            .select_chip(&SelectionRequest::new(MessageType::Followup))
            .await
            .unwrap()
            .into_selected()
            .unwrap();
        assert_eq!(selected.chip.id, "chip-b");
    }

    open_circuit(&h, "chip-b");
    let selection = selector
        .select_chip(&SelectionRequest::new(MessageType::Followup))
        .await
        .unwrap();
    assert!(matches!(selection, Selection::NoChip));
}

#[tokio::test]
async fn test_sticky_reply_skips_open_circuit() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    h.add_chip("chip-b", ChipStatus::Active, 85).await;
    h.store
        .bind_conversation(ConversationBinding::new("conv-1", "chip-b", start_time()))
        .await
        .unwrap();
    open_circuit(&h, "chip-b");

    let selected = h
        .selector()
        .select_chip(&SelectionRequest::new(MessageType::Reply).conversation("conv-1"))
        .await
        .unwrap()
        .into_selected()
        .unwrap();
    assert_eq!(selected.chip.id, "chip-a");
    assert_ne!(selected.reason, SelectionReason::ConversationSticky);
}

// =============================================================================
// Reservations
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_never_exceed_hourly_limit() {
    const LIMIT: u32 = 7;
    let h = Harness::new();
    h.insert(
        h.new_chip("chip-a", ChipStatus::Active, 95)
            .with_limits(LIMIT, 1000),
    )
    .await;
    let selector = h.selector();

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let selector = selector.clone();
            tokio::spawn(async move {
                selector
                    .select_chip_with_reservation(&SelectionRequest::new(MessageType::Followup))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut granted = 0;
    for task in tasks {
        if let Selection::Selected(selected) = task.await.unwrap() {
            let reservation = selected.reservation.expect("reservation attached");
            assert!(reservation.count <= LIMIT as u64);
            granted += 1;
        }
    }
    assert_eq!(granted, LIMIT);
}

#[tokio::test]
async fn test_released_reservation_frees_capacity() {
    let h = Harness::new();
    h.insert(h.new_chip("chip-a", ChipStatus::Active, 95).with_limits(1, 1000))
        .await;
    let selector = h.selector();
    let request = SelectionRequest::new(MessageType::Followup);

    let first = selector
        .select_chip_with_reservation(&request)
        .await
        .unwrap()
        .into_selected()
        .unwrap();
    assert!(matches!(
        selector.select_chip_with_reservation(&request).await.unwrap(),
        Selection::NoChip
    ));

    selector
        .release_reservation(first.reservation.as_ref().unwrap())
        .await
        .unwrap();
    assert!(selector
        .select_chip_with_reservation(&request)
        .await
        .unwrap()
        .chip()
        .is_some());
}

// =============================================================================
// Stickiness and affinity
// =============================================================================

#[tokio::test]
async fn test_reply_stays_on_bound_chip() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    h.add_chip("chip-b", ChipStatus::Active, 45).await;
    h.store
        .bind_conversation(ConversationBinding::new("conv-1", "chip-b", start_time()))
        .await
        .unwrap();

    let selected = h
        .selector()
        .select_chip(&SelectionRequest::new(MessageType::Reply).conversation("conv-1"))
        .await
        .unwrap()
        .into_selected()
        .unwrap();
    assert_eq!(selected.chip.id, "chip-b");
    assert_eq!(selected.reason, SelectionReason::ConversationSticky);
}

#[tokio::test]
async fn test_destination_affinity_goes_first() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    h.add_chip("chip-b", ChipStatus::Active, 85).await;
    h.store
        .record_contact(ContactRecord {
            destination: "+15550100".into(),
            chip_id: "chip-b".into(),
            contacted_at: start_time(),
        })
        .await
        .unwrap();
    let selector = h.selector();

    let selected = selector
        .select_chip(&SelectionRequest::new(MessageType::Followup).destination("+15550100"))
        .await
        .unwrap()
        .into_selected()
        .unwrap();
    assert_eq!(selected.chip.id, "chip-b");
    assert_eq!(selected.reason, SelectionReason::DestinationAffinity);

    let other = selector
        .select_chip(&SelectionRequest::new(MessageType::Followup).destination("+15550199"))
        .await
        .unwrap()
        .into_selected()
        .unwrap();
    assert_eq!(other.chip.id, "chip-a");
    assert_eq!(other.reason, SelectionReason::LeastLoaded);
}
