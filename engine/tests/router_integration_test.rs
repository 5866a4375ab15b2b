//! Event router integration tests
//!
//! Duplicate suppression under concurrency: many tasks racing on the same
//! message id must admit exactly one dispatch, and completed dispatches
//! free the key for later redelivery.

use courier_engine::adapter::NormalizedEvent;
use courier_engine::router::{EventRouter, RoutePredicate};
use std::sync::Arc;

fn event(message_id: &str) -> NormalizedEvent {
    NormalizedEvent {
        platform: "discord".to_string(),
        channel_id: "c".to_string(),
        user_id: "u".to_string(),
        message_id: message_id.to_string(),
        is_dm: false,
        guild_id: "g".to_string(),
        content: "hello".to_string(),
        timestamp: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn test_racing_duplicates_admit_exactly_one() {
    let router = Arc::new(EventRouter::new());

    let mut handles = Vec::new();
    for _ in 0..16 {
        let router = Arc::clone(&router);
        handles.push(tokio::spawn(async move {
            match router.admit(&event("m-race")) {
                Ok(guard) => {
                    // Hold the guard briefly, as a real orchestration would.
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    drop(guard);
                    1usize
                }
                Err(_) => 0usize,
            }
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        admitted += handle.await.unwrap();
    }
    assert_eq!(admitted, 1);
    assert_eq!(router.in_flight(), 0);
}

#[tokio::test]
async fn test_redelivery_after_completion_is_admitted() {
    let router = EventRouter::new();

    let guard = router.admit(&event("m-redeliver")).unwrap();
    assert!(router.admit(&event("m-redeliver")).is_err());
    drop(guard);

    // The first orchestration finished; a redelivery may now run.
    assert!(router.admit(&event("m-redeliver")).is_ok());
}

#[tokio::test]
async fn test_rejection_has_no_side_effects() {
    let router = EventRouter::new();

    let _guard = router.admit(&event("m-held")).unwrap();
    assert_eq!(router.in_flight(), 1);

    for _ in 0..5 {
        assert!(router.admit(&event("m-held")).is_err());
        // Rejected admissions never change the in-flight set.
        assert_eq!(router.in_flight(), 1);
    }
}

#[tokio::test]
async fn test_routes_observed_but_default_applies() {
    let mut router = EventRouter::new();
    router.add_route("guild-traffic", RoutePredicate::IsDm(false));

    let ev = event("m-routed");
    assert_eq!(router.select_route(&ev), Some("guild-traffic"));

    // Routing does not interfere with admission.
    let _guard = router.admit(&ev).unwrap();
    assert!(router.admit(&ev).is_err());
}
