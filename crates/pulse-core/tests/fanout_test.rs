//! Cross-process fan-out over a shared relay.
//!
//! Two `RelayBroker`s on one `LoopbackHub` stand in for two server processes
//! connected to the same transport.

use pulse_core::test_fixtures::{LoopbackHub, RecordingCallback};
use pulse_core::{Broker, Event, EventType, RelayBroker};
use serde_json::json;

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn event(org: &str, id: &str) -> Event {
    Event::new(EventType::RecordUpdated, org, json!({ "id": id })).unwrap()
}

#[tokio::test]
async fn test_emit_reaches_subscriber_in_other_process() {
    let hub = LoopbackHub::new();
    let process_1 = RelayBroker::new(hub.relay());
    let process_2 = RelayBroker::new(hub.relay());

    let x = RecordingCallback::new();
    let y = RecordingCallback::new();
    let _sx = process_2.subscribe("org-x", x.callback()).await.unwrap();
    let _sy = process_2.subscribe("org-y", y.callback()).await.unwrap();

    process_1.emit(event("org-x", "e1")).await.unwrap();
    settle().await;

    assert_eq!(x.record_ids(), vec!["e1".to_string()]);
    assert!(y.is_empty());
}

#[tokio::test]
async fn test_each_process_delivers_exactly_once() {
    let hub = LoopbackHub::new();
    let process_1 = RelayBroker::new(hub.relay());
    let process_2 = RelayBroker::new(hub.relay());

    let local = RecordingCallback::new();
    let remote = RecordingCallback::new();
    let _s1 = process_1.subscribe("org-x", local.callback()).await.unwrap();
    let _s2 = process_2.subscribe("org-x", remote.callback()).await.unwrap();

    for i in 0..5 {
        process_1.emit(event("org-x", &i.to_string())).await.unwrap();
    }
    settle().await;

    let expected: Vec<String> = (0..5).map(|i| i.to_string()).collect();
    assert_eq!(local.record_ids(), expected);
    assert_eq!(remote.record_ids(), expected);
}

#[tokio::test]
async fn test_released_organization_stops_cross_process_delivery() {
    let hub = LoopbackHub::new();
    let process_1 = RelayBroker::new(hub.relay());
    let process_2 = RelayBroker::new(hub.relay());

    let rec = RecordingCallback::new();
    let sub = process_2.subscribe("org-x", rec.callback()).await.unwrap();
    assert_eq!(hub.channel_listeners("org-x"), 1);

    drop(sub);
    settle().await;
    assert_eq!(hub.channel_listeners("org-x"), 0);

    process_1.emit(event("org-x", "late")).await.unwrap();
    settle().await;
    assert!(rec.is_empty());
}
