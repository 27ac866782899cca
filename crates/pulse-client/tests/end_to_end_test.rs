//! Consumer against a real pulse-api router on a local socket.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;

use pulse_api::auth::{ORGANIZATIONS_HEADER, USER_ID_HEADER};
use pulse_api::{router, AppState, GatewayHeaderResolver, StreamSettings};
use pulse_client::{ConsumerState, EventConsumer, HttpEventSource, QueryKey, RecordingInvalidator};
use pulse_core::{Broker, Event, EventType, InProcessBroker};

async fn serve(broker: Arc<InProcessBroker>, stream: StreamSettings) -> String {
    let state = AppState::new(broker, Arc::new(GatewayHeaderResolver::new()), stream);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

fn org_1_source(url: &str) -> HttpEventSource {
    HttpEventSource::new(url)
        .unwrap()
        .with_header(USER_ID_HEADER, "user-1")
        .unwrap()
        .with_header(ORGANIZATIONS_HEADER, "org-1")
        .unwrap()
}

async fn wait_for_state(consumer: &EventConsumer<HttpEventSource>, wanted: ConsumerState) {
    let mut rx = consumer.watch_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == wanted))
        .await
        .expect("state not reached")
        .unwrap();
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn test_emitted_event_invalidates_client_cache() {
    let broker = Arc::new(InProcessBroker::new());
    let url = serve(broker.clone(), StreamSettings::default()).await;

    let source = HttpEventSource::new(&url)
        .unwrap()
        .with_header(USER_ID_HEADER, "user-1")
        .unwrap()
        .with_header(ORGANIZATIONS_HEADER, "org-1")
        .unwrap();
    let invalidator = RecordingInvalidator::new();
    let mut consumer = EventConsumer::new(source, Arc::new(invalidator.clone()));

    consumer.mount("org-1").await.unwrap();
    wait_for_state(&consumer, ConsumerState::Open).await;
    assert!(eventually(|| broker.subscriber_count("org-1") == 1).await);

    let other = Event::new(EventType::RecordCreated, "org-2", json!({"id": "x"})).unwrap();
    broker.emit(other).await.unwrap();
    let event = Event::new(EventType::RecordUpdated, "org-1", json!({"id": "rec-42"})).unwrap();
    broker.emit(event).await.unwrap();

    assert!(eventually(|| invalidator.len() >= 2).await);
    assert_eq!(
        invalidator.keys(),
        vec![
            QueryKey::Collection {
                organization_id: "org-1".to_string()
            },
            QueryKey::Record {
                record_id: "rec-42".to_string()
            },
        ]
    );

    consumer.unmount().await;
    assert_eq!(consumer.state(), ConsumerState::Closed);
}

#[tokio::test]
async fn test_foreign_organization_disconnects_without_retry() {
    let broker = Arc::new(InProcessBroker::new());
    let url = serve(broker.clone(), StreamSettings::default()).await;

    let source = HttpEventSource::new(&url)
        .unwrap()
        .with_header(USER_ID_HEADER, "user-1")
        .unwrap()
        .with_header(ORGANIZATIONS_HEADER, "org-1")
        .unwrap();
    let mut consumer = EventConsumer::new(source, Arc::new(RecordingInvalidator::new()));

    consumer.mount("org-2").await.unwrap();
    wait_for_state(&consumer, ConsumerState::Disconnected).await;
    assert_eq!(broker.subscriber_count("org-2"), 0);
}

#[tokio::test]
async fn test_quiet_connection_stays_open_past_idle_timeout() {
    let broker = Arc::new(InProcessBroker::new());
    let settings = StreamSettings {
        capacity: 64,
        idle_timeout: Some(Duration::from_millis(300)),
        keepalive: Duration::from_millis(50),
    };
    let url = serve(broker.clone(), settings).await;

    let invalidator = RecordingInvalidator::new();
    let mut consumer = EventConsumer::new(org_1_source(&url), Arc::new(invalidator.clone()));
    consumer.mount("org-1").await.unwrap();
    wait_for_state(&consumer, ConsumerState::Open).await;
    assert!(eventually(|| broker.subscriber_count("org-1") == 1).await);

    let mut states = consumer.watch_state();
    states.borrow_and_update();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(!states.has_changed().unwrap());
    assert_eq!(consumer.state(), ConsumerState::Open);
    assert_eq!(broker.subscriber_count("org-1"), 1);

    let event = Event::new(EventType::RecordUpdated, "org-1", json!({"id": "r1"})).unwrap();
    broker.emit(event).await.unwrap();

    assert!(eventually(|| invalidator.len() >= 2).await);
    assert!(invalidator.keys().contains(&QueryKey::Record {
        record_id: "r1".to_string()
    }));

    consumer.unmount().await;
}
