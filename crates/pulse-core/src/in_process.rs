//! Single-process broker.
//!
//! The in-process counterpart of a broadcast event bus, with fan-out scoped
//! per organization. Nothing crosses process boundaries, so there is no
//! transport to initialise and `emit` never fails on delivery.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::broker::validate_organization_id;
use crate::{Broker, BrokerBackend, Callback, Event, Result, SubscriberRegistry, Subscription};

/// Organization-scoped fan-out within one process.
#[derive(Clone, Default)]
pub struct InProcessBroker {
    registry: Arc<SubscriberRegistry>,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for InProcessBroker {
    fn backend(&self) -> BrokerBackend {
        BrokerBackend::InProcess
    }

    async fn subscribe(&self, organization_id: &str, callback: Callback) -> Result<Subscription> {
        validate_organization_id(organization_id)?;
        let registration = self.registry.insert(organization_id, callback);
        debug!(
            subsystem = "broker",
            component = "in_process",
            op = "subscribe",
            org_id = organization_id,
            subscriber_count = self.registry.count(organization_id),
            "Subscriber registered"
        );

        let registry = Arc::clone(&self.registry);
        let org = organization_id.to_string();
        let id = registration.id;
        Ok(Subscription::new(id, organization_id, move || {
            registry.remove(&org, id);
        }))
    }

    async fn emit(&self, event: Event) -> Result<()> {
        let delivered = self.registry.dispatch(&event);
        debug!(
            subsystem = "broker",
            component = "in_process",
            op = "emit",
            org_id = event.organization_id(),
            event_type = %event.kind(),
            delivered,
            "Broker emit"
        );
        Ok(())
    }

    fn subscriber_count(&self, organization_id: &str) -> usize {
        self.registry.count(organization_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::RecordingCallback;
    use crate::{callback, Error, EventType};
    use serde_json::json;

    fn event(org: &str, id: u32) -> Event {
        Event::new(EventType::RecordUpdated, org, json!({ "id": id })).unwrap()
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_in_emission_order() {
        let broker = InProcessBroker::new();
        let first = RecordingCallback::new();
        let second = RecordingCallback::new();
        let _s1 = broker.subscribe("org-o", first.callback()).await.unwrap();
        let _s2 = broker.subscribe("org-o", second.callback()).await.unwrap();

        for i in 0..10 {
            broker.emit(event("org-o", i)).await.unwrap();
        }

        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(first.record_ids(), expected);
        assert_eq!(second.record_ids(), expected);
    }

    #[tokio::test]
    async fn test_events_do_not_cross_organizations() {
        let broker = InProcessBroker::new();
        let a = RecordingCallback::new();
        let b = RecordingCallback::new();
        let _sa = broker.subscribe("org-a", a.callback()).await.unwrap();
        let _sb = broker.subscribe("org-b", b.callback()).await.unwrap();

        broker.emit(event("org-a", 1)).await.unwrap();

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let broker = InProcessBroker::new();
        let rec = RecordingCallback::new();
        let sub = broker.subscribe("org-a", rec.callback()).await.unwrap();

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(broker.subscriber_count("org-a"), 0);

        broker.emit(event("org-a", 1)).await.unwrap();
        assert_eq!(rec.len(), 0);
    }

    #[tokio::test]
    async fn test_reference_counting_to_zero() {
        let broker = InProcessBroker::new();
        let rec = RecordingCallback::new();
        let mut subs = Vec::new();
        for _ in 0..5 {
            subs.push(broker.subscribe("org-o", rec.callback()).await.unwrap());
        }
        assert_eq!(broker.subscriber_count("org-o"), 5);

        for sub in &subs {
            sub.unsubscribe();
        }
        assert_eq!(broker.subscriber_count("org-o"), 0);

        broker.emit(event("org-o", 1)).await.unwrap();
        assert_eq!(rec.len(), 0);
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_others() {
        let broker = InProcessBroker::new();
        let _bad = broker
            .subscribe(
                "org-a",
                callback(|_| Err(Error::Internal("boom".to_string()))),
            )
            .await
            .unwrap();
        let good = RecordingCallback::new();
        let _good = broker.subscribe("org-a", good.callback()).await.unwrap();

        broker.emit(event("org-a", 1)).await.unwrap();
        assert_eq!(good.len(), 1);
    }

    #[tokio::test]
    async fn test_no_replay_of_past_events() {
        let broker = InProcessBroker::new();
        broker.emit(event("org-a", 1)).await.unwrap();

        let rec = RecordingCallback::new();
        let _sub = broker.subscribe("org-a", rec.callback()).await.unwrap();
        assert_eq!(rec.len(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_rejects_blank_organization() {
        let broker = InProcessBroker::new();
        let rec = RecordingCallback::new();
        let result = broker.subscribe("", rec.callback()).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_ok() {
        let broker = InProcessBroker::new();
        broker.emit(event("org-a", 1)).await.unwrap();
        assert_eq!(broker.backend(), BrokerBackend::InProcess);
    }
}
