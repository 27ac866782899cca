//! Cross-process broker built on a pluggable [`Relay`] transport.
//!
//! A relay is the transport half of a broker: it publishes serialized
//! envelopes to a shared channel and yields whatever arrives on it. The
//! [`RelayBroker`] adds the parts every cross-process backend shares:
//!
//! - synchronous local fan-out before publishing,
//! - origin tagging, so a process does not re-deliver its own events,
//! - lazy, single initialisation of the inbound path on first subscribe,
//! - per-organization join/leave with reference counting,
//! - a receive loop that discards malformed messages and reconnects with
//!   capped exponential backoff when the inbound stream ends.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::backoff::backoff_delay;
use crate::broker::validate_organization_id;
use crate::{Broker, BrokerBackend, Callback, Event, Result, SubscriberRegistry, Subscription};

/// One raw message received from the shared transport.
#[derive(Debug, Clone)]
pub struct RelayMessage {
    pub channel: String,
    pub payload: String,
}

/// Stream of inbound messages. Ends when the subscriber connection is lost.
pub type InboundStream = BoxStream<'static, RelayMessage>;

/// What travels over the shared transport: the event plus the id of the
/// broker instance that published it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub origin: Uuid,
    pub event: Event,
}

impl RelayEnvelope {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Transport half of a cross-process broker.
///
/// Implementations keep publishing and subscribing on separate connections;
/// `listen` opens the subscriber side and is called at most once per broker
/// (again only after the previous stream ended).
#[async_trait]
pub trait Relay: Send + Sync + 'static {
    fn backend(&self) -> BrokerBackend;

    /// Open the inbound side.
    async fn listen(&self) -> Result<InboundStream>;

    /// Start receiving messages for an organization. Called on the first
    /// local subscriber of that organization.
    async fn join(&self, organization_id: &str) -> Result<()>;

    /// Stop receiving messages for an organization. Called after its last
    /// local subscriber left.
    async fn leave(&self, organization_id: &str) -> Result<()>;

    /// Send an envelope to every process.
    async fn publish(&self, envelope: &RelayEnvelope) -> Result<()>;

    /// Whether a message received on `channel` may carry an event for
    /// `organization_id`. Transports with one channel per organization reject
    /// envelopes that claim a different organization than their channel.
    fn accepts(&self, _channel: &str, _organization_id: &str) -> bool {
        true
    }
}

#[derive(Default)]
struct ListenerState {
    listening: bool,
    joined: HashSet<String>,
}

struct RelayInner<R> {
    relay: R,
    origin: Uuid,
    registry: SubscriberRegistry,
    listener: tokio::sync::Mutex<ListenerState>,
    receive_task: parking_lot::Mutex<Option<AbortHandle>>,
}

/// Broker that fans out locally and relays through a shared transport.
pub struct RelayBroker<R: Relay> {
    inner: Arc<RelayInner<R>>,
}

impl<R: Relay> RelayBroker<R> {
    /// Wrap a relay. Performs no I/O; the inbound side opens on first use.
    pub fn new(relay: R) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                relay,
                origin: Uuid::new_v4(),
                registry: SubscriberRegistry::new(),
                listener: tokio::sync::Mutex::new(ListenerState::default()),
                receive_task: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Id stamped on every envelope this broker publishes.
    pub fn origin(&self) -> Uuid {
        self.inner.origin
    }

    pub fn relay(&self) -> &R {
        &self.inner.relay
    }

    /// Open the inbound side now instead of on first subscribe.
    pub async fn init(&self) -> Result<()> {
        let mut state = self.inner.listener.lock().await;
        RelayInner::ensure_listening(&self.inner, &mut state).await
    }
}

impl<R: Relay> Drop for RelayBroker<R> {
    fn drop(&mut self) {
        if let Some(task) = self.inner.receive_task.lock().take() {
            task.abort();
        }
    }
}

impl<R: Relay> RelayInner<R> {
    async fn ensure_listening(this: &Arc<Self>, state: &mut ListenerState) -> Result<()> {
        if state.listening {
            return Ok(());
        }
        let inbound = this.relay.listen().await?;
        state.listening = true;

        let task = tokio::spawn(Self::receive_loop(Arc::clone(this), inbound));
        *this.receive_task.lock() = Some(task.abort_handle());

        info!(
            subsystem = "broker",
            component = this.relay.backend().as_str(),
            op = "listen",
            origin = %this.origin,
            "Relay receive path initialized"
        );
        Ok(())
    }

    async fn receive_loop(this: Arc<Self>, mut inbound: InboundStream) {
        loop {
            while let Some(message) = inbound.next().await {
                this.handle_inbound(message);
            }
            warn!(
                subsystem = "broker",
                component = this.relay.backend().as_str(),
                "Relay inbound stream ended, reconnecting"
            );
            inbound = this.reconnect().await;
        }
    }

    fn handle_inbound(&self, message: RelayMessage) {
        let envelope = match RelayEnvelope::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    subsystem = "broker",
                    component = self.relay.backend().as_str(),
                    channel = %message.channel,
                    payload_len = message.payload.len(),
                    error = %e,
                    "Discarding malformed relay message"
                );
                return;
            }
        };

        if !self
            .relay
            .accepts(&message.channel, envelope.event.organization_id())
        {
            warn!(
                subsystem = "broker",
                component = self.relay.backend().as_str(),
                channel = %message.channel,
                org_id = envelope.event.organization_id(),
                "Discarding relay message for another organization's channel"
            );
            return;
        }

        if envelope.origin == self.origin {
            trace!(
                org_id = envelope.event.organization_id(),
                "Skipping own relay echo"
            );
            return;
        }

        self.registry.dispatch(&envelope.event);
    }

    async fn reconnect(&self) -> InboundStream {
        let mut attempt: u32 = 0;
        loop {
            tokio::time::sleep(backoff_delay(attempt)).await;

            let mut state = self.listener.lock().await;
            match self.relay.listen().await {
                Ok(inbound) => {
                    state.joined.clear();
                    for org in self.registry.organizations() {
                        match self.relay.join(&org).await {
                            Ok(()) => {
                                state.joined.insert(org);
                            }
                            Err(e) => warn!(
                                subsystem = "broker",
                                org_id = %org,
                                error = %e,
                                "Failed to rejoin organization after reconnect"
                            ),
                        }
                    }
                    info!(
                        subsystem = "broker",
                        component = self.relay.backend().as_str(),
                        attempt,
                        organizations = state.joined.len(),
                        "Relay receive path reconnected"
                    );
                    return inbound;
                }
                Err(e) => {
                    warn!(
                        subsystem = "broker",
                        component = self.relay.backend().as_str(),
                        attempt,
                        error = %e,
                        "Relay reconnect failed"
                    );
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Leave an organization if nobody re-subscribed in the meantime.
    async fn release(self: Arc<Self>, organization_id: String) {
        let mut state = self.listener.lock().await;
        if self.registry.count(&organization_id) > 0 || !state.joined.remove(&organization_id) {
            return;
        }
        match self.relay.leave(&organization_id).await {
            Ok(()) => debug!(
                subsystem = "broker",
                component = self.relay.backend().as_str(),
                org_id = %organization_id,
                "Released organization channel"
            ),
            Err(e) => warn!(
                subsystem = "broker",
                component = self.relay.backend().as_str(),
                org_id = %organization_id,
                error = %e,
                "Failed to release organization channel"
            ),
        }
    }
}

#[async_trait]
impl<R: Relay> Broker for RelayBroker<R> {
    fn backend(&self) -> BrokerBackend {
        self.inner.relay.backend()
    }

    async fn subscribe(&self, organization_id: &str, callback: Callback) -> Result<Subscription> {
        validate_organization_id(organization_id)?;

        let mut state = self.inner.listener.lock().await;
        RelayInner::ensure_listening(&self.inner, &mut state).await?;
        if !state.joined.contains(organization_id) {
            self.inner.relay.join(organization_id).await?;
            state.joined.insert(organization_id.to_string());
        }
        let registration = self.inner.registry.insert(organization_id, callback);
        drop(state);

        debug!(
            subsystem = "broker",
            component = self.inner.relay.backend().as_str(),
            op = "subscribe",
            org_id = organization_id,
            subscriber_count = self.inner.registry.count(organization_id),
            "Subscriber registered"
        );

        let inner = Arc::clone(&self.inner);
        let org = organization_id.to_string();
        let id = registration.id;
        Ok(Subscription::new(id, organization_id, move || {
            if !inner.registry.remove(&org, id).was_last() {
                return;
            }
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(inner.release(org));
                }
                Err(_) => debug!(
                    org_id = %org,
                    "No runtime to release organization channel; left joined"
                ),
            }
        }))
    }

    async fn emit(&self, event: Event) -> Result<()> {
        let delivered = self.inner.registry.dispatch(&event);
        let envelope = RelayEnvelope {
            origin: self.inner.origin,
            event,
        };
        let result = self.inner.relay.publish(&envelope).await;

        match &result {
            Ok(()) => debug!(
                subsystem = "broker",
                component = self.inner.relay.backend().as_str(),
                op = "emit",
                org_id = envelope.event.organization_id(),
                event_type = %envelope.event.kind(),
                delivered,
                "Broker emit"
            ),
            Err(e) => warn!(
                subsystem = "broker",
                component = self.inner.relay.backend().as_str(),
                op = "emit",
                org_id = envelope.event.organization_id(),
                event_type = %envelope.event.kind(),
                delivered,
                error = %e,
                "Relay publish failed; only local subscribers received the event"
            ),
        }
        result
    }

    fn subscriber_count(&self, organization_id: &str) -> usize {
        self.inner.registry.count(organization_id)
    }
}
