//! Test fixtures for broker tests.
//!
//! Always compiled so integration tests in `tests/` and the other workspace
//! crates can share them. Nothing here touches the network.
//!
//! - [`LoopbackHub`]: in-memory stand-in for a shared transport. Every
//!   [`LoopbackRelay`] handed out by one hub behaves like a separate process
//!   connected to the same pub/sub server, with one channel per organization.
//! - [`RecordingCallback`]: subscriber that stores every event it receives.
//! - [`ScriptedChangeFeed`]: row-change source driven by the test.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::changefeed::{ChangeFeed, ChangeStream, RowChange};
use crate::relay::{InboundStream, Relay, RelayEnvelope, RelayMessage};
use crate::{callback, BrokerBackend, Callback, Error, Event, Result};

// =============================================================================
// LOOPBACK RELAY
// =============================================================================

struct Listener {
    tx: mpsc::UnboundedSender<RelayMessage>,
    channels: HashSet<String>,
}

#[derive(Default)]
struct HubState {
    listeners: HashMap<u64, Listener>,
}

#[derive(Default)]
struct HubInner {
    state: Mutex<HubState>,
    next_relay: AtomicU64,
    published: AtomicUsize,
    listen_calls: AtomicUsize,
    join_calls: AtomicUsize,
    leave_calls: AtomicUsize,
    fail_publish: AtomicBool,
    fail_join: AtomicBool,
}

/// Shared in-memory channel connecting several [`LoopbackRelay`]s.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A relay for one simulated process.
    pub fn relay(&self) -> LoopbackRelay {
        LoopbackRelay {
            hub: self.clone(),
            id: self.inner.next_relay.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn channel(organization_id: &str) -> String {
        format!("loopback:{}", organization_id)
    }

    /// Deliver a raw payload to every listener of an organization's channel.
    pub fn inject_raw(&self, organization_id: &str, payload: &str) {
        self.send(&Self::channel(organization_id), payload);
    }

    fn send(&self, channel: &str, payload: &str) {
        let state = self.inner.state.lock();
        for listener in state.listeners.values() {
            if listener.channels.contains(channel) {
                let _ = listener.tx.send(RelayMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                });
            }
        }
    }

    /// Drop every subscriber connection, ending their inbound streams.
    pub fn disconnect_all(&self) {
        self.inner.state.lock().listeners.clear();
    }

    /// Number of relays currently joined to an organization's channel.
    pub fn channel_listeners(&self, organization_id: &str) -> usize {
        let channel = Self::channel(organization_id);
        self.inner
            .state
            .lock()
            .listeners
            .values()
            .filter(|l| l.channels.contains(&channel))
            .count()
    }

    pub fn fail_publish(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn fail_join(&self, fail: bool) {
        self.inner.fail_join.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> usize {
        self.inner.published.load(Ordering::SeqCst)
    }

    pub fn listen_calls(&self) -> usize {
        self.inner.listen_calls.load(Ordering::SeqCst)
    }

    pub fn join_calls(&self) -> usize {
        self.inner.join_calls.load(Ordering::SeqCst)
    }

    pub fn leave_calls(&self) -> usize {
        self.inner.leave_calls.load(Ordering::SeqCst)
    }
}

/// One simulated process's connection pair to a [`LoopbackHub`].
pub struct LoopbackRelay {
    hub: LoopbackHub,
    id: u64,
}

#[async_trait]
impl Relay for LoopbackRelay {
    fn backend(&self) -> BrokerBackend {
        BrokerBackend::Redis
    }

    async fn listen(&self) -> Result<InboundStream> {
        self.hub.inner.listen_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.inner.state.lock().listeners.insert(
            self.id,
            Listener {
                tx,
                channels: HashSet::new(),
            },
        );
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        });
        Ok(stream.boxed())
    }

    async fn join(&self, organization_id: &str) -> Result<()> {
        self.hub.inner.join_calls.fetch_add(1, Ordering::SeqCst);
        if self.hub.inner.fail_join.load(Ordering::SeqCst) {
            return Err(Error::Transport("loopback join refused".to_string()));
        }
        let mut state = self.hub.inner.state.lock();
        let listener = state
            .listeners
            .get_mut(&self.id)
            .ok_or_else(|| Error::Transport("loopback listener not connected".to_string()))?;
        listener.channels.insert(LoopbackHub::channel(organization_id));
        Ok(())
    }

    async fn leave(&self, organization_id: &str) -> Result<()> {
        self.hub.inner.leave_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(listener) = self.hub.inner.state.lock().listeners.get_mut(&self.id) {
            listener
                .channels
                .remove(&LoopbackHub::channel(organization_id));
        }
        Ok(())
    }

    async fn publish(&self, envelope: &RelayEnvelope) -> Result<()> {
        if self.hub.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::Transport("loopback publish refused".to_string()));
        }
        let payload = envelope.encode()?;
        self.hub.inner.published.fetch_add(1, Ordering::SeqCst);
        self.hub.send(
            &LoopbackHub::channel(envelope.event.organization_id()),
            &payload,
        );
        Ok(())
    }

    fn accepts(&self, channel: &str, organization_id: &str) -> bool {
        channel == LoopbackHub::channel(organization_id)
    }
}

// =============================================================================
// RECORDING CALLBACK
// =============================================================================

/// Subscriber that keeps every event it receives.
#[derive(Clone, Default)]
pub struct RecordingCallback {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh [`Callback`] appending to this recorder.
    pub fn callback(&self) -> Callback {
        let events = Arc::clone(&self.events);
        callback(move |event| {
            events.lock().push(event.clone());
            Ok(())
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record ids of the received events, in arrival order.
    pub fn record_ids(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(Event::record_id)
            .collect()
    }
}

// =============================================================================
// SCRIPTED CHANGEFEED
// =============================================================================

#[derive(Default)]
struct FeedState {
    tx: Option<mpsc::UnboundedSender<RowChange>>,
    opens: usize,
}

/// Change source fed by the test through [`ScriptedChangeFeed::push`].
#[derive(Clone, Default)]
pub struct ScriptedChangeFeed {
    state: Arc<Mutex<FeedState>>,
}

impl ScriptedChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a row change on the currently open stream. Returns false when no
    /// stream is open.
    pub fn push(&self, change: RowChange) -> bool {
        match &self.state.lock().tx {
            Some(tx) => tx.send(change).is_ok(),
            None => false,
        }
    }

    /// End the open stream, as if the connection dropped.
    pub fn disconnect(&self) {
        self.state.lock().tx = None;
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }
}

#[async_trait]
impl ChangeFeed for ScriptedChangeFeed {
    async fn open(&self) -> Result<ChangeStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            state.tx = Some(tx);
            state.opens += 1;
        }
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|change| (change, rx))
        });
        Ok(stream.boxed())
    }
}
