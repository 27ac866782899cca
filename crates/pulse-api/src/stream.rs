//! One organization's event stream for one client connection.
//!
//! The broker callback serializes each event once and pushes the frame into
//! a bounded queue. The HTTP body drains that queue. A client too slow to
//! keep up is disconnected (it reconnects and refetches) rather than
//! buffered without bound.
//!
//! The broker subscription lives inside [`EventStream`], so every way the
//! connection ends, including the body being dropped mid-flight, releases it.
//!
//! A quiet organization is not an idle client. The stream yields a
//! keep-alive whenever no event arrives within the keep-alive interval; a
//! peer that went away fails that write and the body is dropped. The idle
//! timeout only fires when the body itself stopped being drained.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use pulse_core::{callback, Broker, PulseConfig, Result, Subscription};

const MIN_KEEPALIVE: Duration = Duration::from_millis(10);

/// Lifecycle of one streaming connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Subscribed,
    Streaming,
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away (body dropped).
    ClientGone,
    /// The client drained nothing, not even a keep-alive, within the idle
    /// timeout.
    IdleTimeout,
    /// The queue filled up.
    Overflow,
    /// The subscription ended on the broker side.
    SubscriptionEnded,
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CloseReason::ClientGone => "client_gone",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Overflow => "overflow",
            CloseReason::SubscriptionEnded => "subscription_ended",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// Per-connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Frames queued before the connection is closed.
    pub capacity: usize,
    /// Close once the client has drained nothing for this long. `None`
    /// disables.
    pub idle_timeout: Option<Duration>,
    /// Quiet time before a keep-alive comment is yielded.
    pub keepalive: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from_config(&PulseConfig::default())
    }
}

impl StreamSettings {
    pub fn from_config(config: &PulseConfig) -> Self {
        Self {
            capacity: config.stream_buffer.max(1),
            idle_timeout: config.stream_idle_timeout,
            keepalive: config.stream_keepalive,
        }
    }
}

/// What the response body writes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// A serialized event.
    Frame(String),
    /// Nothing happened within the keep-alive interval.
    KeepAlive,
}

/// Frames for one connection, backed by a broker subscription.
pub struct EventStream {
    organization_id: String,
    frames: mpsc::Receiver<String>,
    overflowed: Arc<AtomicBool>,
    idle_timeout: Option<Duration>,
    keepalive: Duration,
    /// When the body last took an item.
    last_yield: Instant,
    shutdown: Option<watch::Receiver<bool>>,
    subscription: Subscription,
    state: ConnectionState,
}

enum Next {
    Frame(Option<String>),
    KeepAlive,
    Shutdown,
}

impl EventStream {
    /// Subscribe to `organization_id` on the broker.
    pub async fn open(
        broker: &dyn Broker,
        organization_id: &str,
        settings: StreamSettings,
    ) -> Result<Self> {
        trace_transition(organization_id, None, ConnectionState::Connecting);

        let (tx, frames) = mpsc::channel::<String>(settings.capacity.max(1));
        let overflowed = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&overflowed);
        let on_event = callback(move |event| {
            if flag.load(Ordering::Relaxed) {
                return Ok(());
            }
            let frame = event.to_frame()?;
            match tx.try_send(frame) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => {
                    flag.store(true, Ordering::Relaxed);
                    warn!(
                        subsystem = "stream",
                        org_id = event.organization_id(),
                        "Client queue full, closing connection"
                    );
                }
            }
            Ok(())
        });

        let subscription = broker.subscribe(organization_id, on_event).await?;
        trace_transition(
            organization_id,
            Some(ConnectionState::Connecting),
            ConnectionState::Subscribed,
        );

        Ok(Self {
            organization_id: organization_id.to_string(),
            frames,
            overflowed,
            idle_timeout: settings.idle_timeout,
            keepalive: settings.keepalive.max(MIN_KEEPALIVE),
            last_yield: Instant::now(),
            shutdown: None,
            subscription,
            state: ConnectionState::Subscribed,
        })
    }

    /// Close with [`CloseReason::Shutdown`] once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    /// Next item for the body, or `None` once the connection is closed.
    ///
    /// Returns [`StreamItem::KeepAlive`] after `keepalive` without an event.
    /// If the previous item was taken more than the idle timeout ago, the
    /// body has stalled and the connection closes instead.
    pub async fn next_item(&mut self) -> Option<StreamItem> {
        if self.state == ConnectionState::Closed {
            return None;
        }

        if self.overflowed.load(Ordering::Relaxed) {
            self.close(CloseReason::Overflow);
            return None;
        }

        if let Some(timeout) = self.idle_timeout {
            if self.last_yield.elapsed() >= timeout {
                self.close(CloseReason::IdleTimeout);
                return None;
            }
        }

        let frames = &mut self.frames;
        let keepalive = self.keepalive;
        let receive = async move {
            match tokio::time::timeout(keepalive, frames.recv()).await {
                Ok(received) => Next::Frame(received),
                Err(_) => Next::KeepAlive,
            }
        };
        let next = match self.shutdown.as_mut() {
            Some(shutdown) => tokio::select! {
                next = receive => next,
                _ = shutdown_requested(shutdown) => Next::Shutdown,
            },
            None => receive.await,
        };

        match next {
            Next::Frame(Some(_)) if self.overflowed.load(Ordering::Relaxed) => {
                self.close(CloseReason::Overflow);
                None
            }
            Next::Frame(Some(frame)) => {
                self.transition(ConnectionState::Streaming);
                self.last_yield = Instant::now();
                Some(StreamItem::Frame(frame))
            }
            Next::Frame(None) => {
                self.close(CloseReason::SubscriptionEnded);
                None
            }
            Next::KeepAlive => {
                self.last_yield = Instant::now();
                Some(StreamItem::KeepAlive)
            }
            Next::Shutdown => {
                self.close(CloseReason::Shutdown);
                None
            }
        }
    }

    /// Release the subscription and enter `Closed`. Idempotent.
    pub fn close(&mut self, reason: CloseReason) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.subscription.unsubscribe();
        self.frames.close();
        debug!(
            subsystem = "stream",
            org_id = %self.organization_id,
            reason = %reason,
            "Event stream closed"
        );
        self.transition(ConnectionState::Closed);
    }

    /// Adapt into a stream of items for the response body.
    pub fn into_stream(self) -> impl Stream<Item = StreamItem> + Send + 'static {
        futures::stream::unfold(self, |mut events| async move {
            let item = events.next_item().await?;
            Some((item, events))
        })
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            trace_transition(&self.organization_id, Some(self.state), next);
            self.state = next;
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.close(CloseReason::ClientGone);
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender gone without signalling: never shut down.
            std::future::pending::<()>().await;
        }
    }
}

fn trace_transition(organization_id: &str, from: Option<ConnectionState>, to: ConnectionState) {
    debug!(
        subsystem = "stream",
        org_id = organization_id,
        from = ?from,
        to = ?to,
        "Connection state transition"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pulse_core::{Event, EventType, InProcessBroker};
    use serde_json::json;

    fn event(org: &str, id: u32) -> Event {
        Event::new(EventType::RecordUpdated, org, json!({ "id": id })).unwrap()
    }

    fn settings(capacity: usize, idle: Option<Duration>) -> StreamSettings {
        StreamSettings {
            capacity,
            idle_timeout: idle,
            keepalive: Duration::from_secs(15),
        }
    }

    #[tokio::test]
    async fn test_frames_follow_state_machine() {
        let broker = InProcessBroker::new();
        let mut stream = EventStream::open(&broker, "org-1", settings(8, None))
            .await
            .unwrap();
        assert_eq!(stream.state(), ConnectionState::Subscribed);
        assert_eq!(broker.subscriber_count("org-1"), 1);

        broker.emit(event("org-1", 1)).await.unwrap();
        broker.emit(event("org-2", 2)).await.unwrap();

        let Some(StreamItem::Frame(frame)) = stream.next_item().await else {
            panic!("expected a frame");
        };
        assert_eq!(Event::from_frame(&frame).unwrap(), event("org-1", 1));
        assert_eq!(stream.state(), ConnectionState::Streaming);

        stream.close(CloseReason::ClientGone);
        stream.close(CloseReason::ClientGone);
        assert_eq!(stream.state(), ConnectionState::Closed);
        assert_eq!(broker.subscriber_count("org-1"), 0);
        assert!(stream.next_item().await.is_none());
    }

    #[tokio::test]
    async fn test_overflow_closes_connection() {
        let broker = InProcessBroker::new();
        let mut stream = EventStream::open(&broker, "org-1", settings(2, None))
            .await
            .unwrap();

        for i in 0..5 {
            broker.emit(event("org-1", i)).await.unwrap();
        }

        assert!(stream.next_item().await.is_none());
        assert_eq!(stream.state(), ConnectionState::Closed);
        assert_eq!(broker.subscriber_count("org-1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_connection_survives_idle_timeout() {
        let broker = InProcessBroker::new();
        let mut stream = EventStream::open(
            &broker,
            "org-1",
            StreamSettings {
                capacity: 8,
                idle_timeout: Some(Duration::from_millis(300)),
                keepalive: Duration::from_millis(50),
            },
        )
        .await
        .unwrap();

        let started = Instant::now();
        while started.elapsed() < Duration::from_millis(500) {
            assert_eq!(stream.next_item().await, Some(StreamItem::KeepAlive));
        }
        assert_eq!(stream.state(), ConnectionState::Subscribed);
        assert_eq!(broker.subscriber_count("org-1"), 1);

        broker.emit(event("org-1", 1)).await.unwrap();
        let Some(StreamItem::Frame(frame)) = stream.next_item().await else {
            panic!("expected a frame");
        };
        assert_eq!(Event::from_frame(&frame).unwrap(), event("org-1", 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_reader_closes_after_idle_timeout() {
        let broker = InProcessBroker::new();
        let mut stream = EventStream::open(
            &broker,
            "org-1",
            StreamSettings {
                capacity: 8,
                idle_timeout: Some(Duration::from_millis(300)),
                keepalive: Duration::from_millis(50),
            },
        )
        .await
        .unwrap();

        broker.emit(event("org-1", 1)).await.unwrap();
        assert!(matches!(
            stream.next_item().await,
            Some(StreamItem::Frame(_))
        ));

        // Nobody polls the body for longer than the idle timeout.
        tokio::time::advance(Duration::from_millis(301)).await;

        assert!(stream.next_item().await.is_none());
        assert_eq!(stream.state(), ConnectionState::Closed);
        assert_eq!(broker.subscriber_count("org-1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_without_idle_timeout() {
        let broker = InProcessBroker::new();
        let mut stream = EventStream::open(&broker, "org-1", settings(8, None))
            .await
            .unwrap();

        assert_eq!(stream.next_item().await, Some(StreamItem::KeepAlive));
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(stream.next_item().await, Some(StreamItem::KeepAlive));
        assert_eq!(broker.subscriber_count("org-1"), 1);
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_subscription() {
        let broker = InProcessBroker::new();
        let stream = EventStream::open(&broker, "org-1", settings(8, None))
            .await
            .unwrap()
            .into_stream();
        assert_eq!(broker.subscriber_count("org-1"), 1);

        drop(stream);
        assert_eq!(broker.subscriber_count("org-1"), 0);
    }

    #[tokio::test]
    async fn test_into_stream_yields_frames_in_order() {
        let broker = InProcessBroker::new();
        let stream = EventStream::open(&broker, "org-1", settings(8, None))
            .await
            .unwrap();

        for i in 0..3 {
            broker.emit(event("org-1", i)).await.unwrap();
        }
        let items: Vec<StreamItem> = stream.into_stream().take(3).collect().await;
        let ids: Vec<String> = items
            .iter()
            .filter_map(|item| match item {
                StreamItem::Frame(f) => Event::from_frame(f).ok()?.record_id(),
                StreamItem::KeepAlive => None,
            })
            .collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connection() {
        let broker = InProcessBroker::new();
        let (tx, rx) = watch::channel(false);
        let mut stream = EventStream::open(&broker, "org-1", settings(8, None))
            .await
            .unwrap()
            .with_shutdown(rx);

        broker.emit(event("org-1", 1)).await.unwrap();
        assert!(matches!(
            stream.next_item().await,
            Some(StreamItem::Frame(_))
        ));

        tx.send(true).unwrap();
        assert!(stream.next_item().await.is_none());
        assert_eq!(stream.state(), ConnectionState::Closed);
        assert_eq!(broker.subscriber_count("org-1"), 0);
    }

    #[test]
    fn test_settings_from_config() {
        let config = PulseConfig::default()
            .with_stream_buffer(0)
            .with_idle_timeout(None);
        let settings = StreamSettings::from_config(&config);
        assert_eq!(settings.capacity, 1);
        assert_eq!(settings.idle_timeout, None);
        assert_eq!(settings.keepalive, Duration::from_secs(15));
    }
}
