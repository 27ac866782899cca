//! Reconnecting event stream consumer.
//!
//! A consumer owns at most one live connection. Its background task parses
//! each frame, invalidates the matching cache keys and, when the connection
//! fails or ends, reconnects with capped exponential backoff until the
//! attempt ceiling is reached.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use pulse_core::defaults::{RECONNECT_BASE_MS, RECONNECT_MAX_ATTEMPTS, RECONNECT_MAX_MS};
use pulse_core::{backoff_delay_with, Error, Event, Result};

use crate::invalidation::{apply_event, CacheInvalidator};
use crate::source::EventSource;

/// Connection lifecycle as seen by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Connecting,
    Open,
    /// Waiting `delay` before reconnect attempt `attempt` (zero based).
    Reconnecting { attempt: u32, delay: Duration },
    /// Gave up after the retry ceiling or a refused connect.
    Disconnected,
    /// Unmounted by the application.
    Closed,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerState::Idle => f.write_str("idle"),
            ConsumerState::Connecting => f.write_str("connecting"),
            ConsumerState::Open => f.write_str("open"),
            ConsumerState::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {}, in {:?})", attempt, delay)
            }
            ConsumerState::Disconnected => f.write_str("disconnected"),
            ConsumerState::Closed => f.write_str("closed"),
        }
    }
}

/// Backoff bounds and retry ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(RECONNECT_BASE_MS),
            max: Duration::from_millis(RECONNECT_MAX_MS),
            max_attempts: RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        backoff_delay_with(
            attempt,
            self.base.as_millis() as u64,
            self.max.as_millis() as u64,
        )
    }
}

/// Keeps one organization's event stream open and applies its invalidations.
pub struct EventConsumer<S: EventSource> {
    source: Arc<S>,
    invalidator: Arc<dyn CacheInvalidator>,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<ConsumerState>>,
    task: Option<JoinHandle<()>>,
    organization_id: Option<String>,
}

impl<S: EventSource> EventConsumer<S> {
    pub fn new(source: S, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            source: Arc::new(source),
            invalidator,
            policy: ReconnectPolicy::default(),
            state: Arc::new(state),
            task: None,
            organization_id: None,
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> ConsumerState {
        self.state.borrow().clone()
    }

    /// Receiver observing every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Organization of the current (or last) mount.
    pub fn organization_id(&self) -> Option<&str> {
        self.organization_id.as_deref()
    }

    /// Start streaming `organization_id`.
    ///
    /// A previous mount is torn down and awaited first, so two connections
    /// never overlap.
    pub async fn mount(&mut self, organization_id: &str) -> Result<()> {
        if organization_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "organization id must not be empty".to_string(),
            ));
        }
        self.unmount().await;

        let org = organization_id.to_string();
        info!(subsystem = "client", op = "mount", org_id = %org, "Mounting event consumer");
        self.state.send_replace(ConsumerState::Connecting);
        self.organization_id = Some(org.clone());
        self.task = Some(tokio::spawn(run(
            self.source.clone(),
            self.invalidator.clone(),
            self.policy,
            org,
            self.state.clone(),
        )));
        Ok(())
    }

    /// Close the connection and cancel any pending reconnect.
    pub async fn unmount(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.abort();
        let _ = task.await;
        self.state.send_replace(ConsumerState::Closed);
        debug!(
            subsystem = "client",
            op = "unmount",
            org_id = self.organization_id.as_deref().unwrap_or(""),
            "Event consumer closed"
        );
    }
}

impl<S: EventSource> Drop for EventConsumer<S> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run<S: EventSource>(
    source: Arc<S>,
    invalidator: Arc<dyn CacheInvalidator>,
    policy: ReconnectPolicy,
    organization_id: String,
    state: Arc<watch::Sender<ConsumerState>>,
) {
    let mut attempt: u32 = 0;
    loop {
        state.send_replace(ConsumerState::Connecting);
        match source.connect(&organization_id).await {
            Ok(mut frames) => {
                attempt = 0;
                state.send_replace(ConsumerState::Open);
                info!(subsystem = "client", op = "open", org_id = %organization_id, "Event stream open");

                while let Some(frame) = frames.next().await {
                    match frame {
                        Ok(frame) => handle_frame(&organization_id, &frame, invalidator.as_ref()),
                        Err(e) => {
                            warn!(
                                subsystem = "client",
                                org_id = %organization_id,
                                error = %e,
                                "Event stream failed"
                            );
                            break;
                        }
                    }
                }
                debug!(subsystem = "client", org_id = %organization_id, "Event stream ended");
            }
            Err(e) if !e.is_transport() => {
                warn!(
                    subsystem = "client",
                    org_id = %organization_id,
                    error = %e,
                    "Event stream refused, not retrying"
                );
                state.send_replace(ConsumerState::Disconnected);
                return;
            }
            Err(e) => {
                warn!(
                    subsystem = "client",
                    org_id = %organization_id,
                    attempt,
                    error = %e,
                    "Event stream connect failed"
                );
            }
        }

        if attempt >= policy.max_attempts {
            warn!(
                subsystem = "client",
                org_id = %organization_id,
                attempts = attempt,
                "Giving up on event stream"
            );
            state.send_replace(ConsumerState::Disconnected);
            return;
        }
        let delay = policy.delay(attempt);
        state.send_replace(ConsumerState::Reconnecting { attempt, delay });
        debug!(
            subsystem = "client",
            org_id = %organization_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting"
        );
        attempt += 1;
        tokio::time::sleep(delay).await;
    }
}

fn handle_frame(organization_id: &str, frame: &str, invalidator: &dyn CacheInvalidator) {
    let event = match Event::from_frame(frame) {
        Ok(event) => event,
        Err(e) => {
            warn!(
                subsystem = "client",
                org_id = %organization_id,
                error = %e,
                payload_len = frame.len(),
                "Dropping unparseable frame"
            );
            return;
        }
    };
    if event.organization_id() != organization_id {
        debug!(
            subsystem = "client",
            org_id = %organization_id,
            event_org = event.organization_id(),
            "Ignoring frame for another organization"
        );
        return;
    }
    trace!(
        subsystem = "client",
        org_id = %organization_id,
        event_type = %event.kind(),
        "Applying event"
    );
    apply_event(invalidator, &event);
}
