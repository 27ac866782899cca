//! Broker whose events are derived from row changes of the record table.
//!
//! Instead of explicit `emit` calls, a [`ChangeFeed`] streams low-level row
//! changes (insert/update/delete with new and old snapshots) and a
//! [`ChangeTranslator`] maps them onto the same [`Event`] variants the other
//! backends carry, so the streaming endpoint and the client consumer do not
//! care which backend is active.
//!
//! Only the observed table's own mutations are visible: `record-assignment`
//! cannot be inferred from single-table deltas and is never produced here.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::backoff::backoff_delay;
use crate::broker::validate_organization_id;
use crate::defaults::{CHANGEFEED_ID_COLUMN, CHANGEFEED_ORG_COLUMN, CHANGEFEED_TABLE};
use crate::{
    Broker, BrokerBackend, Callback, Event, EventType, Result, SubscriberRegistry, Subscription,
};

/// Row operation reported by the data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One raw change record with row snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub table: String,
    #[serde(rename = "op")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

/// Stream of row changes. Ends when the feed connection is lost.
pub type ChangeStream = BoxStream<'static, RowChange>;

/// Provider-specific "subscribe to table changes" capability.
#[async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
    async fn open(&self) -> Result<ChangeStream>;
}

// =============================================================================
// TRANSLATION
// =============================================================================

/// Maps row changes of one table to events.
#[derive(Debug, Clone)]
pub struct ChangeTranslator {
    table: String,
    organization_column: String,
    id_column: String,
}

impl Default for ChangeTranslator {
    fn default() -> Self {
        Self::new(CHANGEFEED_TABLE, CHANGEFEED_ORG_COLUMN, CHANGEFEED_ID_COLUMN)
    }
}

impl ChangeTranslator {
    pub fn new(
        table: impl Into<String>,
        organization_column: impl Into<String>,
        id_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            organization_column: organization_column.into(),
            id_column: id_column.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Derive an event, or `None` when the change belongs to another table
    /// or no organization can be resolved from either snapshot.
    pub fn translate(&self, change: &RowChange) -> Option<Event> {
        if change.table != self.table {
            return None;
        }

        let kind = match change.kind {
            ChangeKind::Insert => EventType::RecordCreated,
            ChangeKind::Update => EventType::RecordUpdated,
            ChangeKind::Delete => EventType::RecordDeleted,
        };

        let organization_id = column_string(change.new.as_ref(), &self.organization_column)
            .or_else(|| column_string(change.old.as_ref(), &self.organization_column))?;

        let snapshot = match change.kind {
            ChangeKind::Delete => change.old.as_ref().or(change.new.as_ref()),
            ChangeKind::Insert | ChangeKind::Update => {
                change.new.as_ref().or(change.old.as_ref())
            }
        };
        let mut payload = snapshot.cloned().unwrap_or(Value::Null);
        if let Value::Object(row) = &mut payload {
            if !row.contains_key("id") {
                if let Some(id) = row.get(&self.id_column).cloned() {
                    row.insert("id".to_string(), id);
                }
            }
        }

        Event::new(kind, organization_id, payload).ok()
    }
}

fn column_string(row: Option<&Value>, column: &str) -> Option<String> {
    match row?.get(column)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// =============================================================================
// BROKER
// =============================================================================

struct ChangefeedInner<F> {
    feed: F,
    translator: ChangeTranslator,
    registry: SubscriberRegistry,
    started: tokio::sync::Mutex<bool>,
    pump_task: parking_lot::Mutex<Option<AbortHandle>>,
}

/// Broker fed by a table changefeed. `emit` is a no-op.
pub struct ChangefeedBroker<F: ChangeFeed> {
    inner: Arc<ChangefeedInner<F>>,
}

impl<F: ChangeFeed> ChangefeedBroker<F> {
    /// Wrap a feed. Performs no I/O; the feed opens on first subscribe.
    pub fn new(feed: F, translator: ChangeTranslator) -> Self {
        Self {
            inner: Arc::new(ChangefeedInner {
                feed,
                translator,
                registry: SubscriberRegistry::new(),
                started: tokio::sync::Mutex::new(false),
                pump_task: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn translator(&self) -> &ChangeTranslator {
        &self.inner.translator
    }

    /// Open the feed now instead of on first subscribe.
    pub async fn init(&self) -> Result<()> {
        ChangefeedInner::ensure_started(&self.inner).await
    }
}

impl<F: ChangeFeed> Drop for ChangefeedBroker<F> {
    fn drop(&mut self) {
        if let Some(task) = self.inner.pump_task.lock().take() {
            task.abort();
        }
    }
}

impl<F: ChangeFeed> ChangefeedInner<F> {
    async fn ensure_started(this: &Arc<Self>) -> Result<()> {
        let mut started = this.started.lock().await;
        if *started {
            return Ok(());
        }
        let changes = this.feed.open().await?;
        *started = true;

        let task = tokio::spawn(Self::pump(Arc::clone(this), changes));
        *this.pump_task.lock() = Some(task.abort_handle());

        info!(
            subsystem = "broker",
            component = "changefeed",
            op = "open",
            table = %this.translator.table(),
            "Changefeed opened"
        );
        Ok(())
    }

    async fn pump(this: Arc<Self>, mut changes: ChangeStream) {
        loop {
            while let Some(change) = changes.next().await {
                this.handle_change(&change);
            }
            warn!(
                subsystem = "broker",
                component = "changefeed",
                "Changefeed stream ended, reopening"
            );
            changes = this.reopen().await;
        }
    }

    fn handle_change(&self, change: &RowChange) {
        match self.translator.translate(change) {
            Some(event) => {
                self.registry.dispatch(&event);
            }
            None => debug!(
                subsystem = "broker",
                component = "changefeed",
                table = %change.table,
                op = ?change.kind,
                "Dropping row change without organization"
            ),
        }
    }

    async fn reopen(&self) -> ChangeStream {
        let mut attempt: u32 = 0;
        loop {
            tokio::time::sleep(backoff_delay(attempt)).await;
            match self.feed.open().await {
                Ok(changes) => {
                    info!(
                        subsystem = "broker",
                        component = "changefeed",
                        attempt,
                        "Changefeed reopened"
                    );
                    return changes;
                }
                Err(e) => {
                    warn!(
                        subsystem = "broker",
                        component = "changefeed",
                        attempt,
                        error = %e,
                        "Changefeed reopen failed"
                    );
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

#[async_trait]
impl<F: ChangeFeed> Broker for ChangefeedBroker<F> {
    fn backend(&self) -> BrokerBackend {
        BrokerBackend::Changefeed
    }

    async fn subscribe(&self, organization_id: &str, callback: Callback) -> Result<Subscription> {
        validate_organization_id(organization_id)?;
        ChangefeedInner::ensure_started(&self.inner).await?;

        let registration = self.inner.registry.insert(organization_id, callback);
        debug!(
            subsystem = "broker",
            component = "changefeed",
            op = "subscribe",
            org_id = organization_id,
            subscriber_count = self.inner.registry.count(organization_id),
            "Subscriber registered"
        );

        let inner = Arc::clone(&self.inner);
        let org = organization_id.to_string();
        let id = registration.id;
        Ok(Subscription::new(id, organization_id, move || {
            inner.registry.remove(&org, id);
        }))
    }

    async fn emit(&self, event: Event) -> Result<()> {
        debug!(
            subsystem = "broker",
            component = "changefeed",
            op = "emit",
            org_id = event.organization_id(),
            event_type = %event.kind(),
            "Ignoring explicit emit; events derive from the changefeed"
        );
        Ok(())
    }

    fn subscriber_count(&self, organization_id: &str) -> usize {
        self.inner.registry.count(organization_id)
    }
}
