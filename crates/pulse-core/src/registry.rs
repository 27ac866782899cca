//! Per-organization subscriber registry and subscription handles.
//!
//! Every broker owns one [`SubscriberRegistry`]. Subscriptions are keyed by a
//! generated [`SubscriptionId`], never by callback identity, so the same
//! callback may be registered more than once.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::{Event, Result};

/// Subscriber callback. Invoked synchronously inside `emit`/dispatch.
pub type Callback = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

/// Wrap a closure as a [`Callback`].
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Per-call subscription token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Outcome of [`SubscriberRegistry::insert`].
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub id: SubscriptionId,
    /// True when this is the only subscriber of its organization.
    pub first_for_organization: bool,
}

/// Outcome of [`SubscriberRegistry::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Nothing was registered under that id (already removed).
    Missing,
    /// Removed; `remaining` subscribers are left for the organization.
    Removed { remaining: usize },
}

impl Removal {
    /// True when the removal released the organization's last subscriber.
    pub fn was_last(&self) -> bool {
        matches!(self, Removal::Removed { remaining: 0 })
    }
}

/// Mapping of organization id to its active local callbacks.
///
/// Callbacks are invoked outside the lock on a snapshot, so a callback may
/// subscribe or unsubscribe while being dispatched to.
#[derive(Default)]
pub struct SubscriberRegistry {
    organizations: Mutex<HashMap<String, BTreeMap<SubscriptionId, Callback>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for an organization.
    pub fn insert(&self, organization_id: &str, callback: Callback) -> Registration {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut organizations = self.organizations.lock();
        let subscribers = organizations
            .entry(organization_id.to_string())
            .or_default();
        subscribers.insert(id, callback);
        Registration {
            id,
            first_for_organization: subscribers.len() == 1,
        }
    }

    /// Remove a registration. Empty organizations are dropped from the map.
    pub fn remove(&self, organization_id: &str, id: SubscriptionId) -> Removal {
        let mut organizations = self.organizations.lock();
        let Some(subscribers) = organizations.get_mut(organization_id) else {
            return Removal::Missing;
        };
        if subscribers.remove(&id).is_none() {
            return Removal::Missing;
        }
        let remaining = subscribers.len();
        if remaining == 0 {
            organizations.remove(organization_id);
        }
        Removal::Removed { remaining }
    }

    /// Deliver an event to every subscriber of its organization.
    ///
    /// Returns how many callbacks completed successfully. A callback that
    /// fails or panics is logged and skipped.
    pub fn dispatch(&self, event: &Event) -> usize {
        let snapshot: Vec<(SubscriptionId, Callback)> = {
            let organizations = self.organizations.lock();
            match organizations.get(event.organization_id()) {
                Some(subscribers) => subscribers
                    .iter()
                    .map(|(id, cb)| (*id, Arc::clone(cb)))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for (id, cb) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| cb(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(
                    subscription = %id,
                    org_id = %event.organization_id(),
                    event_type = %event.kind(),
                    error = %e,
                    "Subscriber callback failed"
                ),
                Err(_) => error!(
                    subscription = %id,
                    org_id = %event.organization_id(),
                    event_type = %event.kind(),
                    "Subscriber callback panicked"
                ),
            }
        }

        trace!(
            org_id = %event.organization_id(),
            event_type = %event.kind(),
            delivered,
            "Dispatched event"
        );
        delivered
    }

    /// Number of subscribers for an organization.
    pub fn count(&self, organization_id: &str) -> usize {
        self.organizations
            .lock()
            .get(organization_id)
            .map_or(0, BTreeMap::len)
    }

    /// Organizations that currently have at least one subscriber.
    pub fn organizations(&self) -> Vec<String> {
        self.organizations.lock().keys().cloned().collect()
    }
}

/// Handle returned by `Broker::subscribe`.
///
/// `unsubscribe` is idempotent; dropping the handle unsubscribes as well, so
/// the registration is released on every exit path of the owner.
pub struct Subscription {
    id: SubscriptionId,
    organization_id: String,
    release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    /// Create a handle whose release closure runs at most once.
    pub fn new(
        id: SubscriptionId,
        organization_id: impl Into<String>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            id,
            organization_id: organization_id.into(),
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    /// Whether `unsubscribe` has not run yet.
    pub fn is_active(&self) -> bool {
        self.release.lock().is_some()
    }

    /// Stop receiving events. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        let release = self.release.lock().take();
        if let Some(release) = release {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("organization_id", &self.organization_id)
            .field("active", &self.is_active())
            .finish()
    }
}
