//! Cache invalidation side effects of received events.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use pulse_core::Event;

/// A cached query a client may hold for an organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    /// Any list of records in the organization.
    Collection { organization_id: String },
    /// A single record.
    Record { record_id: String },
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKey::Collection { organization_id } => write!(f, "collection:{}", organization_id),
            QueryKey::Record { record_id } => write!(f, "record:{}", record_id),
        }
    }
}

/// Marks cached queries stale.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, key: &QueryKey);
}

impl<F> CacheInvalidator for F
where
    F: Fn(&QueryKey) + Send + Sync,
{
    fn invalidate(&self, key: &QueryKey) {
        self(key)
    }
}

/// Keys an event makes stale: the organization's collection, and the record
/// itself when the payload names one.
pub fn keys_for(event: &Event) -> Vec<QueryKey> {
    let mut keys = vec![QueryKey::Collection {
        organization_id: event.organization_id().to_string(),
    }];
    if let Some(record_id) = event.record_id() {
        keys.push(QueryKey::Record { record_id });
    }
    keys
}

/// Apply every key of `event` to `invalidator`.
pub fn apply_event(invalidator: &dyn CacheInvalidator, event: &Event) {
    for key in keys_for(event) {
        invalidator.invalidate(&key);
    }
}

/// Invalidator that remembers the keys it was given.
#[derive(Clone, Default)]
pub struct RecordingInvalidator {
    keys: Arc<Mutex<Vec<QueryKey>>>,
}

impl RecordingInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.keys.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

impl CacheInvalidator for RecordingInvalidator {
    fn invalidate(&self, key: &QueryKey) {
        self.keys.lock().push(key.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::EventType;
    use serde_json::json;

    #[test]
    fn test_keys_for_record_event() {
        let event = Event::new(EventType::RecordUpdated, "org-1", json!({"id": "rec-42"})).unwrap();
        assert_eq!(
            keys_for(&event),
            vec![
                QueryKey::Collection {
                    organization_id: "org-1".to_string()
                },
                QueryKey::Record {
                    record_id: "rec-42".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_keys_for_event_without_id() {
        let event = Event::new(EventType::RecordAssignment, "org-1", json!({"helpers": 3})).unwrap();
        assert_eq!(keys_for(&event).len(), 1);
    }

    #[test]
    fn test_numeric_record_id() {
        let event = Event::new(EventType::RecordDeleted, "org-1", json!({"id": 17})).unwrap();
        assert!(keys_for(&event).contains(&QueryKey::Record {
            record_id: "17".to_string()
        }));
    }

    #[test]
    fn test_closure_invalidator() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let invalidator = move |key: &QueryKey| sink.lock().push(key.to_string());

        let event = Event::new(EventType::RecordCreated, "org-1", json!({"id": "r1"})).unwrap();
        apply_event(&invalidator, &event);

        assert_eq!(*seen.lock(), vec!["collection:org-1", "record:r1"]);
    }
}
