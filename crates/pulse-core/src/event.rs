//! Event model for scheduling-record notifications.
//!
//! Every notification is an [`Event`]: a lifecycle tag, the organization it
//! belongs to, and an opaque JSON payload owned by the emitter.
//!
//! ## Wire Format
//!
//! ```text
//! {"type":"record-updated","data":{"id":"rec-42"},"orgId":"org-1"}
//! ```
//!
//! The same shape is used on the SSE stream, inside relay envelopes and by the
//! client consumer, so every backend produces frames the consumer understands.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

// ============================================================================
// Event Type
// ============================================================================

/// Lifecycle tag of a scheduling record (an *Einsatz* in the host domain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "record-created")]
    RecordCreated,
    #[serde(rename = "record-updated")]
    RecordUpdated,
    #[serde(rename = "record-deleted")]
    RecordDeleted,
    /// Helpers were assigned to or removed from a record.
    #[serde(rename = "record-assignment")]
    RecordAssignment,
}

impl EventType {
    /// Wire name of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RecordCreated => "record-created",
            EventType::RecordUpdated => "record-updated",
            EventType::RecordDeleted => "record-deleted",
            EventType::RecordAssignment => "record-assignment",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Event
// ============================================================================

/// One notification, scoped to exactly one organization.
///
/// Fields are private: an event cannot change after construction, and every
/// path that produces one (constructor, frame parsing, relay envelopes) runs
/// the same organization check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEvent")]
pub struct Event {
    #[serde(rename = "type")]
    kind: EventType,
    #[serde(rename = "data")]
    payload: Value,
    #[serde(rename = "orgId")]
    organization_id: String,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: EventType,
    #[serde(rename = "data", default)]
    payload: Value,
    #[serde(rename = "orgId")]
    organization_id: String,
}

impl TryFrom<RawEvent> for Event {
    type Error = Error;

    fn try_from(raw: RawEvent) -> Result<Self> {
        Event::new(raw.kind, raw.organization_id, raw.payload)
    }
}

impl Event {
    /// Create an event. Fails only when the organization id is blank.
    pub fn new(
        kind: EventType,
        organization_id: impl Into<String>,
        payload: Value,
    ) -> Result<Self> {
        let organization_id = organization_id.into();
        if organization_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "organization id must not be empty".to_string(),
            ));
        }
        Ok(Self {
            kind,
            payload,
            organization_id,
        })
    }

    /// Parse one stream frame.
    pub fn from_frame(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Serialize to a stream frame.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> EventType {
        self.kind
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// The affected record's id, when the payload carries one.
    ///
    /// Accepts string and integer ids; integers are rendered in decimal.
    pub fn record_id(&self) -> Option<String> {
        match self.payload.get("id")? {
            Value::String(id) if !id.is_empty() => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    /// Same event with the payload reduced to `{"id": ...}`.
    ///
    /// Returns `None` when no record id is derivable.
    pub fn id_only(&self) -> Option<Event> {
        self.record_id()?;
        let id = self.payload.get("id")?.clone();
        Some(Event {
            kind: self.kind,
            payload: serde_json::json!({ "id": id }),
            organization_id: self.organization_id.clone(),
        })
    }
}
