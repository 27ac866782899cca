//! HTTP handlers.

pub mod events;
pub mod health;

pub use events::{stream_events, subscriber_count, validate_organization_path};
pub use health::health_check;
