//! # pulse-client
//!
//! Consumer side of pulse: keeps an organization's event stream open,
//! reconnects with capped exponential backoff and turns every received event
//! into cache invalidations.
//!
//! ```no_run
//! use std::sync::Arc;
//! use pulse_client::{EventConsumer, HttpEventSource, QueryKey};
//!
//! # async fn demo() -> pulse_core::Result<()> {
//! let source = HttpEventSource::new("http://localhost:3000")?;
//! let invalidate = |key: &QueryKey| println!("stale: {}", key);
//! let mut consumer = EventConsumer::new(source, Arc::new(invalidate));
//! consumer.mount("org-1").await?;
//! # Ok(())
//! # }
//! ```

pub mod consumer;
pub mod frame;
pub mod invalidation;
pub mod source;

pub use consumer::{ConsumerState, EventConsumer, ReconnectPolicy};
pub use frame::FrameDecoder;
pub use invalidation::{apply_event, keys_for, CacheInvalidator, QueryKey, RecordingInvalidator};
pub use source::{EventSource, FrameStream, HttpEventSource};
