//! # pulse-core
//!
//! Event model, broker abstraction and subscription registry for pulse, the
//! organization-scoped real-time event fan-out.
//!
//! Every backend implements [`Broker`]. The in-process broker fans out inside
//! one process; [`RelayBroker`] adds a shared transport ([`Relay`]) so events
//! reach subscribers in other processes; [`ChangefeedBroker`] derives events
//! from table row changes instead of explicit emits.

pub mod backoff;
pub mod broker;
pub mod changefeed;
pub mod config;
pub mod defaults;
pub mod error;
pub mod event;
pub mod in_process;
pub mod registry;
pub mod relay;
pub mod slot;
pub mod test_fixtures;

// Re-export commonly used types at crate root
pub use backoff::{backoff_delay, backoff_delay_with};
pub use broker::{Broker, BrokerBackend};
pub use changefeed::{
    ChangeFeed, ChangeKind, ChangeStream, ChangeTranslator, ChangefeedBroker, RowChange,
};
pub use config::PulseConfig;
pub use error::{Error, Result};
pub use event::{Event, EventType};
pub use in_process::InProcessBroker;
pub use registry::{
    callback, Callback, Registration, Removal, SubscriberRegistry, Subscription, SubscriptionId,
};
pub use relay::{InboundStream, Relay, RelayBroker, RelayEnvelope, RelayMessage};
pub use slot::{global_broker, global_broker_or_init, try_global_broker_or_init};
