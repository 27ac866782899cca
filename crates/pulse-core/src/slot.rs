//! Process-wide broker slot.
//!
//! One broker per process: the first caller creates it, every later caller
//! gets the same instance. Creation is guarded so concurrent first callers
//! cannot build two brokers. Broker constructors perform no I/O, so filling
//! the slot is cheap; transports connect lazily on first subscribe.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::{Broker, Result};

static BROKER: OnceCell<Arc<dyn Broker>> = OnceCell::new();

/// The installed broker, if any.
pub fn global_broker() -> Option<Arc<dyn Broker>> {
    BROKER.get().cloned()
}

/// Get the installed broker or install the one built by `init`.
pub fn global_broker_or_init<F>(init: F) -> Arc<dyn Broker>
where
    F: FnOnce() -> Arc<dyn Broker>,
{
    Arc::clone(BROKER.get_or_init(init))
}

/// Fallible variant of [`global_broker_or_init`]. A failed `init` leaves the
/// slot empty so a later call can retry.
pub fn try_global_broker_or_init<F>(init: F) -> Result<Arc<dyn Broker>>
where
    F: FnOnce() -> Result<Arc<dyn Broker>>,
{
    BROKER.get_or_try_init(init).map(Arc::clone)
}
