//! # pulse-db
//!
//! PostgreSQL transports for pulse.
//!
//! This crate provides:
//! - Connection pool management
//! - [`PgNotifyRelay`]: cross-process fan-out over one `LISTEN/NOTIFY` channel
//! - [`PgChangeFeed`]: events derived from row changes through a notify trigger
//!
//! ## Example
//!
//! ```rust,ignore
//! use pulse_core::{callback, Broker};
//! use pulse_db::{create_lazy_pool, PgNotifyBroker, PgNotifyRelay, PoolConfig};
//!
//! let pool = create_lazy_pool("postgres://localhost/pulse", PoolConfig::default())?;
//! let broker = PgNotifyBroker::new(PgNotifyRelay::new(pool));
//! let _sub = broker
//!     .subscribe("org-1", callback(|event| {
//!         println!("{}", event.kind());
//!         Ok(())
//!     }))
//!     .await?;
//! ```

pub mod changefeed;
pub mod ident;
pub mod notify;
pub mod pool;

pub use changefeed::{PgChangeFeed, PgChangefeedBroker};
pub use notify::{notify_payload, PgNotifyBroker, PgNotifyRelay};
pub use pool::{create_lazy_pool, create_pool, PoolConfig};
