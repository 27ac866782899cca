//! Broker capability set shared by every transport backend.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::{Callback, Error, Event, Result, Subscription};

/// Deployment-time choice of transport. Exactly one is active per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerBackend {
    /// Single-process fan-out.
    #[default]
    InProcess,
    /// PostgreSQL `LISTEN/NOTIFY` on one shared channel.
    Postgres,
    /// Redis pub/sub, one channel per organization.
    Redis,
    /// Events derived from row changes of the record table.
    Changefeed,
}

impl BrokerBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerBackend::InProcess => "in-process",
            BrokerBackend::Postgres => "postgres",
            BrokerBackend::Redis => "redis",
            BrokerBackend::Changefeed => "changefeed",
        }
    }

    /// Whether events cross process boundaries with this backend.
    pub fn is_cross_process(&self) -> bool {
        !matches!(self, BrokerBackend::InProcess)
    }
}

impl fmt::Display for BrokerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in-process" | "inprocess" | "memory" => Ok(BrokerBackend::InProcess),
            "postgres" | "pg" | "pg-notify" => Ok(BrokerBackend::Postgres),
            "redis" => Ok(BrokerBackend::Redis),
            "changefeed" => Ok(BrokerBackend::Changefeed),
            other => Err(Error::Config(format!("unknown event broker '{}'", other))),
        }
    }
}

/// Publish/subscribe fan-out scoped by organization.
///
/// Local dispatch is synchronous: `emit` returns after every local callback
/// for the event's organization has run. Cross-process backends additionally
/// publish to their shared transport and suspend for that round trip.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Which transport this broker uses.
    fn backend(&self) -> BrokerBackend;

    /// Receive every future event of `organization_id` until the returned
    /// handle is unsubscribed or dropped. Past events are not replayed.
    async fn subscribe(&self, organization_id: &str, callback: Callback) -> Result<Subscription>;

    /// Deliver an event to local subscribers and, for cross-process
    /// backends, to the shared transport.
    ///
    /// A failing subscriber never fails the emit. An error means the shared
    /// transport rejected the event; local subscribers were still served.
    async fn emit(&self, event: Event) -> Result<()>;

    /// Number of local subscribers for an organization.
    fn subscriber_count(&self, organization_id: &str) -> usize;
}

pub(crate) fn validate_organization_id(organization_id: &str) -> Result<()> {
    if organization_id.trim().is_empty() {
        return Err(Error::InvalidInput(
            "organization id must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!("in-process".parse::<BrokerBackend>().unwrap(), BrokerBackend::InProcess);
        assert_eq!("Postgres".parse::<BrokerBackend>().unwrap(), BrokerBackend::Postgres);
        assert_eq!(" redis ".parse::<BrokerBackend>().unwrap(), BrokerBackend::Redis);
        assert_eq!("changefeed".parse::<BrokerBackend>().unwrap(), BrokerBackend::Changefeed);
        assert!(matches!(
            "kafka".parse::<BrokerBackend>(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_backend_names_round_trip() {
        for backend in [
            BrokerBackend::InProcess,
            BrokerBackend::Postgres,
            BrokerBackend::Redis,
            BrokerBackend::Changefeed,
        ] {
            assert_eq!(backend.as_str().parse::<BrokerBackend>().unwrap(), backend);
        }
        assert!(!BrokerBackend::InProcess.is_cross_process());
        assert!(BrokerBackend::Redis.is_cross_process());
    }

    #[test]
    fn test_validate_organization_id() {
        assert!(validate_organization_id("org-1").is_ok());
        assert!(validate_organization_id("").is_err());
        assert!(validate_organization_id(" \t").is_err());
    }
}
