//! `LISTEN/NOTIFY` relay.
//!
//! All organizations share one notification channel. Publishing runs
//! `pg_notify` on the pool; the inbound side is a dedicated [`PgListener`]
//! connection. Since the channel is shared, joining and leaving an
//! organization needs no database round trip: the broker's registry entry is
//! the only per-organization resource.
//!
//! PostgreSQL rejects notification payloads of 8000 bytes or more. Envelopes
//! at or above [`NOTIFY_PAYLOAD_LIMIT`] are re-sent with the event reduced to
//! `{"id": ...}`, so consumers refetch the record by id.

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::{PgListener, PgNotification, PgPool};
use tracing::{debug, info, warn};

use pulse_core::defaults::{NOTIFY_CHANNEL, NOTIFY_PAYLOAD_LIMIT};
use pulse_core::{
    BrokerBackend, Error, InboundStream, Relay, RelayBroker, RelayEnvelope, RelayMessage, Result,
};

use crate::ident::validate_identifier;

/// Broker publishing through PostgreSQL notifications.
pub type PgNotifyBroker = RelayBroker<PgNotifyRelay>;

/// Transport half of the `LISTEN/NOTIFY` backend.
#[derive(Clone)]
pub struct PgNotifyRelay {
    pool: PgPool,
    channel: String,
}

impl PgNotifyRelay {
    /// Relay on the default `einsatz_events` channel.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            channel: NOTIFY_CHANNEL.to_string(),
        }
    }

    /// Relay on a custom channel. The name must be a plain SQL identifier.
    pub fn with_channel(pool: PgPool, channel: &str) -> Result<Self> {
        let channel = validate_identifier("notify channel", channel)?.to_string();
        Ok(Self { pool, channel })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// Encode an envelope for `pg_notify`, applying the payload size policy.
pub fn notify_payload(envelope: &RelayEnvelope) -> Result<String> {
    let encoded = envelope.encode()?;
    if encoded.len() < NOTIFY_PAYLOAD_LIMIT {
        return Ok(encoded);
    }

    let too_large = |size: usize| Error::PayloadTooLarge {
        size,
        limit: NOTIFY_PAYLOAD_LIMIT,
    };
    let reduced = envelope
        .event
        .id_only()
        .ok_or_else(|| too_large(encoded.len()))?;
    let reduced = RelayEnvelope {
        origin: envelope.origin,
        event: reduced,
    }
    .encode()?;
    if reduced.len() >= NOTIFY_PAYLOAD_LIMIT {
        return Err(too_large(reduced.len()));
    }

    warn!(
        subsystem = "db",
        component = "postgres",
        op = "publish",
        org_id = envelope.event.organization_id(),
        payload_len = encoded.len(),
        reduced_len = reduced.len(),
        "Notify payload over limit, sending id-only event"
    );
    Ok(reduced)
}

/// Turn a listener into a stream that ends when the connection is lost.
///
/// `PgListener` would reconnect transparently and drop the notifications
/// sent meanwhile; ending the stream instead lets the broker log and count
/// the reconnect.
pub(crate) fn notification_stream(
    listener: PgListener,
) -> futures::stream::BoxStream<'static, PgNotification> {
    futures::stream::unfold(listener, |mut listener| async move {
        match listener.try_recv().await {
            Ok(Some(notification)) => Some((notification, listener)),
            Ok(None) => {
                warn!(
                    subsystem = "db",
                    component = "listener",
                    "Notification connection lost"
                );
                None
            }
            Err(e) => {
                warn!(
                    subsystem = "db",
                    component = "listener",
                    error = %e,
                    "Notification receive failed"
                );
                None
            }
        }
    })
    .boxed()
}

#[async_trait]
impl Relay for PgNotifyRelay {
    fn backend(&self) -> BrokerBackend {
        BrokerBackend::Postgres
    }

    async fn listen(&self) -> Result<InboundStream> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        info!(
            subsystem = "db",
            component = "postgres",
            op = "listen",
            channel = %self.channel,
            "Listening for notifications"
        );

        let stream = notification_stream(listener).map(|notification| RelayMessage {
            channel: notification.channel().to_string(),
            payload: notification.payload().to_string(),
        });
        Ok(stream.boxed())
    }

    async fn join(&self, organization_id: &str) -> Result<()> {
        debug!(
            subsystem = "db",
            component = "postgres",
            org_id = organization_id,
            "Shared channel, nothing to join"
        );
        Ok(())
    }

    async fn leave(&self, _organization_id: &str) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, envelope: &RelayEnvelope) -> Result<()> {
        let payload = notify_payload(envelope)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(&payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
