//! Redis pub/sub relay.
//!
//! Each organization has its own channel (`<prefix><organization id>`), so
//! releasing an organization is a real `UNSUBSCRIBE`. Publishing goes
//! through a [`ConnectionManager`]; the inbound side is a dedicated pub/sub
//! connection split into a command sink and a message stream.
//!
//! ## Configuration
//!
//! - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
//! - `EVENT_CHANNEL`: base of the channel prefix (default prefix: `pulse:events:`)

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink};
use redis::AsyncCommands;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use pulse_core::defaults::REDIS_CHANNEL_PREFIX;
use pulse_core::{
    BrokerBackend, Error, InboundStream, Relay, RelayBroker, RelayEnvelope, RelayMessage, Result,
};

/// Broker publishing through Redis.
pub type RedisBroker = RelayBroker<RedisRelay>;

fn transport(e: redis::RedisError) -> Error {
    Error::Transport(format!("redis: {}", e))
}

/// Transport half of the Redis backend.
pub struct RedisRelay {
    client: redis::Client,
    prefix: String,
    publisher: OnceCell<ConnectionManager>,
    subscriber: Mutex<Option<PubSubSink>>,
}

impl RedisRelay {
    /// Parse the URL. No connection is opened until first use.
    pub fn new(redis_url: &str) -> Result<Self> {
        Self::with_prefix(redis_url, REDIS_CHANNEL_PREFIX)
    }

    pub fn with_prefix(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Config(format!("invalid REDIS_URL: {}", e)))?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            publisher: OnceCell::new(),
            subscriber: Mutex::new(None),
        })
    }

    /// Channel carrying one organization's events.
    pub fn channel(&self, organization_id: &str) -> String {
        format!("{}{}", self.prefix, organization_id)
    }

    async fn publisher(&self) -> Result<ConnectionManager> {
        let conn = self
            .publisher
            .get_or_try_init(|| async {
                let conn = ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(transport)?;
                info!(
                    subsystem = "broker",
                    component = "redis",
                    op = "connect",
                    "Redis publisher connected"
                );
                Ok::<_, Error>(conn)
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl Relay for RedisRelay {
    fn backend(&self) -> BrokerBackend {
        BrokerBackend::Redis
    }

    async fn listen(&self) -> Result<InboundStream> {
        let pubsub = self.client.get_async_pubsub().await.map_err(transport)?;
        let (sink, stream) = pubsub.split();
        *self.subscriber.lock().await = Some(sink);

        info!(
            subsystem = "broker",
            component = "redis",
            op = "listen",
            prefix = %self.prefix,
            "Redis subscriber connected"
        );

        let messages = stream.filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(RelayMessage { channel, payload }),
                Err(e) => {
                    warn!(
                        subsystem = "broker",
                        component = "redis",
                        channel = %channel,
                        error = %e,
                        "Discarding non-text pub/sub payload"
                    );
                    None
                }
            }
        });
        Ok(messages.boxed())
    }

    async fn join(&self, organization_id: &str) -> Result<()> {
        let channel = self.channel(organization_id);
        let mut guard = self.subscriber.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| Error::Transport("redis subscriber not connected".to_string()))?;
        sink.subscribe(&channel).await.map_err(transport)?;
        debug!(
            subsystem = "broker",
            component = "redis",
            op = "subscribe",
            channel = %channel,
            "Joined organization channel"
        );
        Ok(())
    }

    async fn leave(&self, organization_id: &str) -> Result<()> {
        let channel = self.channel(organization_id);
        let mut guard = self.subscriber.lock().await;
        if let Some(sink) = guard.as_mut() {
            sink.unsubscribe(&channel).await.map_err(transport)?;
        }
        Ok(())
    }

    async fn publish(&self, envelope: &RelayEnvelope) -> Result<()> {
        let payload = envelope.encode()?;
        let channel = self.channel(envelope.event.organization_id());
        let mut conn = self.publisher().await?;
        conn.publish::<_, _, ()>(&channel, payload)
            .await
            .map_err(transport)?;
        Ok(())
    }

    fn accepts(&self, channel: &str, organization_id: &str) -> bool {
        channel == self.channel(organization_id)
    }
}
