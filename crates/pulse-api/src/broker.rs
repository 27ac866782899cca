//! Broker selection from configuration.

use std::sync::Arc;

use tracing::info;

use pulse_core::{
    try_global_broker_or_init, Broker, BrokerBackend, InProcessBroker, PulseConfig, RelayBroker,
    Result,
};
use pulse_db::{create_lazy_pool, PgChangeFeed, PgNotifyRelay, PoolConfig};

use crate::services::RedisRelay;

/// Build the broker for the configured backend. Performs no network I/O;
/// transports connect on first subscribe or emit.
pub fn build_broker(config: &PulseConfig) -> Result<Arc<dyn Broker>> {
    let broker: Arc<dyn Broker> = match config.broker {
        BrokerBackend::InProcess => Arc::new(InProcessBroker::new()),
        BrokerBackend::Postgres => {
            let pool = create_lazy_pool(&config.database_url, PoolConfig::default())?;
            let relay = PgNotifyRelay::with_channel(pool, &config.event_channel)?;
            Arc::new(RelayBroker::new(relay))
        }
        BrokerBackend::Redis => {
            let relay = RedisRelay::with_prefix(&config.redis_url, &config.redis_channel_prefix())?;
            Arc::new(RelayBroker::new(relay))
        }
        BrokerBackend::Changefeed => {
            let pool = create_lazy_pool(&config.database_url, PoolConfig::default())?;
            let feed = PgChangeFeed::new(pool)
                .table(&config.changefeed_table)?
                .organization_column(&config.changefeed_org_column)?
                .id_column(&config.changefeed_id_column)?
                .install_on_open(config.changefeed_install_trigger);
            Arc::new(feed.into_broker())
        }
    };

    info!(
        subsystem = "api",
        component = "broker",
        backend = %broker.backend(),
        "Event broker configured"
    );
    Ok(broker)
}

/// The process-wide broker, built from `config` on first call.
pub fn global_broker(config: &PulseConfig) -> Result<Arc<dyn Broker>> {
    try_global_broker_or_init(|| build_broker(config))
}
