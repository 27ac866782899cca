//! Environment-driven configuration.

use std::time::Duration;

use tracing::warn;

use crate::defaults;
use crate::{BrokerBackend, Result};

/// Settings shared by the server binary and the broker factory.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseConfig {
    pub broker: BrokerBackend,
    pub database_url: String,
    pub redis_url: String,
    /// Notify channel name; also the base of the Redis channel prefix.
    pub event_channel: String,
    pub changefeed_table: String,
    pub changefeed_org_column: String,
    pub changefeed_id_column: String,
    pub changefeed_install_trigger: bool,
    pub stream_buffer: usize,
    /// `None` disables the idle timeout.
    pub stream_idle_timeout: Option<Duration>,
    pub stream_keepalive: Duration,
    pub host: String,
    pub port: u16,
    pub allowed_origins: String,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            broker: BrokerBackend::default(),
            database_url: "postgres://localhost/pulse".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            event_channel: defaults::NOTIFY_CHANNEL.to_string(),
            changefeed_table: defaults::CHANGEFEED_TABLE.to_string(),
            changefeed_org_column: defaults::CHANGEFEED_ORG_COLUMN.to_string(),
            changefeed_id_column: defaults::CHANGEFEED_ID_COLUMN.to_string(),
            changefeed_install_trigger: false,
            stream_buffer: defaults::STREAM_BUFFER,
            stream_idle_timeout: Some(Duration::from_secs(defaults::STREAM_IDLE_TIMEOUT_SECS)),
            stream_keepalive: Duration::from_secs(defaults::STREAM_KEEPALIVE_SECS),
            host: defaults::SERVER_HOST.to_string(),
            port: defaults::SERVER_PORT,
            allowed_origins: "http://localhost:3000".to_string(),
        }
    }
}

impl PulseConfig {
    /// Read configuration from the process environment.
    ///
    /// Malformed numeric or boolean values fall back to their defaults with a
    /// warning. An unknown `EVENT_BROKER` is an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`PulseConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let broker = match var("EVENT_BROKER") {
            Some(value) => value.parse()?,
            None => base.broker,
        };

        let stream_buffer = parse_or(&var, "STREAM_BUFFER", defaults::STREAM_BUFFER).max(1);
        let idle_secs = parse_or(
            &var,
            "STREAM_IDLE_TIMEOUT_SECS",
            defaults::STREAM_IDLE_TIMEOUT_SECS,
        );
        let keepalive_secs =
            parse_or(&var, "STREAM_KEEPALIVE_SECS", defaults::STREAM_KEEPALIVE_SECS).max(1);

        Ok(Self {
            broker,
            database_url: var("DATABASE_URL").unwrap_or(base.database_url),
            redis_url: var("REDIS_URL").unwrap_or(base.redis_url),
            event_channel: var("EVENT_CHANNEL").unwrap_or(base.event_channel),
            changefeed_table: var("CHANGEFEED_TABLE").unwrap_or(base.changefeed_table),
            changefeed_org_column: var("CHANGEFEED_ORG_COLUMN")
                .unwrap_or(base.changefeed_org_column),
            changefeed_id_column: var("CHANGEFEED_ID_COLUMN").unwrap_or(base.changefeed_id_column),
            changefeed_install_trigger: parse_bool_or(
                &var,
                "CHANGEFEED_INSTALL_TRIGGER",
                base.changefeed_install_trigger,
            ),
            stream_buffer,
            stream_idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            stream_keepalive: Duration::from_secs(keepalive_secs),
            host: var("HOST").unwrap_or(base.host),
            port: parse_or(&var, "PORT", defaults::SERVER_PORT),
            allowed_origins: var("ALLOWED_ORIGINS").unwrap_or(base.allowed_origins),
        })
    }

    /// Redis channel prefix derived from the event channel.
    pub fn redis_channel_prefix(&self) -> String {
        if self.event_channel == defaults::NOTIFY_CHANNEL {
            defaults::REDIS_CHANNEL_PREFIX.to_string()
        } else {
            format!("{}:", self.event_channel)
        }
    }

    /// Socket address string for the listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn with_broker(mut self, broker: BrokerBackend) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }
}

fn parse_or<F, T>(var: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + std::fmt::Display,
{
    match var(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(
                    subsystem = "config",
                    key,
                    value = %raw,
                    default = %default,
                    "Invalid value, using default"
                );
                default
            }
        },
        None => default,
    }
}

fn parse_bool_or<F>(var: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match var(key).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        Some(v) => {
            warn!(subsystem = "config", key, value = %v, default, "Invalid boolean, using default");
            default
        }
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = PulseConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PulseConfig::default());
        assert_eq!(config.broker, BrokerBackend::InProcess);
        assert_eq!(config.stream_buffer, 64);
        assert_eq!(config.stream_idle_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.stream_keepalive, Duration::from_secs(15));
        assert_eq!(config.bind_address(), "0.0.0.0:3000");
    }

    #[test]
    fn test_overrides() {
        let config = PulseConfig::from_lookup(lookup(&[
            ("EVENT_BROKER", "redis"),
            ("REDIS_URL", "redis://cache:6379"),
            ("STREAM_BUFFER", "8"),
            ("STREAM_IDLE_TIMEOUT_SECS", "0"),
            ("CHANGEFEED_INSTALL_TRIGGER", "true"),
            ("PORT", "8080"),
        ]))
        .unwrap();
        assert_eq!(config.broker, BrokerBackend::Redis);
        assert_eq!(config.redis_url, "redis://cache:6379");
        assert_eq!(config.stream_buffer, 8);
        assert_eq!(config.stream_idle_timeout, None);
        assert!(config.changefeed_install_trigger);
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let config = PulseConfig::from_lookup(lookup(&[
            ("STREAM_BUFFER", "lots"),
            ("PORT", "-1"),
            ("CHANGEFEED_INSTALL_TRIGGER", "maybe"),
        ]))
        .unwrap();
        assert_eq!(config.stream_buffer, 64);
        assert_eq!(config.port, 3000);
        assert!(!config.changefeed_install_trigger);
    }

    #[test]
    fn test_unknown_broker_is_error() {
        let result = PulseConfig::from_lookup(lookup(&[("EVENT_BROKER", "kafka")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_redis_channel_prefix() {
        let config = PulseConfig::default();
        assert_eq!(config.redis_channel_prefix(), "pulse:events:");

        let custom = PulseConfig::from_lookup(lookup(&[("EVENT_CHANNEL", "dispatch")])).unwrap();
        assert_eq!(custom.redis_channel_prefix(), "dispatch:");
    }
}
