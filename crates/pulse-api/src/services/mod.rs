//! Transport services owned by the server crate.

pub mod redis_relay;

pub use redis_relay::{RedisBroker, RedisRelay};
