//! Centralized default constants for pulse.
//!
//! All crates reference these constants instead of defining their own magic
//! numbers. Organized by component.

// =============================================================================
// TRANSPORT
// =============================================================================

/// Notify channel shared by every process using the Postgres backend.
pub const NOTIFY_CHANNEL: &str = "einsatz_events";

/// Channel the changefeed trigger publishes row changes on.
pub const CHANGEFEED_CHANNEL: &str = "einsatz_changes";

/// Prefix of the per-organization Redis channel (`pulse:events:<org>`).
pub const REDIS_CHANNEL_PREFIX: &str = "pulse:events:";

/// PostgreSQL rejects NOTIFY payloads of 8000 bytes or more.
pub const NOTIFY_PAYLOAD_HARD_LIMIT: usize = 8000;

/// Envelopes at or above this size are reduced to an id-only payload.
pub const NOTIFY_PAYLOAD_LIMIT: usize = 7900;

// =============================================================================
// CHANGEFEED
// =============================================================================

/// Table holding scheduling records.
pub const CHANGEFEED_TABLE: &str = "einsatz";

/// Column carrying the owning organization.
pub const CHANGEFEED_ORG_COLUMN: &str = "org_id";

/// Primary key column.
pub const CHANGEFEED_ID_COLUMN: &str = "id";

// =============================================================================
// STREAMING ENDPOINT
// =============================================================================

/// Frames buffered per connection before it is closed as too slow.
pub const STREAM_BUFFER: usize = 64;

/// Seconds without an event before a stream is closed.
pub const STREAM_IDLE_TIMEOUT_SECS: u64 = 600;

/// SSE keep-alive comment interval in seconds.
pub const STREAM_KEEPALIVE_SECS: u64 = 15;

/// Longest organization id accepted by the endpoint.
pub const ORGANIZATION_ID_MAX_LEN: usize = 128;

// =============================================================================
// RECONNECT
// =============================================================================

/// Base delay for exponential backoff in milliseconds.
pub const RECONNECT_BASE_MS: u64 = 1_000;

/// Upper bound for a single backoff delay in milliseconds.
pub const RECONNECT_MAX_MS: u64 = 30_000;

/// Consecutive failed attempts after which the client consumer gives up.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Largest SSE message the client buffers before dropping the connection.
pub const CLIENT_MAX_FRAME_BYTES: usize = 1024 * 1024;

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;

/// Default bind host.
pub const SERVER_HOST: &str = "0.0.0.0";
