//! Client configuration.
//!
//! All knobs are explicit named fields with documented defaults; callers
//! build a [`ClientConfig`] with struct-update syntax rather than merging
//! loose option records.

use std::time::Duration;

use crate::auth::Credentials;

/// Top-level configuration for a client instance.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Seed server addresses (`host:port`, scheme prefixes tolerated).
    pub servers: Vec<String>,
    /// Optional client name advertised in the handshake.
    pub name: Option<String>,
    /// Credential material applied on every connect.
    pub credentials: Credentials,
    /// Whether the server should echo this client's publishes back to its
    /// own matching subscriptions.
    pub echo: bool,
    /// Request `+OK` acknowledgements for every command.
    pub verbose: bool,
    /// Request stricter server-side subject validation.
    pub pedantic: bool,
    /// Shuffle the server pool before first use and shuffle gossip
    /// discoveries before appending them.
    pub randomize_servers: bool,
    /// Subject prefix for reply inboxes.
    pub inbox_prefix: String,
    /// Subject prefix for stream API requests.
    pub api_prefix: String,
    /// Pending outbound bytes that trigger an immediate flush.
    pub flush_threshold: usize,
    /// Queue depth of each subscription's delivery channel.
    pub subscription_capacity: usize,
    /// Default timeout for request/response exchanges.
    pub request_timeout: Duration,
    /// Heartbeat settings.
    pub ping: PingConfig,
    /// Reconnection settings.
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec!["127.0.0.1:4222".into()],
            name: None,
            credentials: Credentials::None,
            echo: true,
            verbose: false,
            pedantic: false,
            randomize_servers: false,
            inbox_prefix: "_INBOX".into(),
            api_prefix: "$STR.API".into(),
            flush_threshold: 32 * 1024,
            subscription_capacity: 1024,
            request_timeout: Duration::from_secs(10),
            ping: PingConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Heartbeat monitor settings.
#[derive(Clone, Copy, Debug)]
pub struct PingConfig {
    /// Interval between client-initiated PINGs.
    pub interval: Duration,
    /// Unanswered PINGs tolerated before the connection is declared stale.
    pub max_outstanding: u32,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_outstanding: 2,
        }
    }
}

/// Reconnect loop settings.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectConfig {
    /// Attempts against one server before it is evicted from the pool.
    pub max_attempts_per_server: u32,
    /// Minimum interval between attempts against the same server.
    pub min_retry_interval: Duration,
    /// Base delay of the exponential attempt backoff.
    pub backoff_base: Duration,
    /// Upper bound of the attempt backoff.
    pub backoff_max: Duration,
    /// Maximum random jitter added to each backoff delay.
    pub jitter: Duration,
    /// Timeout racing each dial-plus-handshake attempt.
    pub connect_timeout: Duration,
    /// Keep retrying even when the same authentication error repeats on
    /// consecutive attempts.
    pub ignore_auth_error_abort: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_server: 10,
            min_retry_interval: Duration::from_secs(2),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(4),
            jitter: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
            ignore_auth_error_abort: false,
        }
    }
}
