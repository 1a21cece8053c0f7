//! Flat key/value configuration and the resolved protocol settings.
//!
//! The protocol layer never touches files itself: it receives a
//! [`ConfigurationReader`] that answers string lookups by dotted key, and
//! resolves it once into a [`ProtocolConfig`] with defaults for every
//! missing value. A TOML document can be flattened into such a reader with
//! [`FlatConfig::from_toml_str`].

use crate::error::PeerMeshError;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Configuration keys understood by the protocol layer.
pub mod keys {
    pub const TCP_PORT: &str = "tcp.port";
    pub const TCP_BASE_ADDRESS: &str = "tcp.base_address";
    pub const TCP_DISCOVERY_PATH: &str = "tcp.discovery_path";
    pub const TCP_PROTOCOL_PATH: &str = "tcp.protocol_path";
    pub const PIPE_DISCOVERY_PATH: &str = "pipe.discovery_path";
    pub const PIPE_PROTOCOL_PATH: &str = "pipe.protocol_path";
    pub const MAX_CONNECTIONS: &str = "channel.max_connections";
    pub const RECEIVE_TIMEOUT_MS: &str = "channel.receive_timeout_ms";
    pub const MAX_MESSAGE_SIZE: &str = "channel.max_message_size";
    pub const MAX_DATA_SIZE: &str = "channel.max_data_size";
    pub const WAIT_FOR_CONNECTION_MS: &str = "handshake.wait_for_connection_ms";
    pub const WAIT_FOR_RESPONSE_MS: &str = "protocol.wait_for_response_ms";
    pub const KEEP_ALIVE_INTERVAL_MS: &str = "keepalive.interval_ms";
    pub const KEEP_ALIVE_CHECK_PERIOD_MS: &str = "keepalive.check_period_ms";
    pub const MAX_MISSED_KEEP_ALIVE: &str = "keepalive.max_missed_signals";
    pub const DISCOVERY_UDP_PORT: &str = "discovery.udp_port";
    pub const DISCOVERY_ANNOUNCE_INTERVAL_MS: &str = "discovery.announce_interval_ms";
}

/// Read-only flat configuration source.
pub trait ConfigurationReader: Send + Sync {
    /// Raw string value for `key`, if configured.
    fn raw_value(&self, key: &str) -> Option<String>;

    /// Whether `key` has a value.
    fn has_value(&self, key: &str) -> bool {
        self.raw_value(key).is_some()
    }
}

/// Read and parse a typed value. `Ok(None)` when the key is absent.
pub fn read_value<T>(
    reader: &dyn ConfigurationReader,
    key: &str,
) -> Result<Option<T>, PeerMeshError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match reader.raw_value(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| PeerMeshError::Config {
                key: key.to_string(),
                reason: e.to_string(),
            }),
    }
}

impl ConfigurationReader for HashMap<String, String> {
    fn raw_value(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// A configuration document flattened into dotted keys.
#[derive(Debug, Clone, Default)]
pub struct FlatConfig {
    values: HashMap<String, String>,
}

impl FlatConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a single value (builder style).
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    /// Parse a TOML document. Nested tables become dotted keys, so
    /// `[tcp]\nport = 4000` is readable as `tcp.port`.
    pub fn from_toml_str(contents: &str) -> Result<Self, PeerMeshError> {
        let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| {
            PeerMeshError::Config {
                key: "<document>".to_string(),
                reason: e.to_string(),
            }
        })?;
        let mut values = HashMap::new();
        flatten_table("", &table, &mut values);
        Ok(Self { values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn flatten_table(prefix: &str, table: &toml::Table, out: &mut HashMap<String, String>) {
    for (key, value) in table {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(inner) => flatten_table(&full, inner, out),
            toml::Value::String(s) => {
                out.insert(full, s.clone());
            }
            other => {
                out.insert(full, other.to_string());
            }
        }
    }
}

impl ConfigurationReader for FlatConfig {
    fn raw_value(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Resolved protocol settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolConfig {
    /// Fixed TCP port; `None` picks a free port for every new channel.
    pub tcp_port: Option<u16>,
    /// Host name used in TCP addresses.
    pub tcp_base_address: String,
    pub tcp_discovery_path: String,
    pub tcp_protocol_path: String,
    pub pipe_discovery_path: String,
    pub pipe_protocol_path: String,
    /// Maximum concurrent inbound connections per hosted channel.
    pub max_connections: usize,
    /// Idle time after which an inbound connection is dropped.
    pub receive_timeout: Duration,
    /// Largest accepted message frame, in bytes.
    pub max_message_size: u32,
    /// Largest accepted data transfer, in bytes.
    pub max_data_size: u64,
    /// How long a handshake waits for the remote's reply.
    pub wait_for_connection: Duration,
    /// Default wait for a response to a request message.
    pub wait_for_response: Duration,
    /// Quiet time after which a connection is actively verified.
    pub keep_alive_interval: Duration,
    /// How often the connection monitor looks for due verifications.
    pub keep_alive_check_period: Duration,
    /// Consecutive failed verifications tolerated before disconnecting.
    pub max_missed_keep_alive_signals: u32,
    /// UDP port used by broadcast discovery.
    pub discovery_udp_port: u16,
    /// How often broadcast discovery announces this endpoint.
    pub discovery_announce_interval: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            tcp_port: None,
            tcp_base_address: default_host_name(),
            tcp_discovery_path: "discovery".to_string(),
            tcp_protocol_path: "protocol".to_string(),
            pipe_discovery_path: "discovery".to_string(),
            pipe_protocol_path: "protocol".to_string(),
            max_connections: 25,
            receive_timeout: Duration::from_secs(30 * 60),
            max_message_size: 65_536,
            max_data_size: 64 * 1024 * 1024,
            wait_for_connection: Duration::from_millis(30_000),
            wait_for_response: Duration::from_millis(30_000),
            keep_alive_interval: Duration::from_millis(60_000),
            keep_alive_check_period: Duration::from_millis(20_000),
            max_missed_keep_alive_signals: 3,
            discovery_udp_port: 24_680,
            discovery_announce_interval: Duration::from_millis(5_000),
        }
    }
}

impl ProtocolConfig {
    /// Resolve settings from a flat reader, falling back to defaults for
    /// every key that is not present.
    pub fn from_reader(reader: &dyn ConfigurationReader) -> Result<Self, PeerMeshError> {
        let d = Self::default();
        let millis = |key: &str, fallback: Duration| -> Result<Duration, PeerMeshError> {
            Ok(read_value::<u64>(reader, key)?
                .map(Duration::from_millis)
                .unwrap_or(fallback))
        };

        let config = Self {
            tcp_port: read_value::<u16>(reader, keys::TCP_PORT)?,
            tcp_base_address: read_value::<String>(reader, keys::TCP_BASE_ADDRESS)?
                .filter(|s| !s.is_empty())
                .unwrap_or(d.tcp_base_address),
            tcp_discovery_path: read_value(reader, keys::TCP_DISCOVERY_PATH)?
                .unwrap_or(d.tcp_discovery_path),
            tcp_protocol_path: read_value(reader, keys::TCP_PROTOCOL_PATH)?
                .unwrap_or(d.tcp_protocol_path),
            pipe_discovery_path: read_value(reader, keys::PIPE_DISCOVERY_PATH)?
                .unwrap_or(d.pipe_discovery_path),
            pipe_protocol_path: read_value(reader, keys::PIPE_PROTOCOL_PATH)?
                .unwrap_or(d.pipe_protocol_path),
            max_connections: read_value(reader, keys::MAX_CONNECTIONS)?
                .unwrap_or(d.max_connections),
            receive_timeout: millis(keys::RECEIVE_TIMEOUT_MS, d.receive_timeout)?,
            max_message_size: read_value(reader, keys::MAX_MESSAGE_SIZE)?
                .unwrap_or(d.max_message_size),
            max_data_size: read_value(reader, keys::MAX_DATA_SIZE)?.unwrap_or(d.max_data_size),
            wait_for_connection: millis(keys::WAIT_FOR_CONNECTION_MS, d.wait_for_connection)?,
            wait_for_response: millis(keys::WAIT_FOR_RESPONSE_MS, d.wait_for_response)?,
            keep_alive_interval: millis(keys::KEEP_ALIVE_INTERVAL_MS, d.keep_alive_interval)?,
            keep_alive_check_period: millis(
                keys::KEEP_ALIVE_CHECK_PERIOD_MS,
                d.keep_alive_check_period,
            )?,
            max_missed_keep_alive_signals: read_value(reader, keys::MAX_MISSED_KEEP_ALIVE)?
                .unwrap_or(d.max_missed_keep_alive_signals),
            discovery_udp_port: read_value(reader, keys::DISCOVERY_UDP_PORT)?
                .unwrap_or(d.discovery_udp_port),
            discovery_announce_interval: millis(
                keys::DISCOVERY_ANNOUNCE_INTERVAL_MS,
                d.discovery_announce_interval,
            )?,
        };

        if config.max_connections == 0 {
            return Err(PeerMeshError::Config {
                key: keys::MAX_CONNECTIONS.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if config.keep_alive_check_period.is_zero() {
            return Err(PeerMeshError::Config {
                key: keys::KEEP_ALIVE_CHECK_PERIOD_MS.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(config)
    }
}

fn default_host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
