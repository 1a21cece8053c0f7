//! Loading, describing and initializing the node's config file.

use anyhow::{bail, Context};
use chrono::Utc;
use peermesh_types::config::{keys, FlatConfig, ProtocolConfig};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Written by `peermesh init`. Every key is optional.
pub const DEFAULT_CONFIG: &str = r#"# PeerMesh node configuration. Missing keys use defaults.

[tcp]
# port = 24700             # unset: pick a free port
# base_address = "myhost"  # unset: this machine's host name
discovery_path = "discovery"
protocol_path = "protocol"

[pipe]
discovery_path = "discovery"
protocol_path = "protocol"

[channel]
max_connections = 25
receive_timeout_ms = 1800000
max_message_size = 65536
max_data_size = 67108864

[handshake]
wait_for_connection_ms = 30000

[protocol]
wait_for_response_ms = 30000

[keepalive]
interval_ms = 60000
check_period_ms = 20000
max_missed_signals = 3

[discovery]
udp_port = 24680
announce_interval_ms = 5000
"#;

/// `~/.peermesh/config.toml`, or `./config.toml` without a home directory.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".peermesh"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}

/// Resolve settings from `path` (or the default location).
///
/// A missing file means defaults. An unreadable or invalid file is logged
/// and also falls back to defaults.
pub fn load_config(path: Option<&Path>) -> ProtocolConfig {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        debug!(path = %path.display(), "No config file, using defaults");
        return ProtocolConfig::default();
    }
    match parse_config_file(&path) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Invalid config file, using defaults");
            ProtocolConfig::default()
        }
    }
}

fn parse_config_file(path: &Path) -> anyhow::Result<ProtocolConfig> {
    let contents = std::fs::read_to_string(path)?;
    let reader = FlatConfig::from_toml_str(&contents)?;
    Ok(ProtocolConfig::from_reader(&reader)?)
}

/// Write [`DEFAULT_CONFIG`] to `path`. With `force`, an existing file is
/// renamed to a timestamped backup first.
pub fn init_config(path: &Path, force: bool) -> anyhow::Result<Option<PathBuf>> {
    let mut backup = None;
    if path.exists() {
        if !force {
            bail!("{} already exists (use --force to replace it)", path.display());
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("config.toml");
        let timestamp = Utc::now().format("%Y%m%d%H%M%S");
        let backup_path = path.with_file_name(format!("{file_name}.backup-{timestamp}"));
        std::fs::rename(path, &backup_path)
            .with_context(|| format!("backing up {}", path.display()))?;
        backup = Some(backup_path);
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    std::fs::write(path, DEFAULT_CONFIG).with_context(|| format!("writing {}", path.display()))?;
    Ok(backup)
}

/// Every setting as `(key, value)`, in key order of the config file.
pub fn describe(config: &ProtocolConfig) -> Vec<(&'static str, String)> {
    let ms = |d: std::time::Duration| d.as_millis().to_string();
    vec![
        (
            keys::TCP_PORT,
            config
                .tcp_port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "auto".to_string()),
        ),
        (keys::TCP_BASE_ADDRESS, config.tcp_base_address.clone()),
        (keys::TCP_DISCOVERY_PATH, config.tcp_discovery_path.clone()),
        (keys::TCP_PROTOCOL_PATH, config.tcp_protocol_path.clone()),
        (keys::PIPE_DISCOVERY_PATH, config.pipe_discovery_path.clone()),
        (keys::PIPE_PROTOCOL_PATH, config.pipe_protocol_path.clone()),
        (keys::MAX_CONNECTIONS, config.max_connections.to_string()),
        (keys::RECEIVE_TIMEOUT_MS, ms(config.receive_timeout)),
        (keys::MAX_MESSAGE_SIZE, config.max_message_size.to_string()),
        (keys::MAX_DATA_SIZE, config.max_data_size.to_string()),
        (keys::WAIT_FOR_CONNECTION_MS, ms(config.wait_for_connection)),
        (keys::WAIT_FOR_RESPONSE_MS, ms(config.wait_for_response)),
        (keys::KEEP_ALIVE_INTERVAL_MS, ms(config.keep_alive_interval)),
        (keys::KEEP_ALIVE_CHECK_PERIOD_MS, ms(config.keep_alive_check_period)),
        (
            keys::MAX_MISSED_KEEP_ALIVE,
            config.max_missed_keep_alive_signals.to_string(),
        ),
        (keys::DISCOVERY_UDP_PORT, config.discovery_udp_port.to_string()),
        (
            keys::DISCOVERY_ANNOUNCE_INTERVAL_MS,
            ms(config.discovery_announce_interval),
        ),
    ]
}
