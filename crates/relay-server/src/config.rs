use serde::Deserialize;
use std::path::PathBuf;

use librelay::RegistryConfig;

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "relay_protocol::paths::default_socket_path")]
    pub socket_path: PathBuf,
    /// Replay window per session.
    #[serde(default = "default_retained_entries")]
    pub retained_entries: usize,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_max_participants")]
    pub default_max_participants: usize,
    /// Inactivity before the reaper times a session out.
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: u64,
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        // Try to load from config file, fall back to defaults.
        let config_path = relay_protocol::paths::config_path();
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            retained_entries: self.retained_entries,
            broadcast_capacity: self.broadcast_capacity,
            default_max_participants: self.default_max_participants,
            staleness_ms: self.staleness_ms,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: relay_protocol::paths::default_socket_path(),
            retained_entries: default_retained_entries(),
            broadcast_capacity: default_broadcast_capacity(),
            default_max_participants: default_max_participants(),
            staleness_ms: default_staleness_ms(),
            reaper_interval_ms: default_reaper_interval_ms(),
        }
    }
}

fn default_retained_entries() -> usize {
    10_000
}

fn default_broadcast_capacity() -> usize {
    1024
}

fn default_max_participants() -> usize {
    8
}

fn default_staleness_ms() -> u64 {
    5 * 60 * 1000
}

fn default_reaper_interval_ms() -> u64 {
    30 * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_defaults() {
        let config: ServerConfig =
            toml::from_str("socket_path = \"/tmp/test-relay.sock\"").unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/test-relay.sock"));
        assert_eq!(config.retained_entries, 10_000);
        assert_eq!(config.staleness_ms, 5 * 60 * 1000);
    }
}
