//! Runtime configuration for the coordination node.

use std::path::PathBuf;
use std::time::Duration;

use log::warn;
use serde::Deserialize;

use crate::raft::NodeOptions;

/// Node settings loaded from a TOML file; every field has a default so a
/// missing or partial file still yields a runnable configuration.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Address the raft/membership gRPC server listens on.
    pub addr: String,
    /// Address the metrics endpoint listens on.
    pub metrics_addr: String,
    /// Directory holding the WAL and snapshot files.
    pub state_dir: String,
    /// Address of an existing member to join, if any.
    pub join_addr: Option<String>,
    pub tick_interval_ms: u64,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub max_size_per_msg: u64,
    pub max_inflight_msgs: usize,
    pub snapshot_interval: u64,
    pub log_entries_for_slow_followers: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            addr: "0.0.0.0:4000".to_string(),
            metrics_addr: "0.0.0.0:4010".to_string(),
            state_dir: "./data".to_string(),
            join_addr: None,
            tick_interval_ms: 1000,
            election_tick: 3,
            heartbeat_tick: 1,
            max_size_per_msg: u16::MAX as u64,
            max_inflight_msgs: 256,
            snapshot_interval: 1000,
            log_entries_for_slow_followers: 500,
        }
    }
}

impl RuntimeConfig {
    /// Loads configuration from a TOML file, falling back to defaults when
    /// the file is missing or malformed.
    pub fn from_toml(path: &str) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!("could not read config file {}: {}", path, err);
                return RuntimeConfig::default();
            }
        };
        match toml::from_str(&contents) {
            Ok(config) => config,
            Err(err) => {
                warn!("could not parse config file {}: {}", path, err);
                RuntimeConfig::default()
            }
        }
    }

    pub fn node_options(&self) -> NodeOptions {
        let mut opts = NodeOptions::new(self.addr.clone(), PathBuf::from(&self.state_dir));
        opts.join_addr = self.join_addr.clone();
        opts.tick_interval = Duration::from_millis(self.tick_interval_ms);
        opts.election_tick = self.election_tick;
        opts.heartbeat_tick = self.heartbeat_tick;
        opts.max_size_per_msg = self.max_size_per_msg;
        opts.max_inflight_msgs = self.max_inflight_msgs;
        opts.snapshot_interval = self.snapshot_interval;
        opts.log_entries_for_slow_followers = self.log_entries_for_slow_followers;
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.tick_interval_ms, 1000);
        assert_eq!(config.election_tick, 3);
        assert_eq!(config.heartbeat_tick, 1);
        assert_eq!(config.max_inflight_msgs, 256);
        assert_eq!(config.snapshot_interval, 1000);
        assert_eq!(config.log_entries_for_slow_followers, 500);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            addr = "10.0.0.5:4100"
            state_dir = "/var/lib/coord"
            snapshot_interval = 25
            "#,
        )
        .unwrap();
        assert_eq!(config.addr, "10.0.0.5:4100");
        assert_eq!(config.state_dir, "/var/lib/coord");
        assert_eq!(config.snapshot_interval, 25);
        assert_eq!(config.election_tick, 3);
    }
}
