//! Fabric configuration, loaded from a TOML file.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

fn default_sync_port() -> u16 {
    8765
}

fn default_data_port() -> u16 {
    8766
}

fn default_radio_port() -> u16 {
    8767
}

fn default_fabric_host() -> String {
    "localhost".to_string()
}

fn default_fabric_port() -> u16 {
    8766
}

// Default pacing of gossip, probing and membership refresh (milliseconds)
fn default_interval_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Port accepting peer synchronisation servers for gossip.
    #[serde(default = "default_sync_port")]
    pub sync_port: u16,
    /// Port accepting synchronisation clients for orders.
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    /// First port a radio tries for its own listener.
    #[serde(default = "default_radio_port")]
    pub radio_port: u16,
    /// Where the fabric broker lives.
    #[serde(default = "default_fabric_host")]
    pub fabric_host: String,
    #[serde(default = "default_fabric_port")]
    pub fabric_port: u16,
    /// Local IP override; `None` enumerates every interface.
    #[serde(default)]
    pub ip: Option<String>,
    /// Probe targets; `None` sweeps every local /24.
    #[serde(default)]
    pub target_ips: Option<Vec<String>>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for FabricConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config deserialises to the defaults")
    }
}

impl FabricConfig {
    /// Read `path`, falling back to the defaults when the file is absent.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(FabricConfig::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        Some(Duration::from_millis(self.connect_timeout_ms))
    }
}
