use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Daemon settings, loaded from YAML (default `/etc/lxm/lxm.yaml`).
/// Every field has a default so a missing file means a stock install.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Name of the iptables NAT chain this engine exclusively owns.
    pub chain_name: String,
    /// CIDR of the container bridge; forward targets must be inside.
    pub bridge_cidr: String,
    /// DHCP pool bounds; static leases must fall inside (inclusive).
    pub dhcp_pool_start: Ipv4Addr,
    pub dhcp_pool_end: Ipv4Addr,
    /// dnsmasq config file carrying the managed static-lease block.
    pub dnsmasq_conf: PathBuf,
    /// systemd unit reloaded after lease changes.
    pub dhcp_service: String,
    pub snapshot_dir: PathBuf,
    pub store_path: PathBuf,
    pub command_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chain_name: "LXM_MANAGER".to_string(),
            bridge_cidr: "10.0.3.0/24".to_string(),
            dhcp_pool_start: Ipv4Addr::new(10, 0, 3, 10),
            dhcp_pool_end: Ipv4Addr::new(10, 0, 3, 250),
            dnsmasq_conf: PathBuf::from("/etc/lxc/dhcp.conf"),
            dhcp_service: "lxc-net".to_string(),
            snapshot_dir: PathBuf::from("/var/lib/lxm/snapshots"),
            store_path: PathBuf::from("/var/lib/lxm/rules.json"),
            command_timeout_secs: 10,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {:?}", path))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse settings YAML {:?}", path))
    }

    /// Load settings, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = ?path, "no settings file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.command_timeout_secs)
    }
}
