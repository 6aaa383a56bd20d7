//! Host-wide configuration model.
//!
//! Everything here describes the host side: where the bridge lives, which
//! proxy binary to spawn, which capabilities a strict profile insists on.
//! Per-container gateway configuration is a separate, JSON-element based
//! model handled by the gateway crate.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Error, Result};
use crate::types::Capability;

/// Root configuration for a capgate host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HostConfig {
    /// Base directory for per-container gateway directories.
    pub data_dir: PathBuf,
    /// Network settings shared by every container on this host.
    pub network: NetworkSettings,
    /// Message bus proxy settings.
    pub dbus: DBusSettings,
    /// Capabilities that must have an enabled element (strict profile).
    pub mandatory: Vec<Capability>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(constants::DEFAULT_DATA_DIR),
            network: NetworkSettings::default(),
            dbus: DBusSettings::default(),
            mandatory: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Loads a host configuration from a JSON file.
    ///
    /// Missing keys take their default values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config = serde_json::from_str(&content)?;
        tracing::debug!(path = %path.display(), "host configuration loaded");
        Ok(config)
    }

    /// Returns the gateway directory of the given container on the host.
    #[must_use]
    pub fn gateway_dir(&self, container: &str) -> PathBuf {
        self.data_dir.join(container).join("gateways")
    }
}

/// Host network settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NetworkSettings {
    /// Bridge device the host ends of the veth pairs are attached to.
    pub bridge: String,
    /// Address of the bridge; used as default route inside containers.
    pub gateway: Ipv4Addr,
    /// Prefix length of the container subnet.
    pub prefix_len: u8,
    /// Host firewall chain the container rules are inserted into.
    pub chain: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bridge: constants::DEFAULT_BRIDGE.to_string(),
            gateway: Ipv4Addr::from(constants::DEFAULT_GATEWAY),
            prefix_len: constants::DEFAULT_PREFIX_LEN,
            chain: constants::DEFAULT_FIREWALL_CHAIN.to_string(),
        }
    }
}

/// Message bus proxy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DBusSettings {
    /// Proxy binary, looked up in `PATH` when relative.
    pub proxy_binary: String,
    /// Milliseconds to wait for the proxy socket.
    pub socket_timeout_ms: u64,
}

impl Default for DBusSettings {
    fn default() -> Self {
        Self {
            proxy_binary: constants::DBUS_PROXY_BINARY.to_string(),
            socket_timeout_ms: constants::DBUS_SOCKET_TIMEOUT_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_the_standard_bridge() {
        let config = HostConfig::default();
        assert_eq!(config.network.bridge, "capgate0");
        assert_eq!(config.network.gateway, Ipv4Addr::new(10, 0, 3, 1));
        assert_eq!(config.network.prefix_len, 24);
        assert!(config.mandatory.is_empty());
    }

    #[test]
    fn load_fills_missing_keys_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.json");
        std::fs::write(
            &path,
            r#"{ "network": { "bridge": "br-test", "prefix-len": 28 }, "mandatory": ["network"] }"#,
        )
        .unwrap();

        let config = HostConfig::load(&path).unwrap();
        assert_eq!(config.network.bridge, "br-test");
        assert_eq!(config.network.prefix_len, 28);
        assert_eq!(config.network.chain, "FORWARD");
        assert_eq!(config.mandatory, vec![Capability::Network]);
        assert_eq!(config.dbus.proxy_binary, "dbus-proxy");
    }

    #[test]
    fn load_rejects_unknown_mandatory_capability() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.json");
        std::fs::write(&path, r#"{ "mandatory": ["teleport"] }"#).unwrap();
        assert!(HostConfig::load(&path).unwrap_err().is_config());
    }

    #[test]
    fn gateway_dir_is_scoped_per_container() {
        let config = HostConfig::default();
        assert_eq!(
            config.gateway_dir("c1"),
            PathBuf::from("/var/lib/capgate/c1/gateways")
        );
    }
}
