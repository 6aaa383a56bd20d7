//! Domain primitive types used across the capgate workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a gateway.
///
/// States only move forward. A gateway that must be reset is dropped and a
/// new one is created in its place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GatewayState {
    /// The gateway object exists but holds no configuration.
    Created,
    /// Configuration was parsed; the gateway is ready for activation.
    Configured,
    /// Host-side mutations were applied.
    Activated,
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Configured => write!(f, "configured"),
            Self::Activated => write!(f, "activated"),
        }
    }
}

/// Resource category mediated by one gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Capability {
    /// Resource limits written to the container's cgroup.
    Cgroups,
    /// Network interface, address and firewall rules.
    Network,
    /// Device nodes inside the container.
    DeviceNode,
    /// Host files and directories mounted into the container.
    File,
    /// Filtered session and system message bus proxies.
    DBus,
    /// Audio server socket.
    PulseAudio,
    /// Display server socket.
    Wayland,
    /// Process environment variables.
    Environment,
}

impl Capability {
    /// All capabilities in activation order.
    ///
    /// Cgroups and network come first since they shape the namespaces the
    /// later gateways work in. Teardown runs in the reverse order.
    pub const ACTIVATION_ORDER: [Self; 8] = [
        Self::Cgroups,
        Self::Network,
        Self::DeviceNode,
        Self::File,
        Self::DBus,
        Self::PulseAudio,
        Self::Wayland,
        Self::Environment,
    ];

    /// Returns the capability id used in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cgroups => "cgroups",
            Self::Network => "network",
            Self::DeviceNode => "devicenode",
            Self::File => "file",
            Self::DBus => "dbus",
            Self::PulseAudio => "pulseaudio",
            Self::Wayland => "wayland",
            Self::Environment => "env",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ACTIVATION_ORDER
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownCapability { id: s.to_string() })
    }
}

impl TryFrom<String> for Capability {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_ids_round_trip_through_from_str() {
        for cap in Capability::ACTIVATION_ORDER {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
    }

    #[test]
    fn unknown_capability_is_rejected() {
        let err = "bluetooth".parse::<Capability>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownCapability { id } if id == "bluetooth"));
    }

    #[test]
    fn cgroups_and_network_activate_first() {
        assert_eq!(Capability::ACTIVATION_ORDER[0], Capability::Cgroups);
        assert_eq!(Capability::ACTIVATION_ORDER[1], Capability::Network);
    }

    #[test]
    fn gateway_states_are_ordered_forward() {
        assert!(GatewayState::Created < GatewayState::Configured);
        assert!(GatewayState::Configured < GatewayState::Activated);
        assert_eq!(GatewayState::Activated.to_string(), "activated");
    }

    #[test]
    fn capability_deserializes_from_id() {
        let caps: Vec<Capability> = serde_json::from_str(r#"["network", "env"]"#).unwrap();
        assert_eq!(caps, vec![Capability::Network, Capability::Environment]);
    }
}
