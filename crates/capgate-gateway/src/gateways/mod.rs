//! Concrete gateways, one per capability.
//!
//! Each gateway parses its own configuration elements and knows how to
//! apply them. [`GatewayKind`] dispatches between them.

pub mod cgroups;
pub mod dbus;
pub mod devicenode;
pub mod environment;
pub mod file;
pub mod network;
pub mod pulse;
pub mod wayland;

use serde_json::Value;

use capgate_common::error::{ConfigError, Result};
use capgate_common::types::Capability;

use crate::gateway::Activation;

pub use cgroups::CgroupsGateway;
pub use dbus::DBusGateway;
pub use devicenode::DeviceNodeGateway;
pub use environment::EnvironmentGateway;
pub use file::FileGateway;
pub use network::NetworkGateway;
pub use pulse::PulseGateway;
pub use wayland::WaylandGateway;

/// Parsed configuration of one gateway, tagged by capability.
#[derive(Debug, Clone)]
pub enum GatewayKind {
    /// Resource limits.
    Cgroups(CgroupsGateway),
    /// Network interface and firewall.
    Network(NetworkGateway),
    /// Device nodes.
    DeviceNode(DeviceNodeGateway),
    /// Host files.
    File(FileGateway),
    /// Message bus proxies.
    DBus(DBusGateway),
    /// Audio socket.
    PulseAudio(PulseGateway),
    /// Display socket.
    Wayland(WaylandGateway),
    /// Environment variables.
    Environment(EnvironmentGateway),
}

impl GatewayKind {
    /// Creates an unconfigured gateway for `capability`.
    #[must_use]
    pub fn new(capability: Capability) -> Self {
        match capability {
            Capability::Cgroups => Self::Cgroups(CgroupsGateway::default()),
            Capability::Network => Self::Network(NetworkGateway::default()),
            Capability::DeviceNode => Self::DeviceNode(DeviceNodeGateway::default()),
            Capability::File => Self::File(FileGateway::default()),
            Capability::DBus => Self::DBus(DBusGateway::default()),
            Capability::PulseAudio => Self::PulseAudio(PulseGateway::default()),
            Capability::Wayland => Self::Wayland(WaylandGateway::default()),
            Capability::Environment => Self::Environment(EnvironmentGateway::default()),
        }
    }

    /// Capability handled by this gateway.
    #[must_use]
    pub const fn capability(&self) -> Capability {
        match self {
            Self::Cgroups(_) => Capability::Cgroups,
            Self::Network(_) => Capability::Network,
            Self::DeviceNode(_) => Capability::DeviceNode,
            Self::File(_) => Capability::File,
            Self::DBus(_) => Capability::DBus,
            Self::PulseAudio(_) => Capability::PulseAudio,
            Self::Wayland(_) => Capability::Wayland,
            Self::Environment(_) => Capability::Environment,
        }
    }

    pub(crate) fn read_element(
        &mut self,
        element: &Value,
    ) -> std::result::Result<(), ConfigError> {
        match self {
            Self::Cgroups(g) => g.read_element(element),
            Self::Network(g) => g.read_element(element),
            Self::DeviceNode(g) => g.read_element(element),
            Self::File(g) => g.read_element(element),
            Self::DBus(g) => g.read_element(element),
            Self::PulseAudio(g) => g.read_element(element),
            Self::Wayland(g) => g.read_element(element),
            Self::Environment(g) => g.read_element(element),
        }
    }

    pub(crate) fn activate(&mut self, activation: &mut Activation<'_>) -> Result<()> {
        match self {
            Self::Cgroups(g) => g.activate(activation),
            Self::Network(g) => g.activate(activation),
            Self::DeviceNode(g) => g.activate(activation),
            Self::File(g) => g.activate(activation),
            Self::DBus(g) => g.activate(activation),
            Self::PulseAudio(g) => g.activate(activation),
            Self::Wayland(g) => g.activate(activation),
            Self::Environment(g) => g.activate(activation),
        }
    }
}
