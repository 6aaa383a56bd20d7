//! Host-side context shared by the gateways of every container.
//!
//! The address pool and the firewall chain are the only mutable state
//! that crosses container boundaries. [`HostNetwork`] owns both, each
//! behind its own lock, and is shared through an `Arc`.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use capgate_common::config::{HostConfig, NetworkSettings};
use capgate_common::error::{NetworkError, Result};
use capgate_core::network::iptables::Firewall;
use capgate_core::network::netlink::Netlink;
use capgate_core::network::pool::AddressPool;

/// Snapshot of the host process environment.
///
/// Gateways that forward host services (message bus, audio, display)
/// read their socket locations from here instead of the live process
/// environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEnv {
    vars: BTreeMap<String, String>,
}

impl HostEnv {
    /// Captures the environment of the current process.
    #[must_use]
    pub fn capture() -> Self {
        std::env::vars().collect()
    }

    /// Returns the value of `name`, if set.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Sets `name`, replacing any earlier value.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let _previous = self.vars.insert(name.into(), value.into());
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HostEnv {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Network resources shared by every container on the host.
pub struct HostNetwork {
    settings: NetworkSettings,
    pool: Mutex<AddressPool>,
    firewall: Mutex<Box<dyn Firewall>>,
    netlink: Arc<dyn Netlink>,
}

impl std::fmt::Debug for HostNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostNetwork")
            .field("settings", &self.settings)
            .field("pool", &*self.pool.lock())
            .finish_non_exhaustive()
    }
}

impl HostNetwork {
    /// Creates the shared network state with the given backends.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings do not describe a usable subnet.
    pub fn new(
        settings: NetworkSettings,
        firewall: Box<dyn Firewall>,
        netlink: Arc<dyn Netlink>,
    ) -> Result<Self> {
        let pool = AddressPool::new(settings.gateway, settings.prefix_len)?;
        tracing::info!(
            bridge = %settings.bridge,
            subnet = %pool.network(),
            capacity = pool.capacity(),
            "host network initialized"
        );
        Ok(Self {
            settings,
            pool: Mutex::new(pool),
            firewall: Mutex::new(firewall),
            netlink,
        })
    }

    /// Creates the shared network state backed by `iptables` and
    /// `rtnetlink`.
    ///
    /// # Errors
    ///
    /// Returns an error if `iptables` is missing or the settings are
    /// invalid.
    #[cfg(target_os = "linux")]
    pub fn system(settings: NetworkSettings) -> Result<Self> {
        use capgate_core::network::iptables::IptablesFirewall;
        use capgate_core::network::netlink::RtNetlink;

        let firewall = IptablesFirewall::locate()?;
        Self::new(settings, Box::new(firewall), Arc::new(RtNetlink::new()))
    }

    /// Network settings in effect.
    #[must_use]
    pub const fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    /// Netlink backend.
    #[must_use]
    pub fn netlink(&self) -> Arc<dyn Netlink> {
        Arc::clone(&self.netlink)
    }

    /// Checks that the bridge exists and carries the gateway address.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BridgeUnavailable`] otherwise.
    pub fn check_bridge(&self) -> Result<()> {
        if self
            .netlink
            .has_address(&self.settings.bridge, self.settings.gateway)?
        {
            Ok(())
        } else {
            Err(NetworkError::BridgeUnavailable {
                bridge: self.settings.bridge.clone(),
                gateway: self.settings.gateway.to_string(),
            }
            .into())
        }
    }

    /// Allocates a container address.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::PoolExhausted`] when no address is free.
    pub fn allocate(&self) -> Result<Ipv4Addr> {
        self.pool.lock().allocate()
    }

    /// Returns a container address to the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the address was not allocated.
    pub fn release(&self, address: Ipv4Addr) -> Result<()> {
        self.pool.lock().release(address)
    }

    /// Number of addresses currently handed out.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.pool.lock().allocated()
    }

    /// Number of addresses still free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.pool.lock().available()
    }

    /// Locks the firewall. Hold the guard across a batch of insertions so
    /// the rule positions of one container stay contiguous.
    pub fn firewall(&self) -> MutexGuard<'_, Box<dyn Firewall>> {
        self.firewall.lock()
    }
}

/// Everything a gateway may need from the host.
#[derive(Debug, Clone, Default)]
pub struct HostContext {
    /// Host configuration.
    pub config: HostConfig,
    /// Host environment snapshot.
    pub env: HostEnv,
    /// Shared network state; `None` when networking is unavailable.
    pub network: Option<Arc<HostNetwork>>,
}

impl HostContext {
    /// Creates a context without networking.
    #[must_use]
    pub const fn new(config: HostConfig, env: HostEnv) -> Self {
        Self {
            config,
            env,
            network: None,
        }
    }

    /// Attaches shared network state.
    #[must_use]
    pub fn with_network(mut self, network: Arc<HostNetwork>) -> Self {
        self.network = Some(network);
        self
    }
}
