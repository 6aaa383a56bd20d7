//! Container address pool.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use capgate_common::error::{NetworkError, Result};

/// Hands out host addresses of the container subnet.
///
/// The network address, the broadcast address and the gateway are never
/// handed out. Allocation always returns the lowest free address, so equal
/// pool state yields equal addresses.
#[derive(Debug, Clone)]
pub struct AddressPool {
    network: Ipv4Network,
    gateway: Ipv4Addr,
    allocated: BTreeSet<Ipv4Addr>,
}

impl AddressPool {
    /// Creates a pool for the subnet the gateway address lives in.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix is invalid or leaves no room for
    /// container addresses.
    pub fn new(gateway: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        let network = Ipv4Network::new(gateway, prefix_len)
            .and_then(|n| Ipv4Network::new(n.network(), prefix_len))
            .map_err(|e| NetworkError::Settings {
                message: format!("{gateway}/{prefix_len}: {e}"),
            })?;
        if prefix_len > 30 {
            return Err(NetworkError::Settings {
                message: format!("/{prefix_len} leaves no container addresses"),
            }
            .into());
        }
        Ok(Self {
            network,
            gateway,
            allocated: BTreeSet::new(),
        })
    }

    /// Subnet served by the pool.
    #[must_use]
    pub const fn network(&self) -> Ipv4Network {
        self.network
    }

    /// Gateway address of the subnet.
    #[must_use]
    pub const fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// Total number of addresses the pool can hand out.
    #[must_use]
    pub fn capacity(&self) -> usize {
        let hosts = (1_u64 << (32 - u32::from(self.network.prefix()))) - 2;
        let reserved = u64::from(self.is_host_address(self.gateway));
        usize::try_from(hosts - reserved).unwrap_or(usize::MAX)
    }

    /// Number of addresses currently handed out.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated.len()
    }

    /// Number of addresses still free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.allocated())
    }

    /// Allocates the lowest free address.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::PoolExhausted`] when every address is taken.
    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        let address = self
            .candidates()
            .find(|a| !self.allocated.contains(a))
            .ok_or_else(|| NetworkError::PoolExhausted {
                subnet: self.network.to_string(),
            })?;
        let _inserted = self.allocated.insert(address);
        tracing::debug!(address = %address, subnet = %self.network, "address allocated");
        Ok(address)
    }

    /// Returns an address to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::NotAllocated`] if the address is not
    /// currently handed out.
    pub fn release(&mut self, address: Ipv4Addr) -> Result<()> {
        if self.allocated.remove(&address) {
            tracing::debug!(address = %address, subnet = %self.network, "address released");
            Ok(())
        } else {
            Err(NetworkError::NotAllocated {
                address: address.to_string(),
                subnet: self.network.to_string(),
            }
            .into())
        }
    }

    fn is_host_address(&self, address: Ipv4Addr) -> bool {
        address != self.network.network() && address != self.network.broadcast()
    }

    fn candidates(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.network
            .iter()
            .filter(move |a| self.is_host_address(*a) && *a != self.gateway)
    }
}
