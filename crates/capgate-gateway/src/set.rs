//! All gateways of one container.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

use serde_json::Value;

use capgate_common::error::{Error, Result};
use capgate_common::types::Capability;

use crate::container::ContainerHandle;
use crate::gateway::Gateway;
use crate::host::HostContext;

/// One gateway per capability, bound to a single container.
///
/// Gateways are activated in [`Capability::ACTIVATION_ORDER`] and torn
/// down in the reverse order.
pub struct GatewaySet {
    container: Arc<dyn ContainerHandle>,
    host: Arc<HostContext>,
    gateways: BTreeMap<Capability, Gateway>,
}

impl std::fmt::Debug for GatewaySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySet")
            .field("container", self.container.id())
            .field("gateways", &self.gateways)
            .finish_non_exhaustive()
    }
}

impl GatewaySet {
    /// Creates an empty set for `container`.
    #[must_use]
    pub fn new(container: Arc<dyn ContainerHandle>, host: Arc<HostContext>) -> Self {
        Self {
            container,
            host,
            gateways: BTreeMap::new(),
        }
    }

    /// The container every gateway of the set is bound to.
    #[must_use]
    pub const fn container(&self) -> &Arc<dyn ContainerHandle> {
        &self.container
    }

    /// Host context shared by the gateways.
    #[must_use]
    pub const fn host(&self) -> &Arc<HostContext> {
        &self.host
    }

    /// The gateway for `capability`, if one was created.
    #[must_use]
    pub fn gateway(&self, capability: Capability) -> Option<&Gateway> {
        self.gateways.get(&capability)
    }

    /// The gateway for `capability`, created and bound on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the new gateway cannot be bound.
    pub fn gateway_mut(&mut self, capability: Capability) -> Result<&mut Gateway> {
        match self.gateways.entry(capability) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let mut gateway = Gateway::new(capability, Arc::clone(&self.host));
                gateway.bind_container(Arc::clone(&self.container))?;
                Ok(entry.insert(gateway))
            }
        }
    }

    /// Gateways in activation order.
    pub fn gateways(&self) -> impl Iterator<Item = &Gateway> {
        self.gateways.values()
    }

    /// Number of gateways in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    /// Returns `true` if no gateway was created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    /// Configures the gateway for `capability`.
    ///
    /// # Errors
    ///
    /// Returns the gateway's configuration error.
    pub fn configure(&mut self, capability: Capability, elements: &[Value]) -> Result<()> {
        self.gateway_mut(capability)?.configure(elements)
    }

    /// Configures one gateway per routed capability, all or nothing.
    ///
    /// Every capability is parsed before any gateway is created or moved
    /// to `Configured`, so a malformed element leaves the set untouched.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error.
    pub fn configure_all(&mut self, routed: &BTreeMap<Capability, Vec<Value>>) -> Result<()> {
        let mut staged = Vec::with_capacity(routed.len());
        for (capability, elements) in routed {
            let kind = match self.gateways.get(capability) {
                Some(gateway) => gateway.stage(elements)?,
                None => Gateway::new(*capability, Arc::clone(&self.host)).stage(elements)?,
            };
            staged.push((*capability, kind, elements.len()));
        }
        for (capability, kind, elements) in staged {
            self.gateway_mut(capability)?.commit(kind, elements);
        }
        Ok(())
    }

    /// Activates every gateway in activation order.
    ///
    /// Stops at the first failure. Gateways activated before it stay
    /// active until [`GatewaySet::teardown`].
    ///
    /// # Errors
    ///
    /// Returns the error of the failing gateway.
    pub fn activate(&mut self) -> Result<()> {
        for gateway in self.gateways.values_mut() {
            gateway.activate()?;
        }
        tracing::info!(
            container = %self.container.id(),
            gateways = self.gateways.len(),
            "all gateways activated"
        );
        Ok(())
    }

    /// Tears down every gateway in reverse activation order.
    ///
    /// Every gateway is torn down even if an earlier one failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TeardownIncomplete`] with the failures of all
    /// gateways.
    pub fn teardown(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for gateway in self.gateways.values_mut().rev() {
            match gateway.teardown() {
                Ok(()) => {}
                Err(Error::TeardownIncomplete { failures: inner }) => {
                    failures.extend(inner.into_iter().map(|f| format!("{}: {f}", gateway.id())));
                }
                Err(e) => failures.push(format!("{}: {e}", gateway.id())),
            }
        }
        if failures.is_empty() {
            tracing::info!(container = %self.container.id(), "all gateways torn down");
            Ok(())
        } else {
            Err(Error::TeardownIncomplete { failures })
        }
    }
}
