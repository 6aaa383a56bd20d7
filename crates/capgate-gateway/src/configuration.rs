//! Per-container gateway configuration.
//!
//! A configuration document maps capability ids to lists of elements:
//!
//! ```json
//! { "env":     [ { "name": "LANG", "value": "C" } ],
//!   "network": [ { "direction": "OUTGOING", "allow": [], "enabled": false } ] }
//! ```
//!
//! Elements with `"enabled": false` are dropped before routing; an element
//! without the key is enabled.

use std::collections::BTreeMap;

use serde_json::Value;

use capgate_common::config::HostConfig;
use capgate_common::error::{ConfigError, Result};
use capgate_common::types::Capability;

use crate::set::GatewaySet;

const ENABLED: &str = "enabled";

/// Capabilities a container must be configured with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    mandatory: Vec<Capability>,
}

impl Profile {
    /// A profile without mandatory capabilities.
    #[must_use]
    pub fn permissive() -> Self {
        Self::default()
    }

    /// A profile that insists on an enabled element for each capability.
    #[must_use]
    pub fn strict(mandatory: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            mandatory: mandatory.into_iter().collect(),
        }
    }

    /// The profile described by the host configuration.
    #[must_use]
    pub fn from_config(config: &HostConfig) -> Self {
        Self::strict(config.mandatory.iter().copied())
    }

    /// Mandatory capabilities.
    #[must_use]
    pub fn mandatory(&self) -> &[Capability] {
        &self.mandatory
    }
}

/// Configuration elements grouped by capability id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfiguration {
    elements: BTreeMap<String, Vec<Value>>,
}

impl GatewayConfiguration {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration document.
    ///
    /// Ids are not checked here; unknown ids are reported by
    /// [`GatewayConfiguration::apply`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for invalid JSON and
    /// [`ConfigError::Malformed`] if the document is not an object of
    /// arrays.
    pub fn from_json(text: &str) -> std::result::Result<Self, ConfigError> {
        let document: Value = serde_json::from_str(text)?;
        let map = match document {
            Value::Object(map) => map,
            other => {
                return Err(ConfigError::malformed(
                    "configuration",
                    format!("document is not an object: {other}"),
                ));
            }
        };
        let mut config = Self::new();
        for (id, value) in map {
            let items = match value {
                Value::Array(items) => items,
                other => {
                    return Err(ConfigError::malformed(
                        id,
                        format!("elements are not an array: {other}"),
                    ));
                }
            };
            config.append(&id, items);
        }
        Ok(config)
    }

    /// Adds elements for `id` after any already present.
    pub fn append(&mut self, id: &str, elements: impl IntoIterator<Item = Value>) {
        self.elements
            .entry(id.to_string())
            .or_default()
            .extend(elements);
    }

    /// Adds every element of `other`, keeping the order within each id.
    pub fn merge(&mut self, other: Self) {
        for (id, elements) in other.elements {
            self.append(&id, elements);
        }
    }

    /// Capability ids with at least one element, enabled or not.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.elements.keys().map(String::as_str)
    }

    /// All elements configured for `id`.
    #[must_use]
    pub fn elements(&self, id: &str) -> &[Value] {
        self.elements.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns `true` if no element is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.values().all(Vec::is_empty)
    }

    /// Enabled elements per capability, in activation order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownCapability`] for an id no gateway
    /// handles and [`ConfigError::Malformed`] for a non-object element or
    /// a non-boolean `enabled`.
    pub fn enabled(&self) -> std::result::Result<BTreeMap<Capability, Vec<Value>>, ConfigError> {
        let mut routed = BTreeMap::new();
        for (id, elements) in &self.elements {
            let capability: Capability = id.parse()?;
            let mut kept = Vec::new();
            for element in elements {
                if is_enabled(capability, element)? {
                    kept.push(element.clone());
                }
            }
            if !kept.is_empty() {
                let _previous = routed.insert(capability, kept);
            }
        }
        Ok(routed)
    }

    /// Enabled elements per capability, checked against `profile`.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`GatewayConfiguration::enabled`] and
    /// [`ConfigError::MissingMandatory`] when `profile` requires a
    /// capability without enabled elements.
    pub fn route(
        &self,
        profile: &Profile,
    ) -> std::result::Result<BTreeMap<Capability, Vec<Value>>, ConfigError> {
        let routed = self.enabled()?;
        if let Some(missing) = profile
            .mandatory()
            .iter()
            .find(|c| !routed.contains_key(*c))
        {
            return Err(ConfigError::MissingMandatory {
                id: missing.to_string(),
            });
        }
        Ok(routed)
    }

    /// Configures the gateways of `set` with the enabled elements.
    ///
    /// The whole document is routed and parsed before any gateway is
    /// configured. On error no gateway of `set` has changed.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`GatewayConfiguration::route`] or the first
    /// gateway configuration error.
    pub fn apply(&self, set: &mut GatewaySet, profile: &Profile) -> Result<()> {
        let routed = self.route(profile)?;
        set.configure_all(&routed)?;
        tracing::info!(
            container = %set.container().id(),
            gateways = routed.len(),
            "configuration applied"
        );
        Ok(())
    }
}

fn is_enabled(capability: Capability, element: &Value) -> std::result::Result<bool, ConfigError> {
    let Value::Object(fields) = element else {
        return Err(ConfigError::malformed(
            capability.as_str(),
            format!("element is not an object: {element}"),
        ));
    };
    match fields.get(ENABLED) {
        None => Ok(true),
        Some(Value::Bool(enabled)) => Ok(*enabled),
        Some(other) => Err(ConfigError::malformed(
            capability.as_str(),
            format!("\"{ENABLED}\" is not a boolean: {other}"),
        )),
    }
}
