//! Resource limit gateway.
//!
//! Elements look like `{ "setting": "memory.limit_in_bytes", "value": "100m" }`.
//! Values are validated while configuring, so a bad limit never reaches
//! activation.

use serde_json::Value;

use capgate_common::error::{ConfigError, Result};
use capgate_core::cgroup::limits::parse_limit;

use crate::element::Element;
use crate::gateway::Activation;

const ID: &str = "cgroups";

/// Ordered controller settings for the container's cgroup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupsGateway {
    settings: Vec<(String, String)>,
}

impl CgroupsGateway {
    /// Configured `(setting, value)` pairs, in configuration order.
    #[must_use]
    pub fn settings(&self) -> &[(String, String)] {
        &self.settings
    }

    pub(crate) fn read_element(&mut self, value: &Value) -> std::result::Result<(), ConfigError> {
        let element = Element::new(ID, value)?;
        let setting = element.string("setting")?;
        let token = match element.get("value") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(element.malformed(format!("\"value\" is not a string: {other}")));
            }
            None => return Err(ConfigError::missing(ID, "value")),
        };
        let _normalized = parse_limit(&setting, &token)?;
        self.settings.push((setting, token));
        Ok(())
    }

    pub(crate) fn activate(&mut self, act: &mut Activation<'_>) -> Result<()> {
        let cgroup = act.container.cgroups()?;
        for (setting, value) in &self.settings {
            cgroup.set_item(setting, value)?;
        }
        tracing::info!(
            container = %act.container.id(),
            root = %cgroup.root().display(),
            count = self.settings.len(),
            "cgroup limits applied"
        );
        Ok(())
    }
}
