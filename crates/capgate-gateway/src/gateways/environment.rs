//! Environment variable gateway.
//!
//! Elements look like `{ "name": "PATH", "value": ":/opt/bin", "append": true }`.
//! Defining a variable twice is an error unless the later element sets
//! `append`, which concatenates onto the earlier value.

use serde_json::Value;

use capgate_common::error::{ConfigError, Result};

use crate::element::Element;
use crate::gateway::Activation;

const ID: &str = "env";

/// One exported variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Configured value.
    pub value: String,
    /// Whether the value is appended to a value the container already has.
    pub append: bool,
}

/// Variables exported into the container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentGateway {
    vars: Vec<EnvVar>,
}

impl EnvironmentGateway {
    /// Configured variables, in first-definition order.
    #[must_use]
    pub fn vars(&self) -> &[EnvVar] {
        &self.vars
    }

    pub(crate) fn read_element(&mut self, value: &Value) -> std::result::Result<(), ConfigError> {
        let element = Element::new(ID, value)?;
        let name = element.string("name")?;
        let value = element.string("value")?;
        let append = element.optional_bool("append")?.unwrap_or(false);

        match self.vars.iter_mut().find(|v| v.name == name) {
            Some(existing) if append => existing.value.push_str(&value),
            Some(_) => {
                return Err(element.malformed(format!(
                    "\"{name}\" is already defined; set \"append\" to extend it"
                )));
            }
            None => self.vars.push(EnvVar {
                name,
                value,
                append,
            }),
        }
        Ok(())
    }

    pub(crate) fn activate(&mut self, act: &mut Activation<'_>) -> Result<()> {
        for var in &self.vars {
            let value = match act.container.environment_variable(&var.name) {
                Some(current) if var.append => format!("{current}{}", var.value),
                _ => var.value.clone(),
            };
            act.set_env(&var.name, &value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn append_concatenates_onto_the_earlier_value() {
        let mut gateway = EnvironmentGateway::default();
        gateway
            .read_element(&json!({ "name": "PATH", "value": "/usr/bin" }))
            .unwrap();
        gateway
            .read_element(&json!({ "name": "PATH", "value": ":/opt/bin", "append": true }))
            .unwrap();
        assert_eq!(gateway.vars().len(), 1);
        assert_eq!(gateway.vars()[0].value, "/usr/bin:/opt/bin");
    }

    #[test]
    fn redefinition_without_append_is_rejected() {
        let mut gateway = EnvironmentGateway::default();
        gateway
            .read_element(&json!({ "name": "LANG", "value": "C" }))
            .unwrap();
        let err = gateway
            .read_element(&json!({ "name": "LANG", "value": "sv_SE" }))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
        assert_eq!(gateway.vars()[0].value, "C");
    }

    #[test]
    fn name_and_value_must_be_non_empty_strings() {
        let mut gateway = EnvironmentGateway::default();
        assert!(gateway.read_element(&json!({ "name": "", "value": "x" })).is_err());
        assert!(gateway.read_element(&json!({ "name": "A" })).is_err());
        assert!(gateway.read_element(&json!({ "name": "A", "value": 1 })).is_err());
    }
}
