//! Typed field access on JSON configuration elements.

use serde_json::{Map, Value};

use capgate_common::error::ConfigError;

/// A configuration element bound to the capability it belongs to, so every
/// error names the gateway.
pub(crate) struct Element<'a> {
    capability: &'static str,
    fields: &'a Map<String, Value>,
}

impl<'a> Element<'a> {
    pub(crate) fn new(capability: &'static str, value: &'a Value) -> Result<Self, ConfigError> {
        let fields = value.as_object().ok_or_else(|| {
            ConfigError::malformed(capability, format!("element is not an object: {value}"))
        })?;
        Ok(Self { capability, fields })
    }

    pub(crate) fn has(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub(crate) fn get(&self, field: &str) -> Option<&'a Value> {
        self.fields.get(field)
    }

    pub(crate) fn malformed(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::malformed(self.capability, message)
    }

    /// Required string field. Empty strings count as missing.
    pub(crate) fn string(&self, field: &'static str) -> Result<String, ConfigError> {
        match self.optional_string(field)? {
            Some(s) if !s.is_empty() => Ok(s),
            Some(_) => Err(self.malformed(format!("\"{field}\" is empty"))),
            None => Err(ConfigError::missing(self.capability, field)),
        }
    }

    pub(crate) fn optional_string(&self, field: &str) -> Result<Option<String>, ConfigError> {
        match self.fields.get(field) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.malformed(format!("\"{field}\" is not a string: {other}"))),
        }
    }

    pub(crate) fn bool(&self, field: &'static str) -> Result<bool, ConfigError> {
        self.optional_bool(field)?
            .ok_or_else(|| ConfigError::missing(self.capability, field))
    }

    pub(crate) fn optional_bool(&self, field: &str) -> Result<Option<bool>, ConfigError> {
        match self.fields.get(field) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(self.malformed(format!("\"{field}\" is not a boolean: {other}"))),
        }
    }

    pub(crate) fn array(&self, field: &'static str) -> Result<&'a Vec<Value>, ConfigError> {
        match self.fields.get(field) {
            None => Err(ConfigError::missing(self.capability, field)),
            Some(Value::Array(items)) => Ok(items),
            Some(other) => Err(self.malformed(format!("\"{field}\" is not an array: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn non_objects_are_malformed() {
        assert!(matches!(
            Element::new("env", &json!([1, 2])),
            Err(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn empty_required_strings_are_rejected() {
        let value = json!({ "name": "", "value": 3 });
        let element = Element::new("env", &value).unwrap();
        assert!(matches!(
            element.string("name"),
            Err(ConfigError::Malformed { .. })
        ));
        assert!(matches!(
            element.string("value"),
            Err(ConfigError::Malformed { .. })
        ));
        assert!(matches!(
            element.string("other"),
            Err(ConfigError::MissingField { field: "other", .. })
        ));
    }

    #[test]
    fn optional_bool_distinguishes_absent_from_wrong_type() {
        let value = json!({ "read-only": "yes" });
        let element = Element::new("file", &value).unwrap();
        assert!(element.optional_bool("create-symlink").unwrap().is_none());
        assert!(element.optional_bool("read-only").is_err());
    }
}
