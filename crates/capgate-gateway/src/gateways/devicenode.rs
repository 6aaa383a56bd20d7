//! Device node gateway.
//!
//! Elements look like `{ "name": "/dev/dri/card0" }` to pass a host node
//! through, or `{ "name": "/dev/fuse", "major": 10, "minor": 229, "mode": "666" }`
//! to create one from explicit numbers.
//!
//! Either way the container gets its own node in its root, so a configured
//! mode never changes the host's node.

use std::path::Path;

use serde_json::Value;

use capgate_common::error::{ConfigError, Result};
use capgate_core::filesystem;
use capgate_core::filesystem::device::{
    DeviceNumbers, device_numbers, make_node, merge_modes, parse_mode,
};

use crate::element::Element;
use crate::gateway::Activation;

const ID: &str = "devicenode";

/// One device made visible in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    /// Absolute device path, the same on the host and in the container.
    pub name: String,
    /// Character device numbers; `None` copies type and numbers from the
    /// host node of the same name.
    pub major_minor: Option<(u64, u64)>,
    /// Permission mode of the container's node; `None` keeps the host's.
    pub mode: Option<u32>,
}

/// Devices passed into the container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceNodeGateway {
    devices: Vec<DeviceNode>,
}

impl DeviceNodeGateway {
    /// Configured devices, in first-definition order.
    #[must_use]
    pub fn devices(&self) -> &[DeviceNode] {
        &self.devices
    }

    pub(crate) fn read_element(&mut self, value: &Value) -> std::result::Result<(), ConfigError> {
        let element = Element::new(ID, value)?;
        let name = element.string("name")?;
        if !name.starts_with('/') {
            return Err(element.malformed(format!("\"{name}\" is not an absolute path")));
        }

        let major_minor = match (element.get("major"), element.get("minor")) {
            (None, None) => None,
            (Some(major), Some(minor)) => Some((
                device_number(&element, "major", major)?,
                device_number(&element, "minor", minor)?,
            )),
            _ => {
                return Err(element.malformed(format!(
                    "\"{name}\": major and minor must be given together"
                )));
            }
        };
        let mode = match element.get("mode") {
            None => None,
            Some(v) => Some(permission_mode(&element, v)?),
        };
        if major_minor.is_some() && mode.is_none() {
            return Err(ConfigError::missing(ID, "mode"));
        }

        match self.devices.iter_mut().find(|d| d.name == name) {
            Some(existing) => {
                if existing.major_minor != major_minor {
                    return Err(element.malformed(format!(
                        "\"{name}\" is configured with different device numbers"
                    )));
                }
                existing.mode = match (existing.mode, mode) {
                    (Some(a), Some(b)) => Some(merge_modes(a, b)),
                    (a, b) => a.or(b),
                };
            }
            None => self.devices.push(DeviceNode {
                name,
                major_minor,
                mode,
            }),
        }
        Ok(())
    }

    pub(crate) fn activate(&mut self, act: &mut Activation<'_>) -> Result<()> {
        for device in &self.devices {
            let numbers = resolve(act, device)?;
            let target = act.rootfs_path(Path::new(&device.name));
            if let Some(parent) = target.parent() {
                filesystem::create_directory(act.log, parent)?;
            }
            make_node(act.log, &target, numbers)?;
            tracing::debug!(
                container = %act.container.id(),
                device = %device.name,
                mode = %format!("{:o}", numbers.mode),
                "device node added"
            );
        }
        Ok(())
    }
}

/// Type, numbers and mode of the node to create for `device`.
fn resolve(act: &Activation<'_>, device: &DeviceNode) -> Result<DeviceNumbers> {
    if let (Some((major, minor)), Some(mode)) = (device.major_minor, device.mode) {
        return Ok(DeviceNumbers {
            block: false,
            major,
            minor,
            mode,
        });
    }
    let host_path = Path::new(&device.name);
    if !host_path.exists() {
        return Err(act.error(format!("host device {} does not exist", device.name)));
    }
    let Some(host) = device_numbers(host_path)? else {
        return Err(act.error(format!("{} is not a device node", device.name)));
    };
    Ok(DeviceNumbers {
        mode: device.mode.unwrap_or(host.mode),
        ..host
    })
}

fn device_number(
    element: &Element<'_>,
    field: &str,
    value: &Value,
) -> std::result::Result<u64, ConfigError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        element.malformed(format!("\"{field}\" is not a device number: {value}"))
    })
}

fn permission_mode(element: &Element<'_>, value: &Value) -> std::result::Result<u32, ConfigError> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    };
    parse_mode(&text)
        .ok_or_else(|| element.malformed(format!("\"mode\" is not an octal mode: {value}")))
}
