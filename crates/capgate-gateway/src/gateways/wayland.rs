//! Display gateway.
//!
//! Any element, for example `{ "enabled": true }`, shares the host's
//! Wayland compositor socket with the container.

use serde_json::Value;

use capgate_common::constants::GATEWAY_MOUNT_POINT;
use capgate_common::error::{ConfigError, Result};

use crate::element::Element;
use crate::gateway::Activation;

const ID: &str = "wayland";
const RUNTIME_DIR_VAR: &str = "XDG_RUNTIME_DIR";
const DISPLAY_VAR: &str = "WAYLAND_DISPLAY";
const DEFAULT_DISPLAY: &str = "wayland-0";

/// Whether the display socket is shared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaylandGateway {
    enabled: bool,
}

impl WaylandGateway {
    /// Returns `true` once any element was configured.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn read_element(&mut self, value: &Value) -> std::result::Result<(), ConfigError> {
        let _element = Element::new(ID, value)?;
        self.enabled = true;
        Ok(())
    }

    pub(crate) fn activate(&mut self, act: &mut Activation<'_>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let host = act.host;
        let Some(runtime_dir) = host.env.get(RUNTIME_DIR_VAR) else {
            return Err(act.error(format!("{RUNTIME_DIR_VAR} is not set on the host")));
        };
        let socket_name = host.env.get(DISPLAY_VAR).unwrap_or(DEFAULT_DISPLAY);
        let socket = std::path::Path::new(runtime_dir).join(socket_name);
        if !socket.exists() {
            return Err(act.error(format!("display socket {} does not exist", socket.display())));
        }
        let _shared = act.share_file(&socket, socket_name, false)?;
        act.set_env(RUNTIME_DIR_VAR, GATEWAY_MOUNT_POINT)?;
        act.set_env(DISPLAY_VAR, socket_name)?;
        tracing::info!(
            container = %act.container.id(),
            display = %socket_name,
            "display socket shared"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn any_object_enables_the_gateway() {
        let mut gateway = WaylandGateway::default();
        assert!(!gateway.enabled());
        gateway.read_element(&json!({})).unwrap();
        assert!(gateway.enabled());
    }

    #[test]
    fn non_objects_are_rejected() {
        let mut gateway = WaylandGateway::default();
        assert!(gateway.read_element(&json!("on")).is_err());
        assert!(!gateway.enabled());
    }
}
