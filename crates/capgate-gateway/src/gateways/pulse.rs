//! Audio gateway.
//!
//! `{ "audio": true }` shares the host's `PulseAudio` socket with the
//! container. The last element wins.

use std::path::Path;

use serde_json::Value;

use capgate_common::error::{ConfigError, Result};

use crate::element::Element;
use crate::gateway::Activation;

const ID: &str = "pulseaudio";
const SERVER_VAR: &str = "PULSE_SERVER";
const SOCKET_NAME: &str = "pulse-socket";

/// Whether audio is passed through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PulseGateway {
    audio: bool,
}

impl PulseGateway {
    /// Returns `true` if the socket is shared on activation.
    #[must_use]
    pub const fn audio(&self) -> bool {
        self.audio
    }

    pub(crate) fn read_element(&mut self, value: &Value) -> std::result::Result<(), ConfigError> {
        let element = Element::new(ID, value)?;
        self.audio = element.bool("audio")?;
        Ok(())
    }

    pub(crate) fn activate(&mut self, act: &mut Activation<'_>) -> Result<()> {
        if !self.audio {
            tracing::debug!(container = %act.container.id(), "audio disabled");
            return Ok(());
        }
        let host = act.host;
        let Some(server) = host.env.get(SERVER_VAR) else {
            return Err(act.error(format!("{SERVER_VAR} is not set on the host")));
        };
        let socket = Path::new(server.strip_prefix("unix:").unwrap_or(server));
        if !socket.exists() {
            return Err(act.error(format!("audio socket {} does not exist", socket.display())));
        }
        let shared = act.share_file(socket, SOCKET_NAME, false)?;
        act.set_env(SERVER_VAR, &format!("unix:{}", shared.display()))?;
        tracing::info!(container = %act.container.id(), "audio socket shared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn last_element_wins() {
        let mut gateway = PulseGateway::default();
        gateway.read_element(&json!({ "audio": true })).unwrap();
        gateway.read_element(&json!({ "audio": false })).unwrap();
        assert!(!gateway.audio());
    }

    #[test]
    fn audio_flag_is_required() {
        let mut gateway = PulseGateway::default();
        assert!(matches!(
            gateway.read_element(&json!({})),
            Err(ConfigError::MissingField { field: "audio", .. })
        ));
        assert!(gateway.read_element(&json!({ "audio": "yes" })).is_err());
    }
}
