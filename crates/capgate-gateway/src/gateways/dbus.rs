//! Message bus gateway.
//!
//! Elements carry allow-lists for either bus:
//!
//! ```json
//! { "dbus-gateway-config-session": [
//!     { "direction": "outgoing", "interface": "*", "object-path": "/", "method": "*" } ] }
//! ```
//!
//! For each bus with a configuration, activation starts one `dbus-proxy`
//! listening on a socket in the gateway directory, feeds it both
//! allow-lists on stdin, and points the container's bus address at it.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use capgate_common::constants::GATEWAY_MOUNT_POINT;
use capgate_common::error::{ConfigError, Error, Result};
use capgate_core::cleanup::UndoRecord;

use crate::element::Element;
use crate::gateway::Activation;

const ID: &str = "dbus";
const SESSION_CONFIG: &str = "dbus-gateway-config-session";
const SYSTEM_CONFIG: &str = "dbus-gateway-config-system";
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Which bus a proxy serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    /// The user session bus.
    Session,
    /// The system bus.
    System,
}

impl BusKind {
    /// Argument passed to the proxy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::System => "system",
        }
    }

    /// Environment variable holding the bus address.
    #[must_use]
    pub const fn address_var(self) -> &'static str {
        match self {
            Self::Session => "DBUS_SESSION_BUS_ADDRESS",
            Self::System => "DBUS_SYSTEM_BUS_ADDRESS",
        }
    }

    const fn socket_prefix(self) -> &'static str {
        match self {
            Self::Session => "sess",
            Self::System => "sys",
        }
    }
}

/// Accumulated allow-lists for both buses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DBusGateway {
    session: Vec<Value>,
    system: Vec<Value>,
    has_session: bool,
    has_system: bool,
}

impl DBusGateway {
    /// Session bus allow-list entries.
    #[must_use]
    pub fn session(&self) -> &[Value] {
        &self.session
    }

    /// System bus allow-list entries.
    #[must_use]
    pub fn system(&self) -> &[Value] {
        &self.system
    }

    /// Buses that get a proxy on activation.
    #[must_use]
    pub fn buses(&self) -> Vec<BusKind> {
        let mut buses = Vec::new();
        if self.has_session {
            buses.push(BusKind::Session);
        }
        if self.has_system {
            buses.push(BusKind::System);
        }
        buses
    }

    /// The document written to the proxy's stdin.
    #[must_use]
    pub fn proxy_config(&self) -> String {
        json!({ SESSION_CONFIG: self.session, SYSTEM_CONFIG: self.system }).to_string()
    }

    pub(crate) fn read_element(&mut self, value: &Value) -> std::result::Result<(), ConfigError> {
        let element = Element::new(ID, value)?;
        if !element.has(SESSION_CONFIG) && !element.has(SYSTEM_CONFIG) {
            return Err(element.malformed(format!(
                "neither \"{SESSION_CONFIG}\" nor \"{SYSTEM_CONFIG}\" is given"
            )));
        }
        if element.has(SESSION_CONFIG) {
            self.session.extend(element.array(SESSION_CONFIG)?.iter().cloned());
            self.has_session = true;
        }
        if element.has(SYSTEM_CONFIG) {
            self.system.extend(element.array(SYSTEM_CONFIG)?.iter().cloned());
            self.has_system = true;
        }
        Ok(())
    }

    pub(crate) fn activate(&mut self, act: &mut Activation<'_>) -> Result<()> {
        let config = self.proxy_config();
        for bus in self.buses() {
            start_proxy(act, bus, &config)?;
        }
        Ok(())
    }
}

// The child is reaped by the KillProcess undo record.
#[allow(clippy::zombie_processes)]
fn start_proxy(act: &mut Activation<'_>, bus: BusKind, config: &str) -> Result<()> {
    let address_var = bus.address_var();
    let host = act.host;
    let host_address = host.env.get(address_var);
    match (bus, host_address) {
        (BusKind::Session, None) => {
            return Err(act.error(format!("{address_var} is not set on the host")));
        }
        (BusKind::System, None) => {
            tracing::warn!(
                variable = address_var,
                "host bus address not set, the proxy uses its default"
            );
        }
        _ => {}
    }

    let settings = &host.config.dbus;
    let binary = which::which(&settings.proxy_binary)
        .map_err(|e| act.error(format!("{}: {e}", settings.proxy_binary)))?;
    let socket_name = format!("{}_{}.sock", bus.socket_prefix(), act.container.id());
    let socket = act.container.gateway_dir().join(&socket_name);

    let mut command = Command::new(&binary);
    let _ = command
        .arg(&socket)
        .arg(bus.as_str())
        .env_clear()
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(address) = host_address {
        let _ = command.env(address_var, address);
    }
    let mut child = command.spawn().map_err(|e| Error::io(&binary, e))?;
    let pid = child.id();
    act.log.push(UndoRecord::KillProcess { pid });
    tracing::debug!(pid, bus = bus.as_str(), socket = %socket.display(), "proxy started");

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| act.error("proxy stdin is not piped"))?;
    stdin
        .write_all(config.as_bytes())
        .map_err(|e| act.error(format!("writing proxy configuration: {e}")))?;
    drop(stdin);

    if !socket_appeared(&socket, Duration::from_millis(settings.socket_timeout_ms)) {
        return Err(act.error(format!("proxy socket {} did not appear", socket.display())));
    }
    act.log.push(UndoRecord::RemoveFile(socket));

    act.set_env(
        address_var,
        &format!("unix:path={GATEWAY_MOUNT_POINT}/{socket_name}"),
    )?;
    tracing::info!(container = %act.container.id(), bus = bus.as_str(), pid, "bus proxy ready");
    Ok(())
}

fn socket_appeared(socket: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if socket.exists() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
