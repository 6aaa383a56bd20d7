//! The gateway lifecycle shared by every capability.
//!
//! A [`Gateway`] wraps one [`GatewayKind`] and enforces the state machine:
//!
//! ```text
//! Created --configure--> Configured --activate--> Activated
//!    \______________________\_____________________\__teardown--> retired
//! ```
//!
//! States only move forward. `teardown` is valid from any state, drains
//! the undo log, and retires the instance.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use capgate_common::constants::GATEWAY_MOUNT_POINT;
use capgate_common::error::{ConfigError, Error, Result};
use capgate_common::types::{Capability, GatewayState};
use capgate_core::cleanup::{CleanupLog, UndoRecord};
use capgate_core::filesystem;

use crate::container::{ContainerHandle, Job};
use crate::gateways::GatewayKind;
use crate::host::{HostContext, HostNetwork};
use crate::undo::HostUndo;

/// One capability gateway bound to at most one container.
pub struct Gateway {
    kind: GatewayKind,
    state: GatewayState,
    retired: bool,
    container: Option<Arc<dyn ContainerHandle>>,
    cleanup: CleanupLog,
    host: Arc<HostContext>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("id", &self.id())
            .field("state", &self.state)
            .field("retired", &self.retired)
            .field("container", &self.container.as_ref().map(|c| c.id().clone()))
            .field("pending_undo", &self.cleanup.len())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Creates a gateway for `capability` in the `Created` state.
    #[must_use]
    pub fn new(capability: Capability, host: Arc<HostContext>) -> Self {
        Self {
            kind: GatewayKind::new(capability),
            state: GatewayState::Created,
            retired: false,
            container: None,
            cleanup: CleanupLog::new(),
            host,
        }
    }

    /// Capability id of this gateway.
    #[must_use]
    pub fn id(&self) -> &'static str {
        self.kind.capability().as_str()
    }

    /// Capability of this gateway.
    #[must_use]
    pub fn capability(&self) -> Capability {
        self.kind.capability()
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> GatewayState {
        self.state
    }

    /// The parsed configuration.
    #[must_use]
    pub const fn kind(&self) -> &GatewayKind {
        &self.kind
    }

    /// Returns `true` once configuration succeeded.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.state >= GatewayState::Configured
    }

    /// Returns `true` while host mutations are applied.
    #[must_use]
    pub fn is_activated(&self) -> bool {
        self.state == GatewayState::Activated && !self.retired
    }

    /// Returns `true` after teardown.
    #[must_use]
    pub const fn is_retired(&self) -> bool {
        self.retired
    }

    /// Number of host mutations waiting to be undone.
    #[must_use]
    pub fn pending_undo(&self) -> usize {
        self.cleanup.len()
    }

    /// Undo records waiting to run, oldest first.
    #[must_use]
    pub fn undo_records(&self) -> &[UndoRecord] {
        self.cleanup.records()
    }

    /// Parses configuration elements and moves to `Configured`.
    ///
    /// All elements are parsed before any of them takes effect; on error
    /// the gateway stays in `Created` with its previous configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if an element is malformed or the
    /// gateway is past `Created`.
    pub fn configure(&mut self, elements: &[Value]) -> Result<()> {
        let staged = self.stage(elements)?;
        self.commit(staged, elements.len());
        Ok(())
    }

    /// Parses `elements` on top of the current configuration without
    /// changing the gateway.
    pub(crate) fn stage(&self, elements: &[Value]) -> Result<GatewayKind> {
        if self.state != GatewayState::Created || self.retired {
            return Err(ConfigError::AlreadyConfigured {
                gateway: self.id().to_string(),
            }
            .into());
        }
        let mut staged = self.kind.clone();
        for element in elements {
            staged.read_element(element)?;
        }
        Ok(staged)
    }

    /// Installs a configuration returned by [`Gateway::stage`].
    pub(crate) fn commit(&mut self, staged: GatewayKind, elements: usize) {
        self.kind = staged;
        self.state = GatewayState::Configured;
        tracing::info!(gateway = self.id(), elements, "gateway configured");
    }

    /// Applies the configuration to the host and the bound container.
    ///
    /// A failure leaves the mutations that already succeeded in the undo
    /// log; call [`Gateway::teardown`] to reverse them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the gateway is `Configured`,
    /// [`Error::NoContainer`] without a bound container, or the error of
    /// the first failing step.
    pub fn activate(&mut self) -> Result<()> {
        if self.retired {
            return Err(Error::Retired {
                gateway: self.id().to_string(),
            });
        }
        if self.state != GatewayState::Configured {
            return Err(Error::InvalidState {
                gateway: self.id().to_string(),
                expected: GatewayState::Configured,
                actual: self.state,
            });
        }
        let Some(container) = self.container.clone() else {
            return Err(Error::NoContainer {
                gateway: self.id().to_string(),
            });
        };

        let host = Arc::clone(&self.host);
        let mut activation = Activation {
            capability: self.kind.capability(),
            container: container.as_ref(),
            log: &mut self.cleanup,
            host: &host,
        };
        if let Err(e) = self.kind.activate(&mut activation) {
            tracing::error!(
                gateway = self.id(),
                container = %container.id(),
                error = %e,
                pending_undo = self.cleanup.len(),
                "activation failed"
            );
            return Err(e);
        }
        self.state = GatewayState::Activated;
        tracing::info!(gateway = self.id(), container = %container.id(), "gateway activated");
        Ok(())
    }

    /// Reverses every recorded host mutation, newest first, and retires
    /// the gateway.
    ///
    /// Valid in any state and idempotent. A failing record does not stop
    /// the rest from running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TeardownIncomplete`] listing the records that
    /// failed.
    pub fn teardown(&mut self) -> Result<()> {
        if self.state != GatewayState::Activated && !self.retired {
            tracing::warn!(
                gateway = self.id(),
                state = %self.state,
                pending_undo = self.cleanup.len(),
                "teardown of a gateway that was never activated"
            );
        }
        self.retired = true;
        let undo = HostUndo {
            network: self.host.network.as_deref(),
            container: self.container.as_deref(),
        };
        let outcome = self.cleanup.unwind(&undo);
        match &outcome {
            Ok(()) => tracing::info!(gateway = self.id(), "gateway torn down"),
            Err(e) => tracing::error!(gateway = self.id(), error = %e, "teardown incomplete"),
        }
        outcome
    }

    /// Binds the container this gateway works on. Only one binding is
    /// allowed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContainerAlreadyBound`] on a second call.
    pub fn bind_container(&mut self, container: Arc<dyn ContainerHandle>) -> Result<()> {
        if let Some(bound) = &self.container {
            return Err(Error::ContainerAlreadyBound {
                gateway: self.id().to_string(),
                container: bound.id().clone(),
            });
        }
        tracing::debug!(gateway = self.id(), container = %container.id(), "container bound");
        self.container = Some(container);
        Ok(())
    }

    /// Returns `true` if a container is bound.
    #[must_use]
    pub const fn has_container(&self) -> bool {
        self.container.is_some()
    }

    /// The bound container, if any.
    #[must_use]
    pub const fn container(&self) -> Option<&Arc<dyn ContainerHandle>> {
        self.container.as_ref()
    }

    /// Runs a job in the bound container and returns its exit status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoContainer`] without a bound container, or the
    /// container's error if the job could not be started.
    pub fn execute_in_container(&self, job: Job) -> Result<i32> {
        self.bound()?.execute(job)
    }

    /// Exports an environment variable into the bound container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoContainer`] without a bound container.
    pub fn set_environment_variable(&self, name: &str, value: &str) -> Result<()> {
        self.bound()?.set_environment_variable(name, value)
    }

    fn bound(&self) -> Result<&Arc<dyn ContainerHandle>> {
        self.container.as_ref().ok_or_else(|| Error::NoContainer {
            gateway: self.id().to_string(),
        })
    }
}

/// What a gateway sees while it activates.
pub struct Activation<'a> {
    pub(crate) capability: Capability,
    pub(crate) container: &'a dyn ContainerHandle,
    pub(crate) log: &'a mut CleanupLog,
    pub(crate) host: &'a HostContext,
}

impl<'a> Activation<'a> {
    /// Capability id of the activating gateway.
    #[must_use]
    pub const fn id(&self) -> &'static str {
        self.capability.as_str()
    }

    /// Builds an activation error for this gateway.
    pub fn error(&self, message: impl Into<String>) -> Error {
        Error::activation(self.id(), message)
    }

    /// The shared host network.
    ///
    /// # Errors
    ///
    /// Returns an activation error when the host has no network context.
    pub fn network(&self) -> Result<&'a HostNetwork> {
        let host: &'a HostContext = self.host;
        host.network
            .as_deref()
            .ok_or_else(|| self.error("no host network configured"))
    }

    /// Exports an environment variable into the container.
    ///
    /// # Errors
    ///
    /// Returns the container's error.
    pub fn set_env(&self, name: &str, value: &str) -> Result<()> {
        self.container.set_environment_variable(name, value)?;
        tracing::debug!(gateway = self.id(), name, value, "environment variable exported");
        Ok(())
    }

    /// Runs a job in the container and fails on a non-zero exit status.
    ///
    /// # Errors
    ///
    /// Returns an error if the job cannot start or exits non-zero.
    pub fn run(&self, what: &str, job: Job) -> Result<()> {
        let status = self.container.execute(job)?;
        if status == 0 {
            Ok(())
        } else {
            Err(Error::Exec {
                container: self.container.id().clone(),
                message: format!("{what} exited with status {status}"),
            })
        }
    }

    /// Host path of `path` inside the container root.
    #[must_use]
    pub fn rootfs_path(&self, path: &Path) -> PathBuf {
        filesystem::in_rootfs(self.container.rootfs(), path)
    }

    /// Bind-mounts a host file into the gateway directory and returns the
    /// path the container sees it under.
    ///
    /// # Errors
    ///
    /// Returns an error if the placeholder or the mount cannot be created.
    pub fn share_file(&mut self, source: &Path, name: &str, readonly: bool) -> Result<PathBuf> {
        let target = self.container.gateway_dir().join(name);
        filesystem::create_placeholder(self.log, &target, source.is_dir())?;
        filesystem::mount::bind_mount(self.log, source, &target, readonly)?;
        Ok(Path::new(GATEWAY_MOUNT_POINT).join(name))
    }
}
