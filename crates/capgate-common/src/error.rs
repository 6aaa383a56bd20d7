//! Unified error types for the capgate workspace.
//!
//! Errors are grouped by family so that callers can tell what to do next:
//!
//! - [`ConfigError`] is raised while configuring a gateway. No host state
//!   has been touched, so there is nothing to roll back.
//! - [`NetworkError`] and the gateway variants of [`Error`] can be raised
//!   after some host mutation already happened. The caller must still call
//!   `teardown` on the gateway to drain its undo log.
//! - [`Error::TeardownIncomplete`] reports undo records that failed while
//!   the rest of the log was still unwound.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ContainerId, GatewayState};

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed, missing, or unknown configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Network setup failure, including address pool exhaustion.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// An operation was called in a lifecycle state that does not allow it.
    #[error("gateway {gateway} is {actual}, expected {expected}")]
    InvalidState {
        /// Capability id of the gateway.
        gateway: String,
        /// State the operation requires.
        expected: GatewayState,
        /// State the gateway is in.
        actual: GatewayState,
    },

    /// Activation was attempted without a bound container.
    #[error("gateway {gateway} has no container bound")]
    NoContainer {
        /// Capability id of the gateway.
        gateway: String,
    },

    /// A second container was bound to a gateway.
    #[error("gateway {gateway} is already bound to container {container}")]
    ContainerAlreadyBound {
        /// Capability id of the gateway.
        gateway: String,
        /// Container the gateway is bound to.
        container: ContainerId,
    },

    /// The gateway has been torn down and must be recreated.
    #[error("gateway {gateway} has been torn down and cannot be reused")]
    Retired {
        /// Capability id of the gateway.
        gateway: String,
    },

    /// A gateway failed to apply its configuration to the host.
    #[error("activation of gateway {gateway} failed: {message}")]
    Activation {
        /// Capability id of the gateway.
        gateway: String,
        /// Description of the failure.
        message: String,
    },

    /// A job could not be run inside the container.
    #[error("job in container {container} failed: {message}")]
    Exec {
        /// Container the job was meant for.
        container: ContainerId,
        /// Description of the failure.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A limit has no controller file in the container's cgroup.
    #[error("cgroup setting {setting} is not available at {path}")]
    CgroupController {
        /// Controller file that was requested.
        setting: String,
        /// Where the file was expected.
        path: PathBuf,
    },

    /// The operation needs a Linux host.
    #[error("{operation} requires Linux")]
    Unsupported {
        /// Short name of the operation.
        operation: &'static str,
    },

    /// Some undo records failed while unwinding a cleanup log.
    #[error("teardown left {} record(s) unreverted: {}", .failures.len(), .failures.join("; "))]
    TeardownIncomplete {
        /// One description per failed record, in the order they ran.
        failures: Vec<String>,
    },
}

impl Error {
    /// Returns `true` when retrying with different parameters may succeed.
    ///
    /// Only address pool exhaustion qualifies. Configuration errors need the
    /// configuration fixed first.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(NetworkError::PoolExhausted { .. }))
    }

    /// Returns `true` for errors raised before any host mutation.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Builds an activation error for the given gateway.
    pub fn activation(gateway: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Activation {
            gateway: gateway.into(),
            message: message.into(),
        }
    }

    /// Builds an I/O error for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Config(ConfigError::Parse { source })
    }
}

impl From<LimitError> for Error {
    fn from(source: LimitError) -> Self {
        Self::Config(ConfigError::Limit(source))
    }
}

/// Configuration errors. Always raised before a gateway reaches `Configured`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration text is not valid JSON.
    #[error("configuration is not valid JSON: {source}")]
    Parse {
        /// Underlying parser error.
        #[from]
        source: serde_json::Error,
    },

    /// An element has the wrong shape or an invalid value.
    #[error("malformed {capability} configuration: {message}")]
    Malformed {
        /// Capability the element belongs to.
        capability: String,
        /// Description of the problem.
        message: String,
    },

    /// A required field is absent.
    #[error("missing field \"{field}\" in {capability} configuration")]
    MissingField {
        /// Capability the element belongs to.
        capability: String,
        /// Name of the missing field.
        field: &'static str,
    },

    /// No gateway handles the given capability id.
    #[error("unknown capability: {id}")]
    UnknownCapability {
        /// The unrecognized id.
        id: String,
    },

    /// A strict profile requires a capability that has no enabled element.
    #[error("mandatory capability {id} has no enabled configuration")]
    MissingMandatory {
        /// The missing capability id.
        id: String,
    },

    /// `configure` was called on a gateway that is past `Created`.
    #[error("gateway {gateway} is already configured")]
    AlreadyConfigured {
        /// Capability id of the gateway.
        gateway: String,
    },

    /// A resource limit value could not be used.
    #[error(transparent)]
    Limit(#[from] LimitError),
}

impl ConfigError {
    /// Builds a [`ConfigError::Malformed`] for the given capability.
    pub fn malformed(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            capability: capability.into(),
            message: message.into(),
        }
    }

    /// Builds a [`ConfigError::MissingField`] for the given capability.
    pub fn missing(capability: impl Into<String>, field: &'static str) -> Self {
        Self::MissingField {
            capability: capability.into(),
            field,
        }
    }
}

/// Resource limit parse and range errors.
///
/// `BadSuffix`, `BadMask` and `NotANumber` mean the input is malformed;
/// `OutOfRange` means it parsed but the controller cannot hold it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitError {
    /// The size suffix is not one of `k`, `m`, `g`.
    #[error("unrecognized size suffix in \"{token}\"")]
    BadSuffix {
        /// The offending token.
        token: String,
    },

    /// A hexadecimal mask was expected.
    #[error("\"{token}\" is not a hexadecimal mask")]
    BadMask {
        /// The offending token.
        token: String,
    },

    /// The token has no numeric part.
    #[error("\"{token}\" is not a number")]
    NotANumber {
        /// The offending token.
        token: String,
    },

    /// The value does not fit the controller's range.
    #[error("{setting} value \"{token}\" is outside {min}..={max}")]
    OutOfRange {
        /// Controller file the value was meant for.
        setting: String,
        /// The offending token.
        token: String,
        /// Smallest accepted value.
        min: u64,
        /// Largest accepted value.
        max: u64,
    },
}

/// Network gateway errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Every address in the pool is allocated.
    #[error("address pool {subnet} is exhausted")]
    PoolExhausted {
        /// Subnet of the pool.
        subnet: String,
    },

    /// An address was released that the pool never handed out.
    #[error("address {address} was not allocated from {subnet}")]
    NotAllocated {
        /// The released address.
        address: String,
        /// Subnet of the pool.
        subnet: String,
    },

    /// The host bridge is missing or does not carry the gateway address.
    #[error("bridge {bridge} does not carry gateway address {gateway}")]
    BridgeUnavailable {
        /// Bridge device name.
        bridge: String,
        /// Expected gateway address.
        gateway: String,
    },

    /// A netlink request failed.
    #[error("netlink {operation} failed: {message}")]
    Netlink {
        /// Short name of the request.
        operation: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// A firewall command failed.
    #[error("firewall command `{command}` failed: {message}")]
    Firewall {
        /// The command line that was run.
        command: String,
        /// Description of the failure.
        message: String,
    },

    /// The network settings are inconsistent.
    #[error("invalid network settings: {message}")]
    Settings {
        /// Description of the problem.
        message: String,
    },
}

impl NetworkError {
    /// Builds a [`NetworkError::Netlink`] from any displayable error.
    pub fn netlink(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Netlink {
            operation,
            message: err.to_string(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
