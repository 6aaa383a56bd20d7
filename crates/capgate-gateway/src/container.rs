//! Execution surface a gateway needs from its container.

use std::fmt;
use std::path::Path;

use capgate_common::error::Result;
use capgate_common::types::ContainerId;
use capgate_core::cgroup::CgroupManager;

/// Work to run inside a container.
pub enum Job {
    /// Shell command line, run with the container's exported environment.
    Command(String),
    /// Closure run in a process that joined the container's namespaces.
    /// Its return value is the exit status.
    Function(Box<dyn FnOnce() -> i32 + Send>),
}

impl Job {
    /// Wraps a closure as a job.
    pub fn function(f: impl FnOnce() -> i32 + Send + 'static) -> Self {
        Self::Function(Box::new(f))
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(cmd) => f.debug_tuple("Command").field(cmd).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// A running container, as seen by its gateways.
///
/// Gateways hold the container through a shared reference and never
/// control its lifetime.
pub trait ContainerHandle: Send + Sync {
    /// Identifier of the container.
    fn id(&self) -> &ContainerId;

    /// PID of the container's init process on the host.
    fn pid(&self) -> u32;

    /// Host path of the container's root filesystem.
    fn rootfs(&self) -> &Path;

    /// Host path of the directory visible as `/gateways` in the container.
    fn gateway_dir(&self) -> &Path;

    /// The container's cgroups, one directory per controller hierarchy.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroups cannot be located.
    fn cgroups(&self) -> Result<CgroupManager>;

    /// Runs `job` inside the container and blocks until it exits.
    ///
    /// # Errors
    ///
    /// Returns an error if the job could not be started. A job that ran
    /// and failed is reported through its exit status.
    fn execute(&self, job: Job) -> Result<i32>;

    /// Exports an environment variable to processes started in the
    /// container.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable cannot be recorded.
    fn set_environment_variable(&self, name: &str, value: &str) -> Result<()>;

    /// Returns the exported value of an environment variable.
    fn environment_variable(&self, name: &str) -> Option<String>;
}
