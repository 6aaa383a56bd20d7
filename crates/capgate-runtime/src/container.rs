//! A running process seen as a gateway container.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use capgate_common::constants::GATEWAY_MOUNT_POINT;
use capgate_common::error::{Error, Result};
use capgate_common::types::ContainerId;
use capgate_core::cgroup::CgroupManager;
use capgate_core::cleanup::{CleanupLog, LocalUndo};
use capgate_core::filesystem::{self, mount};
use capgate_gateway::{ContainerHandle, Job};

use crate::exec;

/// Container backed by the namespaces of an already running process.
///
/// Environment variables exported by gateways are kept here and handed
/// to every command job.
pub struct NamespaceContainer {
    id: ContainerId,
    pid: u32,
    rootfs: PathBuf,
    gateway_dir: PathBuf,
    env: RwLock<BTreeMap<String, String>>,
    cleanup: Mutex<CleanupLog>,
}

impl std::fmt::Debug for NamespaceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceContainer")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("rootfs", &self.rootfs)
            .field("gateway_dir", &self.gateway_dir)
            .finish_non_exhaustive()
    }
}

impl NamespaceContainer {
    /// Wraps process `pid` whose root filesystem is `rootfs` on the host.
    ///
    /// Creates `gateway_dir` and bind-mounts it to `/gateways` inside the
    /// root so gateway sockets and files become visible to the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the process does not exist or the gateway
    /// directory cannot be prepared. Partial preparation is undone.
    pub fn attach(
        id: ContainerId,
        pid: u32,
        rootfs: impl Into<PathBuf>,
        gateway_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let rootfs = rootfs.into();
        let gateway_dir = gateway_dir.into();
        let proc_dir = PathBuf::from(format!("/proc/{pid}"));
        if !proc_dir.exists() {
            return Err(Error::Exec {
                container: id,
                message: format!("process {pid} does not exist"),
            });
        }

        let mut cleanup = CleanupLog::new();
        let target = filesystem::in_rootfs(&rootfs, Path::new(GATEWAY_MOUNT_POINT));
        if let Err(e) = share_gateway_dir(&mut cleanup, &gateway_dir, &target) {
            if let Err(undo) = cleanup.unwind(&LocalUndo) {
                tracing::error!(error = %undo, "gateway directory cleanup failed");
            }
            return Err(e);
        }

        tracing::info!(id = %id, pid, rootfs = %rootfs.display(), "container attached");
        Ok(Self {
            id,
            pid,
            rootfs,
            gateway_dir,
            env: RwLock::new(BTreeMap::new()),
            cleanup: Mutex::new(cleanup),
        })
    }

    /// Seeds the exported environment, for example with `PATH`.
    #[must_use]
    pub fn with_env(self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.write().extend(vars);
        self
    }

    /// Snapshot of the exported environment.
    #[must_use]
    pub fn environment(&self) -> BTreeMap<String, String> {
        self.env.read().clone()
    }

    /// Removes the `/gateways` mount and the directories created for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TeardownIncomplete`] if any step failed.
    pub fn detach(&self) -> Result<()> {
        let outcome = self.cleanup.lock().unwind(&LocalUndo);
        tracing::info!(id = %self.id, ok = outcome.is_ok(), "container detached");
        outcome
    }
}

fn share_gateway_dir(log: &mut CleanupLog, gateway_dir: &Path, target: &Path) -> Result<()> {
    filesystem::create_directory(log, gateway_dir)?;
    filesystem::create_placeholder(log, target, true)?;
    mount::bind_mount(log, gateway_dir, target, false)
}

impl ContainerHandle for NamespaceContainer {
    fn id(&self) -> &ContainerId {
        &self.id
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    fn gateway_dir(&self) -> &Path {
        &self.gateway_dir
    }

    fn cgroups(&self) -> Result<CgroupManager> {
        CgroupManager::for_process(self.pid)
    }

    fn execute(&self, job: Job) -> Result<i32> {
        match job {
            Job::Command(command) => {
                let env = self.env.read().clone();
                exec::run_command(&self.id, self.pid, &env, &command)
            }
            Job::Function(f) => exec::run_function(self.pid, f),
        }
    }

    fn set_environment_variable(&self, name: &str, value: &str) -> Result<()> {
        let _previous = self.env.write().insert(name.to_string(), value.to_string());
        tracing::debug!(id = %self.id, name, "environment variable recorded");
        Ok(())
    }

    fn environment_variable(&self, name: &str) -> Option<String> {
        self.env.read().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_to_a_missing_process_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = NamespaceContainer::attach(
            ContainerId::new("ghost"),
            u32::MAX,
            dir.path().join("rootfs"),
            dir.path().join("gateways"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Exec { .. }));
        assert!(!dir.path().join("gateways").exists());
    }
}
