//! Undo log for reversible host mutations.
//!
//! Every host mutation a gateway performs is described by one
//! [`UndoRecord`] holding exactly the data needed to reverse it. Records are
//! pushed onto a [`CleanupLog`] the moment the mutation succeeds, never
//! before, and are unwound in reverse order of creation. That order
//! guarantees a mutation which depends on an earlier one (a file inside a
//! freshly created directory, a mount on a placeholder) is undone before its
//! dependency.
//!
//! Records are plain data. Executing them is the job of an [`Undo`]
//! implementation, which keeps host access out of the log itself.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use capgate_common::error::{Error, NetworkError, Result};

use crate::filesystem;
use crate::network::iptables::FirewallRule;

/// One reversible host mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoRecord {
    /// Remove an empty directory that was created.
    RemoveDirectory(PathBuf),
    /// Remove a scratch directory and everything in it.
    RemoveTree(PathBuf),
    /// Remove a file, device node, or symlink that was created.
    RemoveFile(PathBuf),
    /// Detach a mount.
    Unmount(PathBuf),
    /// Copy the upper layer of an overlay back onto its lower layer.
    SyncOverlay {
        /// Writable layer holding the changes.
        upper: PathBuf,
        /// Layer the changes are synced into.
        lower: PathBuf,
    },
    /// Kill a helper process that was spawned.
    KillProcess {
        /// PID of the helper.
        pid: u32,
    },
    /// Delete a network link (deleting one end of a veth pair removes both).
    DeleteLink {
        /// Interface name on the host.
        name: String,
    },
    /// Remove an address assigned inside the container.
    RemoveAddress {
        /// Interface carrying the address.
        interface: String,
        /// The assigned address.
        address: Ipv4Addr,
        /// Prefix length the address was assigned with.
        prefix_len: u8,
    },
    /// Delete an inserted firewall rule.
    DeleteRule(FirewallRule),
    /// Return an address to the pool.
    ReleaseAddress(Ipv4Addr),
}

impl fmt::Display for UndoRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoveDirectory(p) => write!(f, "rmdir {}", p.display()),
            Self::RemoveTree(p) => write!(f, "rm -r {}", p.display()),
            Self::RemoveFile(p) => write!(f, "unlink {}", p.display()),
            Self::Unmount(p) => write!(f, "umount {}", p.display()),
            Self::SyncOverlay { upper, lower } => {
                write!(f, "sync {} -> {}", upper.display(), lower.display())
            }
            Self::KillProcess { pid } => write!(f, "kill {pid}"),
            Self::DeleteLink { name } => write!(f, "delete link {name}"),
            Self::RemoveAddress {
                interface,
                address,
                prefix_len,
            } => write!(f, "remove {address}/{prefix_len} from {interface}"),
            Self::DeleteRule(rule) => write!(f, "delete rule {rule}"),
            Self::ReleaseAddress(addr) => write!(f, "release {addr}"),
        }
    }
}

/// Executes undo records.
pub trait Undo {
    /// Reverses the mutation described by `record`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mutation could not be reversed.
    fn undo(&self, record: &UndoRecord) -> Result<()>;
}

/// Undoes filesystem, mount and process records on the local host.
///
/// Network records need a network backend and are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalUndo;

impl Undo for LocalUndo {
    fn undo(&self, record: &UndoRecord) -> Result<()> {
        match record {
            UndoRecord::RemoveDirectory(path) => filesystem::remove_directory(path),
            UndoRecord::RemoveTree(path) => filesystem::remove_tree(path),
            UndoRecord::RemoveFile(path) => filesystem::remove_file(path),
            UndoRecord::Unmount(path) => filesystem::mount::unmount(path),
            UndoRecord::SyncOverlay { upper, lower } => {
                filesystem::overlayfs::sync_overlay(upper, lower)
            }
            UndoRecord::KillProcess { pid } => kill_process(*pid),
            UndoRecord::DeleteLink { .. }
            | UndoRecord::RemoveAddress { .. }
            | UndoRecord::DeleteRule(_)
            | UndoRecord::ReleaseAddress(_) => Err(NetworkError::Settings {
                message: format!("no network backend to run \"{record}\""),
            }
            .into()),
        }
    }
}

#[cfg(target_os = "linux")]
fn kill_process(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::sys::wait::waitpid;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| {
        Error::io(
            format!("/proc/{pid}"),
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        )
    })?;
    let target = Pid::from_raw(raw);
    match kill(target, Signal::SIGKILL) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            tracing::debug!(pid, "process already gone");
            return Ok(());
        }
        Err(e) => return Err(Error::io(format!("/proc/{pid}"), e.into())),
    }
    // Not our child when spawned by another process; nothing to reap then.
    match waitpid(target, None) {
        Ok(_) | Err(Errno::ECHILD) => Ok(()),
        Err(e) => Err(Error::io(format!("/proc/{pid}"), e.into())),
    }
}

#[cfg(not(target_os = "linux"))]
fn kill_process(_pid: u32) -> Result<()> {
    Err(Error::Unsupported {
        operation: "killing a process",
    })
}

/// Ordered log of undo records owned by one gateway.
#[derive(Debug, Default)]
pub struct CleanupLog {
    records: Vec<UndoRecord>,
}

impl CleanupLog {
    /// Creates an empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Appends a record for a mutation that just succeeded.
    pub fn push(&mut self, record: UndoRecord) {
        tracing::trace!(record = %record, "undo record pushed");
        self.records.push(record);
    }

    /// Number of pending records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` when nothing is left to undo.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Pending records, oldest first.
    #[must_use]
    pub fn records(&self) -> &[UndoRecord] {
        &self.records
    }

    /// Undoes every pending record, newest first.
    ///
    /// A failing record does not stop the unwinding: it is logged, counted,
    /// and the next record runs. The log is empty afterwards, so calling
    /// this again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TeardownIncomplete`] listing every record that
    /// failed.
    pub fn unwind(&mut self, undo: &dyn Undo) -> Result<()> {
        let mut failures = Vec::new();
        while let Some(record) = self.records.pop() {
            match undo.undo(&record) {
                Ok(()) => tracing::debug!(record = %record, "undone"),
                Err(e) => {
                    tracing::error!(record = %record, error = %e, "undo failed");
                    failures.push(format!("{record}: {e}"));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::TeardownIncomplete { failures })
        }
    }
}
