//! Bind mounts into a container root.

use std::path::Path;

use capgate_common::error::{Error, Result};

use crate::cleanup::{CleanupLog, UndoRecord};

/// Bind-mounts `source` onto `target`, optionally read-only.
///
/// The [`UndoRecord::Unmount`] is pushed as soon as the bind succeeded, so a
/// failed read-only remount still leaves the mount to be detached.
///
/// # Errors
///
/// Returns an error if either `mount(2)` call fails.
#[cfg(target_os = "linux")]
pub fn bind_mount(
    log: &mut CleanupLog,
    source: &Path,
    target: &Path,
    readonly: bool,
) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    let flags = if source.is_dir() {
        MsFlags::MS_BIND | MsFlags::MS_REC
    } else {
        MsFlags::MS_BIND
    };
    mount(Some(source), target, None::<&str>, flags, None::<&str>)
        .map_err(|e| Error::io(target, e.into()))?;
    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        "bind mount created"
    );
    log.push(UndoRecord::Unmount(target.to_path_buf()));

    if readonly {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| Error::io(target, e.into()))?;
        tracing::debug!(target = %target.display(), "remounted read-only");
    }
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error. Bind mounts require Linux.
#[cfg(not(target_os = "linux"))]
pub fn bind_mount(
    _log: &mut CleanupLog,
    _source: &Path,
    _target: &Path,
    _readonly: bool,
) -> Result<()> {
    Err(Error::Unsupported {
        operation: "bind mount",
    })
}

/// Lazily detaches the mount at `target`.
///
/// A target that no longer exists counts as unmounted.
///
/// # Errors
///
/// Returns an error if the unmount syscall fails.
#[cfg(target_os = "linux")]
pub fn unmount(target: &Path) -> Result<()> {
    use nix::errno::Errno;
    use nix::mount::{MntFlags, umount2};

    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) => {
            tracing::debug!(target = %target.display(), "unmounted");
            Ok(())
        }
        Err(Errno::ENOENT) => {
            tracing::warn!(target = %target.display(), "mount target already gone");
            Ok(())
        }
        Err(e) => Err(Error::io(target, e.into())),
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error. Unmounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn unmount(_target: &Path) -> Result<()> {
    Err(Error::Unsupported {
        operation: "unmount",
    })
}
