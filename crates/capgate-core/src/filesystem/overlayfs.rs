//! `OverlayFS` write buffers.
//!
//! A write-buffered file mount stacks a scratch upper layer over the host
//! directory so the container writes land in the scratch area. On teardown
//! the upper layer is synced back onto the host directory before the
//! scratch area is removed.

use std::path::{Path, PathBuf};

use capgate_common::error::{Error, Result};

use crate::cleanup::{CleanupLog, UndoRecord};

/// Directories backing one write-buffered mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Host directory used as the read-only lower layer.
    pub lower_dir: PathBuf,
    /// Scratch directory holding the upper and work layers.
    pub scratch_dir: PathBuf,
    /// Mount point inside the container root.
    pub merged_dir: PathBuf,
}

impl OverlayConfig {
    /// Writable upper layer directory.
    #[must_use]
    pub fn upper_dir(&self) -> PathBuf {
        self.scratch_dir.join("upper")
    }

    /// Work directory required by `OverlayFS`.
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        self.scratch_dir.join("work")
    }

    fn options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower_dir.display(),
            self.upper_dir().display(),
            self.work_dir().display()
        )
    }
}

/// Mounts an overlay write buffer.
///
/// Pushes, in order: removal of each missing ancestor of the scratch
/// directory, removal of the scratch tree, the sync of the upper layer
/// back to the lower one, and the unmount. Unwinding therefore detaches
/// first, syncs second and deletes the scratch area and its ancestors
/// last.
///
/// The scratch directory must not exist yet: leftover layers from an
/// earlier run would be synced onto the host.
///
/// # Errors
///
/// Returns an error if the scratch directory already exists, the scratch
/// layers cannot be created or the mount syscall fails.
#[cfg(target_os = "linux")]
pub fn mount_overlay(log: &mut CleanupLog, config: &OverlayConfig) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    create_scratch(log, &config.scratch_dir)?;
    for dir in [config.upper_dir(), config.work_dir()] {
        std::fs::create_dir(&dir).map_err(|e| Error::io(&dir, e))?;
    }

    let opts = config.options();
    mount(
        Some("overlay"),
        &config.merged_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
    )
    .map_err(|e| Error::io(&config.merged_dir, e.into()))?;

    log.push(UndoRecord::SyncOverlay {
        upper: config.upper_dir(),
        lower: config.lower_dir.clone(),
    });
    log.push(UndoRecord::Unmount(config.merged_dir.clone()));
    tracing::info!(merged = %config.merged_dir.display(), "overlay write buffer mounted");
    Ok(())
}

#[cfg(target_os = "linux")]
fn create_scratch(log: &mut CleanupLog, scratch_dir: &Path) -> Result<()> {
    if scratch_dir.symlink_metadata().is_ok() {
        return Err(Error::io(
            scratch_dir,
            std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "overlay scratch directory left over from an earlier run",
            ),
        ));
    }
    if let Some(parent) = scratch_dir.parent() {
        super::create_directory(log, parent)?;
    }
    std::fs::create_dir(scratch_dir).map_err(|e| Error::io(scratch_dir, e))?;
    log.push(UndoRecord::RemoveTree(scratch_dir.to_path_buf()));
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error. `OverlayFS` mounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_overlay(_log: &mut CleanupLog, _config: &OverlayConfig) -> Result<()> {
    Err(Error::Unsupported {
        operation: "overlay mount",
    })
}

/// Copies the contents of an upper layer onto its lower layer.
///
/// Whiteouts (character devices with device number 0) delete the matching
/// lower entry. Directories are merged, files and symlinks replaced.
///
/// # Errors
///
/// Returns an error if any entry cannot be read or written.
pub fn sync_overlay(upper: &Path, lower: &Path) -> Result<()> {
    if !upper.exists() {
        tracing::warn!(upper = %upper.display(), "upper layer missing, nothing to sync");
        return Ok(());
    }
    let copied = sync_tree(upper, lower)?;
    tracing::debug!(
        upper = %upper.display(),
        lower = %lower.display(),
        entries = copied,
        "overlay synced"
    );
    Ok(())
}

fn sync_tree(upper: &Path, lower: &Path) -> Result<usize> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let mut copied = 0;
    let entries = std::fs::read_dir(upper).map_err(|e| Error::io(upper, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(upper, e))?;
        let source = entry.path();
        let target = lower.join(entry.file_name());
        let meta = std::fs::symlink_metadata(&source).map_err(|e| Error::io(&source, e))?;
        let kind = meta.file_type();

        if kind.is_char_device() && meta.rdev() == 0 {
            remove_entry(&target)?;
        } else if kind.is_dir() {
            if target.symlink_metadata().is_ok_and(|m| !m.is_dir()) {
                remove_entry(&target)?;
            }
            std::fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
            copied += sync_tree(&source, &target)?;
        } else if kind.is_symlink() {
            let dest = std::fs::read_link(&source).map_err(|e| Error::io(&source, e))?;
            remove_entry(&target)?;
            std::os::unix::fs::symlink(&dest, &target).map_err(|e| Error::io(&target, e))?;
            copied += 1;
        } else {
            if target.is_dir() {
                remove_entry(&target)?;
            }
            let _bytes = std::fs::copy(&source, &target).map_err(|e| Error::io(&target, e))?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn remove_entry(path: &Path) -> Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => super::remove_tree(path),
        Ok(_) => super::remove_file(path),
        Err(_) => Ok(()),
    }
}
