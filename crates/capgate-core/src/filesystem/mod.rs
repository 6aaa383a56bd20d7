//! Filesystem mutations with undo records.
//!
//! Every function that changes the host takes the gateway's
//! [`CleanupLog`] and pushes the matching record right after the change
//! succeeded. A failure part-way leaves exactly the completed steps in the
//! log.

pub mod device;
pub mod mount;
pub mod overlayfs;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use capgate_common::error::{Error, Result};

use crate::cleanup::{CleanupLog, UndoRecord};

/// Creates `path` and any missing ancestors.
///
/// One [`UndoRecord::RemoveDirectory`] is pushed per directory that did not
/// exist before, outermost first, so unwinding removes them innermost
/// first. Existing directories are left alone and not recorded.
///
/// # Errors
///
/// Returns an error if a directory cannot be created.
pub fn create_directory(log: &mut CleanupLog, path: &Path) -> Result<()> {
    let mut missing: Vec<PathBuf> = Vec::new();
    let mut cursor = Some(path);
    while let Some(dir) = cursor {
        if dir.as_os_str().is_empty() || dir.exists() {
            break;
        }
        missing.push(dir.to_path_buf());
        cursor = dir.parent();
    }

    for dir in missing.into_iter().rev() {
        std::fs::create_dir(&dir).map_err(|e| Error::io(&dir, e))?;
        tracing::debug!(path = %dir.display(), "directory created");
        log.push(UndoRecord::RemoveDirectory(dir));
    }
    Ok(())
}

/// Makes sure a mount target exists at `path`.
///
/// Directories are created with [`create_directory`]. For a file target the
/// parent is created the same way and an empty file is placed at `path`,
/// recorded with [`UndoRecord::RemoveFile`].
///
/// # Errors
///
/// Returns an error if the placeholder cannot be created.
pub fn create_placeholder(log: &mut CleanupLog, path: &Path, directory: bool) -> Result<()> {
    if directory {
        return create_directory(log, path);
    }
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        create_directory(log, parent)?;
    }
    let _file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| Error::io(path, e))?;
    tracing::debug!(path = %path.display(), "placeholder created");
    log.push(UndoRecord::RemoveFile(path.to_path_buf()));
    Ok(())
}

/// Creates a symlink at `link` pointing to `target`.
///
/// # Errors
///
/// Returns an error if the link cannot be created.
pub fn create_symlink(log: &mut CleanupLog, target: &Path, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        create_directory(log, parent)?;
    }
    std::os::unix::fs::symlink(target, link).map_err(|e| Error::io(link, e))?;
    tracing::debug!(link = %link.display(), target = %target.display(), "symlink created");
    log.push(UndoRecord::RemoveFile(link.to_path_buf()));
    Ok(())
}

/// Removes an empty directory. A directory that is already gone is fine.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be removed.
pub fn remove_directory(path: &Path) -> Result<()> {
    tolerate_missing(path, std::fs::remove_dir(path))
}

/// Removes a directory and its contents.
///
/// # Errors
///
/// Returns an error if the tree exists but cannot be removed.
pub fn remove_tree(path: &Path) -> Result<()> {
    tolerate_missing(path, std::fs::remove_dir_all(path))
}

/// Removes a file, device node, or symlink.
///
/// # Errors
///
/// Returns an error if the entry exists but cannot be removed.
pub fn remove_file(path: &Path) -> Result<()> {
    tolerate_missing(path, std::fs::remove_file(path))
}

fn tolerate_missing(path: &Path, outcome: std::io::Result<()>) -> Result<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "already removed");
            Ok(())
        }
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Maps an absolute container path onto the container's root on the host.
#[must_use]
pub fn in_rootfs(rootfs: &Path, container_path: &Path) -> PathBuf {
    rootfs.join(container_path.strip_prefix("/").unwrap_or(container_path))
}
