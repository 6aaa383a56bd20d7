//! Device nodes and their permission modes.

use std::path::Path;

use capgate_common::error::{Error, Result};

use crate::cleanup::{CleanupLog, UndoRecord};

/// Type and numbers of a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNumbers {
    /// Block device rather than character device.
    pub block: bool,
    /// Major number.
    pub major: u64,
    /// Minor number.
    pub minor: u64,
    /// Permission bits of the node.
    pub mode: u32,
}

/// Reads the type, numbers and mode of the node at `path`.
///
/// Returns `None` when `path` exists but is not a device node.
///
/// # Errors
///
/// Returns an error if `path` cannot be examined.
#[cfg(target_os = "linux")]
pub fn device_numbers(path: &Path) -> Result<Option<DeviceNumbers>> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    use nix::sys::stat::{major, minor};

    let meta = std::fs::metadata(path).map_err(|e| Error::io(path, e))?;
    let file_type = meta.file_type();
    if !file_type.is_char_device() && !file_type.is_block_device() {
        return Ok(None);
    }
    Ok(Some(DeviceNumbers {
        block: file_type.is_block_device(),
        major: major(meta.rdev()),
        minor: minor(meta.rdev()),
        mode: meta.mode() & 0o7777,
    }))
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error. Device nodes require Linux.
#[cfg(not(target_os = "linux"))]
pub fn device_numbers(_path: &Path) -> Result<Option<DeviceNumbers>> {
    Err(Error::Unsupported {
        operation: "reading device numbers",
    })
}

/// Creates a device node at `path` and gives it exactly `device.mode`.
///
/// The node is a new inode owned by the container root; the node it may
/// have been copied from is never touched. Its removal is recorded as
/// soon as `mknod(2)` succeeded.
///
/// # Errors
///
/// Returns an error if `mknod(2)` or the following `chmod(2)` fails.
#[cfg(target_os = "linux")]
pub fn make_node(log: &mut CleanupLog, path: &Path, device: DeviceNumbers) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    use nix::sys::stat::{Mode, SFlag, makedev, mknod};

    let kind = if device.block {
        SFlag::S_IFBLK
    } else {
        SFlag::S_IFCHR
    };
    let mode = Mode::from_bits_truncate(device.mode);
    mknod(path, kind, mode, makedev(device.major, device.minor))
        .map_err(|e| Error::io(path, e.into()))?;
    log.push(UndoRecord::RemoveFile(path.to_path_buf()));

    // mknod is subject to the umask.
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(device.mode))
        .map_err(|e| Error::io(path, e))?;
    tracing::debug!(
        path = %path.display(),
        major = device.major,
        minor = device.minor,
        block = device.block,
        mode = %format!("{:o}", device.mode),
        "device node created"
    );
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error. Device nodes require Linux.
#[cfg(not(target_os = "linux"))]
pub fn make_node(_log: &mut CleanupLog, _path: &Path, _device: DeviceNumbers) -> Result<()> {
    Err(Error::Unsupported {
        operation: "mknod",
    })
}

/// Parses an octal permission mode such as `"666"` or `"0660"`.
///
/// Returns `None` for anything that is not at most four octal digits.
#[must_use]
pub fn parse_mode(text: &str) -> Option<u32> {
    if text.is_empty() || text.len() > 4 {
        return None;
    }
    u32::from_str_radix(text, 8).ok()
}

/// Combines two permission modes, keeping the more permissive value for
/// each of the owner, group and other digits.
///
/// `0o640` and `0o604` give `0o644`.
#[must_use]
pub fn merge_modes(a: u32, b: u32) -> u32 {
    (0..4).fold(0, |acc, digit| {
        let shift = digit * 3;
        let left = (a >> shift) & 0o7;
        let right = (b >> shift) & 0o7;
        acc | (left.max(right) << shift)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_the_higher_digit_per_class() {
        assert_eq!(merge_modes(0o640, 0o604), 0o644);
        assert_eq!(merge_modes(0o700, 0o077), 0o777);
        assert_eq!(merge_modes(0o666, 0o666), 0o666);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn null_device_numbers_are_read_from_the_host() {
        let null = device_numbers(Path::new("/dev/null")).unwrap().unwrap();
        assert!(!null.block);
        assert_eq!((null.major, null.minor), (1, 3));

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, "").unwrap();
        assert_eq!(device_numbers(&file).unwrap(), None);
        assert!(device_numbers(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn modes_parse_as_octal() {
        assert_eq!(parse_mode("666"), Some(0o666));
        assert_eq!(parse_mode("0660"), Some(0o660));
        assert_eq!(parse_mode("888"), None);
        assert_eq!(parse_mode(""), None);
        assert_eq!(parse_mode("17777"), None);
    }
}
