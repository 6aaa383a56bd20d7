//! Cgroup controller access for a running container.
//!
//! The container's cgroup already exists; this module only locates it and
//! writes validated values into its controller files.

pub mod limits;

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use capgate_common::constants::CGROUP_ROOT;
use capgate_common::error::{Error, Result};

/// Cgroup membership of one process, one path per hierarchy.
///
/// Built from `/proc/<pid>/cgroup`, where each line reads
/// `<id>:<controllers>:<path>`. Hierarchy `0` with no controllers is the
/// unified (v2) one; the others are v1 hierarchies mounted under
/// `<root>/<controllers>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    unified: Option<String>,
    /// Controller name to `(hierarchy directory, path in hierarchy)`.
    v1: BTreeMap<String, (String, String)>,
}

impl Membership {
    /// Parses the contents of `/proc/<pid>/cgroup`.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut membership = Self::default();
        for line in content.lines() {
            let mut fields = line.splitn(3, ':');
            let (Some(id), Some(controllers), Some(path)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let path = path.trim().to_string();
            if id == "0" && controllers.is_empty() {
                membership.unified = Some(path);
                continue;
            }
            for controller in controllers.split(',') {
                if controller.is_empty() || controller.starts_with("name=") {
                    continue;
                }
                let _previous = membership
                    .v1
                    .insert(controller.to_string(), (controllers.to_string(), path.clone()));
            }
        }
        membership
    }

    /// Path in the unified hierarchy, if the process has one.
    #[must_use]
    pub fn unified(&self) -> Option<&str> {
        self.unified.as_deref()
    }
}

/// Handle to the cgroups of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupManager {
    root: PathBuf,
    membership: Membership,
}

impl CgroupManager {
    /// Wraps a single cgroup directory holding every controller file.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            root: path.into(),
            membership: Membership {
                unified: Some(String::from("/")),
                v1: BTreeMap::new(),
            },
        }
    }

    /// Resolves `membership` against the cgroup filesystem mounted at
    /// `root`.
    #[must_use]
    pub fn with_membership(root: impl Into<PathBuf>, membership: Membership) -> Self {
        Self {
            root: root.into(),
            membership,
        }
    }

    /// Locates the cgroups of a process via `/proc/<pid>/cgroup`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn for_process(pid: u32) -> Result<Self> {
        let proc_path = PathBuf::from(format!("/proc/{pid}/cgroup"));
        let content =
            std::fs::read_to_string(&proc_path).map_err(|e| Error::io(&proc_path, e))?;
        let membership = Membership::parse(&content);
        tracing::debug!(
            pid,
            unified = ?membership.unified(),
            v1_controllers = membership.v1.len(),
            "cgroup located"
        );
        Ok(Self::with_membership(CGROUP_ROOT, membership))
    }

    /// Mount point the cgroup paths are resolved against.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the controller file `setting`.
    ///
    /// A v1 hierarchy carrying the controller named by the prefix of
    /// `setting` (`memory` for `memory.limit_in_bytes`) wins; otherwise the
    /// unified hierarchy is used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CgroupController`] if the process is in neither.
    pub fn controller_dir(&self, setting: &str) -> Result<PathBuf> {
        let controller = setting.split('.').next().unwrap_or(setting);
        let relative = match (self.membership.v1.get(controller), &self.membership.unified) {
            (Some((hierarchy, path)), _) => {
                Path::new(hierarchy).join(path.trim_start_matches('/'))
            }
            (None, Some(path)) => PathBuf::from(path.trim_start_matches('/')),
            (None, None) => {
                return Err(Error::CgroupController {
                    setting: setting.to_string(),
                    path: self.root.clone(),
                });
            }
        };
        Ok(self.root.join(relative))
    }

    /// Writes `value` into the controller file `setting`.
    ///
    /// The value is validated with [`limits::parse_limit`] first, so a bad
    /// token never reaches the kernel. The file must already exist: a
    /// missing file means the controller is not available.
    ///
    /// # Errors
    ///
    /// Returns a limit error for a bad token,
    /// [`Error::CgroupController`] if the controller file does not exist,
    /// or an I/O error if it cannot be written.
    pub fn set_item(&self, setting: &str, value: &str) -> Result<()> {
        let normalized = limits::parse_limit(setting, value)?;
        let file = self.controller_dir(setting)?.join(setting);
        if !file.is_file() {
            return Err(Error::CgroupController {
                setting: setting.to_string(),
                path: file,
            });
        }
        let mut handle = OpenOptions::new()
            .write(true)
            .open(&file)
            .map_err(|e| Error::io(&file, e))?;
        handle
            .write_all(normalized.as_bytes())
            .map_err(|e| Error::io(&file, e))?;
        tracing::debug!(setting, value = %normalized, path = %file.display(), "cgroup item set");
        Ok(())
    }
}
