//! Host file gateway.
//!
//! ```json
//! { "path-host": "/etc/ssl/certs", "path-container": "/etc/ssl/certs",
//!   "read-only": true, "env-var-name": "SSL_CERT_DIR" }
//! ```
//!
//! Each element bind-mounts one host path into the container root. With
//! `write-buffer` the host directory is stacked under an overlay instead,
//! and container writes are synced back on teardown.

use std::path::{Path, PathBuf};

use serde_json::Value;

use capgate_common::error::{ConfigError, Result};
use capgate_core::filesystem::overlayfs::{OverlayConfig, mount_overlay};
use capgate_core::filesystem::{self, mount};

use crate::element::Element;
use crate::gateway::Activation;

const ID: &str = "file";

/// Environment variable exported for a mounted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvExport {
    /// Variable name.
    pub name: String,
    /// Text placed before the container path.
    pub prefix: String,
    /// Text placed after the container path.
    pub suffix: String,
}

/// One host path made visible in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSetting {
    /// Source on the host.
    pub path_host: PathBuf,
    /// Destination inside the container.
    pub path_container: PathBuf,
    /// Mount read-only.
    pub read_only: bool,
    /// Also link `path_host` inside the container to `path_container`.
    pub create_symlink: bool,
    /// Buffer writes in an overlay and sync them back on teardown.
    pub write_buffer: bool,
    /// Variable pointing at the container path.
    pub env: Option<EnvExport>,
}

/// Host files mounted into the container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileGateway {
    files: Vec<FileSetting>,
}

impl FileGateway {
    /// Configured files, in first-definition order.
    #[must_use]
    pub fn files(&self) -> &[FileSetting] {
        &self.files
    }

    pub(crate) fn read_element(&mut self, value: &Value) -> std::result::Result<(), ConfigError> {
        let element = Element::new(ID, value)?;
        let path_host = PathBuf::from(element.string("path-host")?);
        let path_container = PathBuf::from(element.string("path-container")?);
        if !path_container.is_absolute() {
            return Err(element.malformed(format!(
                "\"path-container\" {} is not absolute",
                path_container.display()
            )));
        }
        let read_only = element.optional_bool("read-only")?.unwrap_or(false);
        let create_symlink = element.optional_bool("create-symlink")?.unwrap_or(false);
        let write_buffer = element.optional_bool("write-buffer")?.unwrap_or(false);

        let prefix = element.optional_string("env-var-prefix")?;
        let suffix = element.optional_string("env-var-suffix")?;
        let env = match element.optional_string("env-var-name")? {
            Some(name) if !name.is_empty() => Some(EnvExport {
                name,
                prefix: prefix.unwrap_or_default(),
                suffix: suffix.unwrap_or_default(),
            }),
            Some(_) => return Err(element.malformed("\"env-var-name\" is empty")),
            None if prefix.is_some() || suffix.is_some() => {
                return Err(element.malformed(
                    "\"env-var-prefix\" and \"env-var-suffix\" need \"env-var-name\"",
                ));
            }
            None => None,
        };

        match self
            .files
            .iter_mut()
            .find(|f| f.path_container == path_container)
        {
            Some(existing) if existing.path_host == path_host => {
                existing.read_only &= read_only;
                existing.create_symlink |= create_symlink;
                existing.write_buffer |= write_buffer;
                if existing.env.is_none() {
                    existing.env = env;
                }
            }
            Some(existing) => {
                return Err(element.malformed(format!(
                    "{} is already mapped from {}",
                    path_container.display(),
                    existing.path_host.display()
                )));
            }
            None => self.files.push(FileSetting {
                path_host,
                path_container,
                read_only,
                create_symlink,
                write_buffer,
                env,
            }),
        }
        Ok(())
    }

    pub(crate) fn activate(&mut self, act: &mut Activation<'_>) -> Result<()> {
        for (index, file) in self.files.iter().enumerate() {
            if !file.path_host.exists() {
                return Err(act.error(format!(
                    "host path {} does not exist",
                    file.path_host.display()
                )));
            }
            let target = act.rootfs_path(&file.path_container);

            if file.write_buffer {
                if !file.path_host.is_dir() {
                    return Err(act.error(format!(
                        "write buffer on {} needs a directory",
                        file.path_host.display()
                    )));
                }
                filesystem::create_placeholder(act.log, &target, true)?;
                let scratch_dir = act
                    .host
                    .config
                    .data_dir
                    .join(act.container.id().as_str())
                    .join("overlay")
                    .join(index.to_string());
                let config = OverlayConfig {
                    lower_dir: file.path_host.clone(),
                    scratch_dir,
                    merged_dir: target.clone(),
                };
                mount_overlay(act.log, &config)?;
            } else {
                filesystem::create_placeholder(act.log, &target, file.path_host.is_dir())?;
                mount::bind_mount(act.log, &file.path_host, &target, file.read_only)?;
            }

            if let Some(env) = &file.env {
                let value = format!(
                    "{}{}{}",
                    env.prefix,
                    file.path_container.display(),
                    env.suffix
                );
                act.set_env(&env.name, &value)?;
            }

            if file.create_symlink {
                link_host_path(act, &file.path_host, &file.path_container)?;
            }
            tracing::debug!(
                container = %act.container.id(),
                host = %file.path_host.display(),
                path = %file.path_container.display(),
                read_only = file.read_only,
                write_buffer = file.write_buffer,
                "file mapped"
            );
        }
        Ok(())
    }
}

fn link_host_path(act: &mut Activation<'_>, path_host: &Path, path_container: &Path) -> Result<()> {
    let link = act.rootfs_path(path_host);
    if link.symlink_metadata().is_ok() {
        tracing::warn!(
            link = %link.display(),
            "symlink target already exists in the container, not linking"
        );
        return Ok(());
    }
    filesystem::create_symlink(act.log, path_container, &link)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn element(host: &str, container: &str) -> Value {
        json!({ "path-host": host, "path-container": container })
    }

    #[test]
    fn defaults_are_writable_without_extras() {
        let mut gateway = FileGateway::default();
        gateway.read_element(&element("/srv/data", "/data")).unwrap();
        let file = &gateway.files()[0];
        assert!(!file.read_only);
        assert!(!file.create_symlink);
        assert!(!file.write_buffer);
        assert!(file.env.is_none());
    }

    #[test]
    fn both_paths_are_required_and_non_empty() {
        let mut gateway = FileGateway::default();
        assert!(matches!(
            gateway.read_element(&json!({ "path-container": "/data" })),
            Err(ConfigError::MissingField { field: "path-host", .. })
        ));
        assert!(gateway.read_element(&element("/srv", "")).is_err());
        assert!(gateway.read_element(&element("/srv", "relative")).is_err());
    }

    #[test]
    fn same_mapping_twice_becomes_more_permissive() {
        let mut gateway = FileGateway::default();
        gateway
            .read_element(&json!({
                "path-host": "/srv", "path-container": "/srv", "read-only": true
            }))
            .unwrap();
        gateway
            .read_element(&json!({
                "path-host": "/srv", "path-container": "/srv", "read-only": false
            }))
            .unwrap();
        assert_eq!(gateway.files().len(), 1);
        assert!(!gateway.files()[0].read_only);
    }

    #[test]
    fn container_path_from_another_host_path_is_rejected() {
        let mut gateway = FileGateway::default();
        gateway.read_element(&element("/srv/a", "/data")).unwrap();
        assert!(matches!(
            gateway.read_element(&element("/srv/b", "/data")),
            Err(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn env_prefix_and_suffix_need_a_name() {
        let mut gateway = FileGateway::default();
        let orphan = json!({
            "path-host": "/srv", "path-container": "/srv", "env-var-prefix": "file://"
        });
        assert!(gateway.read_element(&orphan).is_err());

        let named = json!({
            "path-host": "/srv", "path-container": "/srv",
            "env-var-name": "DATA_URL", "env-var-prefix": "file://", "env-var-suffix": "/"
        });
        gateway.read_element(&named).unwrap();
        assert_eq!(
            gateway.files()[0].env,
            Some(EnvExport {
                name: "DATA_URL".to_string(),
                prefix: "file://".to_string(),
                suffix: "/".to_string(),
            })
        );
    }

    #[test]
    fn flags_must_be_booleans() {
        let mut gateway = FileGateway::default();
        let value = json!({ "path-host": "/srv", "path-container": "/srv", "read-only": "yes" });
        assert!(gateway.read_element(&value).is_err());
    }
}
