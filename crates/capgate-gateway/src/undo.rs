//! Undo executor with access to the host network and the container.

use capgate_common::error::{Error, NetworkError, Result};
use capgate_core::cleanup::{LocalUndo, Undo, UndoRecord};

use crate::container::{ContainerHandle, Job};
use crate::host::HostNetwork;

/// Runs filesystem records locally, network records against the shared
/// host network, and address removal inside the container.
pub(crate) struct HostUndo<'a> {
    pub(crate) network: Option<&'a HostNetwork>,
    pub(crate) container: Option<&'a dyn ContainerHandle>,
}

impl HostUndo<'_> {
    fn network(&self, record: &UndoRecord) -> Result<&HostNetwork> {
        self.network.ok_or_else(|| {
            NetworkError::Settings {
                message: format!("no host network to run \"{record}\""),
            }
            .into()
        })
    }
}

impl Undo for HostUndo<'_> {
    fn undo(&self, record: &UndoRecord) -> Result<()> {
        match record {
            UndoRecord::ReleaseAddress(address) => self.network(record)?.release(*address),
            UndoRecord::DeleteLink { name } => self.network(record)?.netlink().delete_link(name),
            UndoRecord::DeleteRule(rule) => self.network(record)?.firewall().delete(rule),
            UndoRecord::RemoveAddress {
                interface,
                address,
                prefix_len,
            } => {
                let netlink = self.network(record)?.netlink();
                let Some(container) = self.container else {
                    return Err(Error::activation(
                        "network",
                        format!("no container to run \"{record}\""),
                    ));
                };
                let name = interface.clone();
                let (address, prefix_len) = (*address, *prefix_len);
                let status = container.execute(Job::function(move || {
                    match netlink.del_address(&name, address, prefix_len) {
                        Ok(()) => 0,
                        Err(e) => {
                            tracing::error!(error = %e, "address removal failed in container");
                            1
                        }
                    }
                }))?;
                if status == 0 {
                    Ok(())
                } else {
                    Err(Error::Exec {
                        container: container.id().clone(),
                        message: format!(
                            "removing {address}/{prefix_len} from {interface} exited with {status}"
                        ),
                    })
                }
            }
            _ => LocalUndo.undo(record),
        }
    }
}
