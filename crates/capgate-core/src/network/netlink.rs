//! Interface configuration over netlink.
//!
//! [`Netlink`] is the synchronous surface the network gateway uses.
//! [`RtNetlink`] implements it with `rtnetlink`, opening a fresh
//! connection per request on a current-thread runtime. A connection binds
//! to the network namespace of the calling thread, so the same backend
//! configures the host when called on the host and the container when
//! called from a job running inside the container.

use std::net::Ipv4Addr;

use capgate_common::error::Result;

/// Network interface operations.
pub trait Netlink: Send + Sync {
    /// Creates a veth pair named `host` and `peer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pair cannot be created.
    fn create_veth_pair(&self, host: &str, peer: &str) -> Result<()>;

    /// Sets `name` up.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is missing or cannot be changed.
    fn set_link_up(&self, name: &str) -> Result<()>;

    /// Enslaves `name` to `bridge`.
    ///
    /// # Errors
    ///
    /// Returns an error if either link is missing.
    fn attach_to_bridge(&self, name: &str, bridge: &str) -> Result<()>;

    /// Moves `name` into the network namespace of process `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the link or process is missing.
    fn move_to_namespace(&self, name: &str, pid: u32) -> Result<()>;

    /// Renames a link that is down.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is missing or up.
    fn rename_link(&self, from: &str, to: &str) -> Result<()>;

    /// Assigns `address/prefix_len` to `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be assigned.
    fn add_address(&self, name: &str, address: Ipv4Addr, prefix_len: u8) -> Result<()>;

    /// Removes `address/prefix_len` from `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be removed.
    fn del_address(&self, name: &str, address: Ipv4Addr, prefix_len: u8) -> Result<()>;

    /// Installs a default route through `gateway`.
    ///
    /// # Errors
    ///
    /// Returns an error if the route cannot be added.
    fn add_default_route(&self, gateway: Ipv4Addr) -> Result<()>;

    /// Deletes a link. Deleting either end of a veth pair removes both.
    ///
    /// # Errors
    ///
    /// Returns an error if the link exists but cannot be deleted.
    fn delete_link(&self, name: &str) -> Result<()>;

    /// Returns `true` if `name` exists and carries `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn has_address(&self, name: &str, address: Ipv4Addr) -> Result<bool>;
}

/// Deterministic veth names derived from the container address.
///
/// Both names fit the 15 byte interface name limit.
#[must_use]
pub fn veth_names(address: Ipv4Addr) -> (String, String) {
    let tag = u32::from(address);
    (format!("cgh{tag:08x}"), format!("cgp{tag:08x}"))
}

#[cfg(target_os = "linux")]
pub use linux::RtNetlink;

#[cfg(target_os = "linux")]
mod linux {
    use std::future::Future;
    use std::net::{IpAddr, Ipv4Addr};

    use futures::stream::TryStreamExt;
    use nix::errno::Errno;
    use rtnetlink::{Handle, new_connection};

    use capgate_common::error::{NetworkError, Result};

    use super::Netlink;

    /// Netlink backend built on `rtnetlink`.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct RtNetlink;

    impl RtNetlink {
        /// Creates the backend.
        #[must_use]
        pub const fn new() -> Self {
            Self
        }

        fn run<F, Fut, T>(operation: &'static str, request: F) -> Result<T>
        where
            F: FnOnce(Handle) -> Fut,
            Fut: Future<Output = Result<T>>,
        {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| NetworkError::netlink(operation, e))?;
            runtime.block_on(async {
                let (connection, handle, _) =
                    new_connection().map_err(|e| NetworkError::netlink(operation, e))?;
                let _connection = tokio::spawn(connection);
                request(handle).await
            })
        }
    }

    async fn link_index(handle: &Handle, operation: &'static str, name: &str) -> Result<u32> {
        find_link(handle, operation, name).await?.ok_or_else(|| {
            NetworkError::netlink(operation, format!("link {name} not found")).into()
        })
    }

    async fn find_link(
        handle: &Handle,
        operation: &'static str,
        name: &str,
    ) -> Result<Option<u32>> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(link) => Ok(link.map(|l| l.header.index)),
            // The kernel answers a name lookup for a missing link with ENODEV.
            Err(rtnetlink::Error::NetlinkError(msg))
                if msg.raw_code() == -(Errno::ENODEV as i32) =>
            {
                Ok(None)
            }
            Err(e) => Err(NetworkError::netlink(operation, e).into()),
        }
    }

    impl Netlink for RtNetlink {
        fn create_veth_pair(&self, host: &str, peer: &str) -> Result<()> {
            Self::run("create veth", |handle| async move {
                handle
                    .link()
                    .add()
                    .veth(host.to_string(), peer.to_string())
                    .execute()
                    .await
                    .map_err(|e| NetworkError::netlink("create veth", e))?;
                tracing::debug!(host, peer, "veth pair created");
                Ok(())
            })
        }

        fn set_link_up(&self, name: &str) -> Result<()> {
            Self::run("link up", |handle| async move {
                let index = link_index(&handle, "link up", name).await?;
                handle
                    .link()
                    .set(index)
                    .up()
                    .execute()
                    .await
                    .map_err(|e| NetworkError::netlink("link up", e))?;
                Ok(())
            })
        }

        fn attach_to_bridge(&self, name: &str, bridge: &str) -> Result<()> {
            Self::run("attach to bridge", |handle| async move {
                let bridge_index = link_index(&handle, "attach to bridge", bridge).await?;
                let index = link_index(&handle, "attach to bridge", name).await?;
                handle
                    .link()
                    .set(index)
                    .controller(bridge_index)
                    .execute()
                    .await
                    .map_err(|e| NetworkError::netlink("attach to bridge", e))?;
                tracing::debug!(name, bridge, "link attached to bridge");
                Ok(())
            })
        }

        fn move_to_namespace(&self, name: &str, pid: u32) -> Result<()> {
            Self::run("move to namespace", |handle| async move {
                let index = link_index(&handle, "move to namespace", name).await?;
                handle
                    .link()
                    .set(index)
                    .setns_by_pid(pid)
                    .execute()
                    .await
                    .map_err(|e| NetworkError::netlink("move to namespace", e))?;
                tracing::debug!(name, pid, "link moved into namespace");
                Ok(())
            })
        }

        fn rename_link(&self, from: &str, to: &str) -> Result<()> {
            Self::run("rename link", |handle| async move {
                let index = link_index(&handle, "rename link", from).await?;
                handle
                    .link()
                    .set(index)
                    .name(to.to_string())
                    .execute()
                    .await
                    .map_err(|e| NetworkError::netlink("rename link", e))?;
                Ok(())
            })
        }

        fn add_address(&self, name: &str, address: Ipv4Addr, prefix_len: u8) -> Result<()> {
            Self::run("add address", |handle| async move {
                let index = link_index(&handle, "add address", name).await?;
                handle
                    .address()
                    .add(index, IpAddr::V4(address), prefix_len)
                    .execute()
                    .await
                    .map_err(|e| NetworkError::netlink("add address", e))?;
                tracing::debug!(name, address = %address, prefix_len, "address assigned");
                Ok(())
            })
        }

        fn del_address(&self, name: &str, address: Ipv4Addr, prefix_len: u8) -> Result<()> {
            Self::run("remove address", |handle| async move {
                let Some(index) = find_link(&handle, "remove address", name).await? else {
                    tracing::warn!(name, "link already gone, address removed with it");
                    return Ok(());
                };
                let mut addresses = handle
                    .address()
                    .get()
                    .set_link_index_filter(index)
                    .set_address_filter(IpAddr::V4(address))
                    .set_prefix_length_filter(prefix_len)
                    .execute();
                while let Some(message) = addresses
                    .try_next()
                    .await
                    .map_err(|e| NetworkError::netlink("remove address", e))?
                {
                    handle
                        .address()
                        .del(message)
                        .execute()
                        .await
                        .map_err(|e| NetworkError::netlink("remove address", e))?;
                }
                Ok(())
            })
        }

        fn add_default_route(&self, gateway: Ipv4Addr) -> Result<()> {
            Self::run("add route", |handle| async move {
                handle
                    .route()
                    .add()
                    .v4()
                    .gateway(gateway)
                    .execute()
                    .await
                    .map_err(|e| NetworkError::netlink("add route", e))?;
                tracing::debug!(gateway = %gateway, "default route installed");
                Ok(())
            })
        }

        fn delete_link(&self, name: &str) -> Result<()> {
            Self::run("delete link", |handle| async move {
                let Some(index) = find_link(&handle, "delete link", name).await? else {
                    tracing::warn!(name, "link already gone");
                    return Ok(());
                };
                handle
                    .link()
                    .del(index)
                    .execute()
                    .await
                    .map_err(|e| NetworkError::netlink("delete link", e))?;
                tracing::debug!(name, "link deleted");
                Ok(())
            })
        }

        fn has_address(&self, name: &str, address: Ipv4Addr) -> Result<bool> {
            Self::run("query address", |handle| async move {
                let Some(index) = find_link(&handle, "query address", name).await? else {
                    return Ok(false);
                };
                let mut addresses = handle
                    .address()
                    .get()
                    .set_link_index_filter(index)
                    .set_address_filter(IpAddr::V4(address))
                    .execute();
                let found = addresses
                    .try_next()
                    .await
                    .map_err(|e| NetworkError::netlink("query address", e))?
                    .is_some();
                Ok(found)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veth_names_are_derived_from_the_address() {
        let (host, peer) = veth_names(Ipv4Addr::new(10, 0, 3, 2));
        assert_eq!(host, "cgh0a000302");
        assert_eq!(peer, "cgp0a000302");
        assert!(host.len() <= 15);
    }
}
