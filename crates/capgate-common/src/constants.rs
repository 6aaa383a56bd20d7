//! System-wide constants and default paths.

/// Default base directory for capgate state.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/capgate";

/// Path inside the container where the per-container gateway directory is
/// visible. Sockets and bind mounts shared with the container land here.
pub const GATEWAY_MOUNT_POINT: &str = "/gateways";

/// Mount point of the cgroup filesystems, v1 hierarchies and unified.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Default host bridge the container interfaces are attached to.
pub const DEFAULT_BRIDGE: &str = "capgate0";

/// Default gateway address carried by the bridge.
pub const DEFAULT_GATEWAY: [u8; 4] = [10, 0, 3, 1];

/// Default prefix length of the container subnet.
pub const DEFAULT_PREFIX_LEN: u8 = 24;

/// Host firewall chain the container rules are inserted into.
pub const DEFAULT_FIREWALL_CHAIN: &str = "FORWARD";

/// Name of the network interface inside the container.
pub const CONTAINER_INTERFACE: &str = "eth0";

/// Binary spawned for each message bus proxy.
pub const DBUS_PROXY_BINARY: &str = "dbus-proxy";

/// Milliseconds to wait for a proxy socket to appear.
pub const DBUS_SOCKET_TIMEOUT_MS: u64 = 10_000;

