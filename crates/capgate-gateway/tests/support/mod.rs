//! In-memory container, netlink and firewall doubles.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use capgate_common::config::{HostConfig, NetworkSettings};
use capgate_common::error::{Error, NetworkError, Result};
use capgate_common::types::ContainerId;
use capgate_core::cgroup::{CgroupManager, Membership};
use capgate_core::network::iptables::{Firewall, FirewallRule};
use capgate_core::network::netlink::Netlink;
use capgate_gateway::{ContainerHandle, HostContext, HostEnv, HostNetwork, Job};

/// Hybrid layout: memory and cpu on v1 hierarchies, the rest unified.
const CGROUP_MEMBERSHIP: &str = "5:memory:/c1\n4:cpu,cpuacct:/c1\n1:name=systemd:/c1\n0::/c1\n";

/// Controller files present in the fake cgroup mount.
const CGROUP_FILES: [&str; 3] = ["memory.limit_in_bytes", "cpu.shares", "pids.max"];

/// Container that runs function jobs inline and records everything else.
pub struct FakeContainer {
    id: ContainerId,
    root: tempfile::TempDir,
    rootfs: PathBuf,
    gateway_dir: PathBuf,
    cgroup: PathBuf,
    env: Mutex<BTreeMap<String, String>>,
    commands: Mutex<Vec<String>>,
}

impl FakeContainer {
    pub fn new(id: &str) -> Arc<Self> {
        let root = tempfile::tempdir().unwrap();
        let rootfs = root.path().join("rootfs");
        let gateway_dir = root.path().join("gateways");
        let cgroup = root.path().join("cgroup");
        for dir in [&rootfs, &gateway_dir, &cgroup] {
            std::fs::create_dir_all(dir).unwrap();
        }
        let container = Self {
            id: ContainerId::new(id),
            root,
            rootfs,
            gateway_dir,
            cgroup,
            env: Mutex::new(BTreeMap::new()),
            commands: Mutex::new(Vec::new()),
        };
        for setting in CGROUP_FILES {
            let file = container.cgroup_file(setting);
            std::fs::create_dir_all(file.parent().unwrap()).unwrap();
            std::fs::write(file, "").unwrap();
        }
        Arc::new(container)
    }

    pub fn with_env(self: Arc<Self>, name: &str, value: &str) -> Arc<Self> {
        let _previous = self.env.lock().insert(name.to_string(), value.to_string());
        self
    }

    pub fn env(&self, name: &str) -> Option<String> {
        self.env.lock().get(name).cloned()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Where the controller file `setting` lives in the fake mount.
    pub fn cgroup_file(&self, setting: &str) -> PathBuf {
        self.cgroups().unwrap().controller_dir(setting).unwrap().join(setting)
    }
}

impl ContainerHandle for FakeContainer {
    fn id(&self) -> &ContainerId {
        &self.id
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    fn gateway_dir(&self) -> &Path {
        &self.gateway_dir
    }

    fn cgroups(&self) -> Result<CgroupManager> {
        Ok(CgroupManager::with_membership(
            &self.cgroup,
            Membership::parse(CGROUP_MEMBERSHIP),
        ))
    }

    fn execute(&self, job: Job) -> Result<i32> {
        match job {
            Job::Command(command) => {
                self.commands.lock().push(command);
                Ok(0)
            }
            Job::Function(f) => Ok(f()),
        }
    }

    fn set_environment_variable(&self, name: &str, value: &str) -> Result<()> {
        let _previous = self.env.lock().insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn environment_variable(&self, name: &str) -> Option<String> {
        self.env(name)
    }
}

/// Links and addresses as the netlink double sees them.
#[derive(Debug, Default)]
pub struct NetState {
    pub links: BTreeSet<String>,
    pub addresses: BTreeSet<(String, Ipv4Addr)>,
    pub routes: Vec<Ipv4Addr>,
}

/// Netlink double keeping all links in one namespace.
#[derive(Default)]
pub struct FakeNetlink {
    pub state: Mutex<NetState>,
    pub fail_on: Option<&'static str>,
}

impl FakeNetlink {
    pub fn with_bridge(bridge: &str, gateway: Ipv4Addr) -> Self {
        let netlink = Self::default();
        {
            let mut state = netlink.state.lock();
            let _new = state.links.insert(bridge.to_string());
            let _new = state.addresses.insert((bridge.to_string(), gateway));
        }
        netlink
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.fail_on == Some(operation) {
            return Err(NetworkError::Netlink {
                operation,
                message: "injected failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl Netlink for FakeNetlink {
    fn create_veth_pair(&self, host: &str, peer: &str) -> Result<()> {
        self.check("create veth pair")?;
        let mut state = self.state.lock();
        let _new = state.links.insert(host.to_string());
        let _new = state.links.insert(peer.to_string());
        Ok(())
    }

    fn set_link_up(&self, _name: &str) -> Result<()> {
        self.check("set link up")
    }

    fn attach_to_bridge(&self, _name: &str, _bridge: &str) -> Result<()> {
        self.check("attach to bridge")
    }

    fn move_to_namespace(&self, _name: &str, _pid: u32) -> Result<()> {
        self.check("move to namespace")
    }

    fn rename_link(&self, from: &str, to: &str) -> Result<()> {
        self.check("rename link")?;
        let mut state = self.state.lock();
        let _removed = state.links.remove(from);
        let _new = state.links.insert(to.to_string());
        Ok(())
    }

    fn add_address(&self, name: &str, address: Ipv4Addr, _prefix_len: u8) -> Result<()> {
        self.check("add address")?;
        let _new = self.state.lock().addresses.insert((name.to_string(), address));
        Ok(())
    }

    fn del_address(&self, name: &str, address: Ipv4Addr, _prefix_len: u8) -> Result<()> {
        let _removed = self
            .state
            .lock()
            .addresses
            .remove(&(name.to_string(), address));
        Ok(())
    }

    fn add_default_route(&self, gateway: Ipv4Addr) -> Result<()> {
        self.check("add default route")?;
        self.state.lock().routes.push(gateway);
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let _removed = state.links.remove(name);
        // The peer went with the pair; it was renamed inside the container.
        let _removed = state.links.remove("eth0");
        Ok(())
    }

    fn has_address(&self, name: &str, address: Ipv4Addr) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .addresses
            .contains(&(name.to_string(), address)))
    }
}

/// Firewall double sharing its chain with the test.
#[derive(Clone, Default)]
pub struct FakeFirewall {
    pub chain: Arc<Mutex<Vec<FirewallRule>>>,
    pub fail_after: Option<usize>,
}

impl Firewall for FakeFirewall {
    fn insert(&mut self, rule: &FirewallRule, position: usize) -> Result<()> {
        let mut chain = self.chain.lock();
        if self.fail_after.is_some_and(|limit| chain.len() >= limit) {
            return Err(NetworkError::Firewall {
                command: format!("insert {rule}"),
                message: "injected failure".to_string(),
            }
            .into());
        }
        let index = position.saturating_sub(1).min(chain.len());
        chain.insert(index, rule.clone());
        Ok(())
    }

    fn delete(&mut self, rule: &FirewallRule) -> Result<()> {
        let mut chain = self.chain.lock();
        let Some(index) = chain.iter().position(|r| r == rule) else {
            return Err(Error::activation("network", format!("no rule {rule}")));
        };
        let _removed = chain.remove(index);
        Ok(())
    }
}

pub const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 3, 1);

pub fn settings(prefix_len: u8) -> NetworkSettings {
    NetworkSettings {
        gateway: GATEWAY,
        prefix_len,
        ..NetworkSettings::default()
    }
}

/// Host network over the doubles, plus handles to inspect them.
pub fn host_network(
    prefix_len: u8,
    firewall: FakeFirewall,
) -> (Arc<HostNetwork>, Arc<FakeNetlink>) {
    let netlink = FakeNetlink::with_bridge(&settings(prefix_len).bridge, GATEWAY);
    host_network_with(prefix_len, firewall, netlink)
}

/// Like [`host_network`] with a prepared netlink double.
pub fn host_network_with(
    prefix_len: u8,
    firewall: FakeFirewall,
    netlink: FakeNetlink,
) -> (Arc<HostNetwork>, Arc<FakeNetlink>) {
    let netlink = Arc::new(netlink);
    let backend: Arc<dyn Netlink> = Arc::clone(&netlink) as Arc<dyn Netlink>;
    let network = HostNetwork::new(settings(prefix_len), Box::new(firewall), backend).unwrap();
    (Arc::new(network), netlink)
}

pub fn host(env: HostEnv, network: Option<Arc<HostNetwork>>) -> Arc<HostContext> {
    let context = HostContext::new(HostConfig::default(), env);
    Arc::new(match network {
        Some(network) => context.with_network(network),
        None => context,
    })
}
