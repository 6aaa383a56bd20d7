//! Gateway lifecycle and network teardown against in-memory doubles.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::sync::Arc;

use serde_json::{Value, json};

use capgate_common::error::{ConfigError, Error, NetworkError};
use capgate_common::types::{Capability, GatewayState};
use capgate_core::cleanup::UndoRecord;
use capgate_core::network::iptables::FirewallRule;
use capgate_gateway::gateways::GatewayKind;
use capgate_gateway::{ContainerHandle, Gateway, HostEnv, Job};

use support::{FakeContainer, FakeFirewall, FakeNetlink, GATEWAY};

fn outgoing_web() -> Vec<Value> {
    vec![json!({
        "direction": "OUTGOING",
        "allow": [
            { "host": "*", "ports": [80, 443], "protocols": "tcp" },
            { "host": "10.0.0.53", "ports": 53, "protocols": ["tcp", "udp"] }
        ]
    })]
}

fn env_gateway() -> Gateway {
    Gateway::new(Capability::Environment, support::host(HostEnv::default(), None))
}

// ── State machine ────────────────────────────────────────────────────

#[test]
fn new_gateway_starts_created() {
    let gateway = env_gateway();
    assert_eq!(gateway.state(), GatewayState::Created);
    assert!(!gateway.is_configured());
    assert!(!gateway.is_activated());
    assert!(!gateway.is_retired());
    assert_eq!(gateway.pending_undo(), 0);
}

#[test]
fn activate_before_configure_is_rejected_without_mutation() {
    let mut gateway = env_gateway();
    gateway.bind_container(FakeContainer::new("c1")).unwrap();

    let err = gateway.activate().unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            expected: GatewayState::Configured,
            actual: GatewayState::Created,
            ..
        }
    ));
    assert_eq!(gateway.state(), GatewayState::Created);
    assert_eq!(gateway.pending_undo(), 0);
}

#[test]
fn activate_without_container_is_rejected() {
    let mut gateway = env_gateway();
    gateway
        .configure(&[json!({ "name": "A", "value": "1" })])
        .unwrap();
    assert!(matches!(gateway.activate(), Err(Error::NoContainer { .. })));
    assert!(gateway.is_configured());
    assert!(!gateway.is_activated());
}

#[test]
fn configure_is_single_shot() {
    let mut gateway = env_gateway();
    gateway
        .configure(&[json!({ "name": "A", "value": "1" })])
        .unwrap();
    let err = gateway
        .configure(&[json!({ "name": "B", "value": "2" })])
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Config(ConfigError::AlreadyConfigured { .. })
    ));
}

#[test]
fn failed_configure_keeps_created_state() {
    let mut gateway = env_gateway();
    let err = gateway
        .configure(&[
            json!({ "name": "A", "value": "1" }),
            json!({ "name": "A", "value": "2" }),
        ])
        .unwrap_err();
    assert!(err.is_config());
    assert_eq!(gateway.state(), GatewayState::Created);
    let GatewayKind::Environment(env) = gateway.kind() else {
        panic!("wrong kind");
    };
    assert!(env.vars().is_empty());

    gateway
        .configure(&[json!({ "name": "A", "value": "1" })])
        .unwrap();
    assert!(gateway.is_configured());
}

#[test]
fn second_container_binding_is_rejected() {
    let mut gateway = env_gateway();
    assert!(!gateway.has_container());
    gateway.bind_container(FakeContainer::new("c1")).unwrap();
    assert!(gateway.has_container());
    let err = gateway.bind_container(FakeContainer::new("c2")).unwrap_err();
    assert!(matches!(err, Error::ContainerAlreadyBound { .. }));
    assert_eq!(gateway.container().unwrap().id().as_str(), "c1");
}

#[test]
fn teardown_is_idempotent_and_retires_the_gateway() {
    let container = FakeContainer::new("c1");
    let mut gateway = env_gateway();
    gateway.bind_container(Arc::<FakeContainer>::clone(&container)).unwrap();
    gateway
        .configure(&[json!({ "name": "LANG", "value": "C" })])
        .unwrap();
    gateway.activate().unwrap();
    assert!(gateway.is_activated());
    assert_eq!(container.env("LANG").as_deref(), Some("C"));

    gateway.teardown().unwrap();
    gateway.teardown().unwrap();
    assert!(gateway.is_retired());
    assert!(!gateway.is_activated());
    assert!(matches!(gateway.activate(), Err(Error::Retired { .. })));
}

#[test]
fn jobs_and_environment_go_through_the_bound_container() {
    let container = FakeContainer::new("c1").with_env("PATH", "/bin");
    let mut gateway = env_gateway();
    assert!(matches!(
        gateway.execute_in_container(Job::Command("true".to_string())),
        Err(Error::NoContainer { .. })
    ));
    gateway.bind_container(Arc::<FakeContainer>::clone(&container)).unwrap();

    assert_eq!(gateway.execute_in_container(Job::function(|| 7)).unwrap(), 7);
    assert_eq!(
        gateway
            .execute_in_container(Job::Command("ls /".to_string()))
            .unwrap(),
        0
    );
    assert_eq!(container.commands(), vec!["ls /".to_string()]);

    gateway.set_environment_variable("TERM", "dumb").unwrap();
    assert_eq!(container.env("TERM").as_deref(), Some("dumb"));
}

#[test]
fn append_extends_the_container_value() {
    let container = FakeContainer::new("c1").with_env("PATH", "/bin");
    let mut gateway = env_gateway();
    gateway.bind_container(Arc::<FakeContainer>::clone(&container)).unwrap();
    gateway
        .configure(&[json!({ "name": "PATH", "value": ":/opt/bin", "append": true })])
        .unwrap();
    gateway.activate().unwrap();
    assert_eq!(container.env("PATH").as_deref(), Some("/bin:/opt/bin"));
}

// ── Host-service gateways ────────────────────────────────────────────

#[test]
fn audio_without_host_server_fails_before_any_mutation() {
    let mut gateway = Gateway::new(
        Capability::PulseAudio,
        support::host(HostEnv::default(), None),
    );
    gateway.bind_container(FakeContainer::new("c1")).unwrap();
    gateway.configure(&[json!({ "audio": true })]).unwrap();
    let err = gateway.activate().unwrap_err();
    assert!(matches!(err, Error::Activation { .. }));
    assert_eq!(gateway.pending_undo(), 0);
    gateway.teardown().unwrap();
}

#[test]
fn disabled_audio_activates_without_touching_the_host() {
    let container = FakeContainer::new("c1");
    let mut gateway = Gateway::new(
        Capability::PulseAudio,
        support::host(HostEnv::default(), None),
    );
    gateway.bind_container(Arc::<FakeContainer>::clone(&container)).unwrap();
    gateway.configure(&[json!({ "audio": false })]).unwrap();
    gateway.activate().unwrap();
    assert_eq!(gateway.pending_undo(), 0);
    assert!(container.env("PULSE_SERVER").is_none());
}

#[test]
fn session_bus_without_host_address_is_an_error() {
    let mut gateway = Gateway::new(Capability::DBus, support::host(HostEnv::default(), None));
    gateway.bind_container(FakeContainer::new("c1")).unwrap();
    gateway
        .configure(&[json!({ "dbus-gateway-config-session": [] })])
        .unwrap();
    assert!(matches!(gateway.activate(), Err(Error::Activation { .. })));
    assert_eq!(gateway.pending_undo(), 0);
}

#[test]
fn display_needs_a_runtime_dir() {
    let mut gateway = Gateway::new(Capability::Wayland, support::host(HostEnv::default(), None));
    gateway.bind_container(FakeContainer::new("c1")).unwrap();
    gateway.configure(&[json!({})]).unwrap();
    assert!(matches!(gateway.activate(), Err(Error::Activation { .. })));
}

#[test]
fn cgroup_limits_are_written_normalized() {
    let container = FakeContainer::new("c1");
    let mut gateway = Gateway::new(Capability::Cgroups, support::host(HostEnv::default(), None));
    gateway.bind_container(Arc::<FakeContainer>::clone(&container)).unwrap();
    gateway
        .configure(&[
            json!({ "setting": "memory.limit_in_bytes", "value": "100m" }),
            json!({ "setting": "cpu.shares", "value": 512 }),
        ])
        .unwrap();
    gateway.activate().unwrap();

    let memory = container.cgroup_file("memory.limit_in_bytes");
    let cpu = container.cgroup_file("cpu.shares");
    assert!(memory.ends_with("memory/c1/memory.limit_in_bytes"));
    assert!(cpu.ends_with("cpu,cpuacct/c1/cpu.shares"));
    assert_eq!(std::fs::read_to_string(memory).unwrap(), "104857600");
    assert_eq!(std::fs::read_to_string(cpu).unwrap(), "512");
    assert_eq!(gateway.pending_undo(), 0);
}

#[test]
fn unavailable_cgroup_controller_fails_activation() {
    let container = FakeContainer::new("c1");
    let mut gateway = Gateway::new(Capability::Cgroups, support::host(HostEnv::default(), None));
    gateway.bind_container(Arc::<FakeContainer>::clone(&container)).unwrap();
    gateway
        .configure(&[json!({ "setting": "memory.memsw.limit_in_bytes", "value": "1g" })])
        .unwrap();

    let err = gateway.activate().unwrap_err();
    assert!(matches!(err, Error::CgroupController { .. }));
    assert!(!container.cgroup_file("memory.memsw.limit_in_bytes").exists());
}

// ── Network ──────────────────────────────────────────────────────────

#[test]
fn network_activation_is_fully_reversed_by_teardown() {
    let firewall = FakeFirewall::default();
    let chain = Arc::clone(&firewall.chain);
    let chain_name = support::settings(24).chain;
    let host_rule = FirewallRule::new(&chain_name, vec!["-j".into(), "ACCEPT".into()]);
    chain.lock().push(host_rule.clone());
    let (network, netlink) = support::host_network(24, firewall);
    let links_before = netlink.state.lock().links.len();
    let available_before = network.available();

    let container = FakeContainer::new("c1");
    let mut gateway = Gateway::new(
        Capability::Network,
        support::host(HostEnv::default(), Some(Arc::clone(&network))),
    );
    gateway.bind_container(Arc::<FakeContainer>::clone(&container)).unwrap();
    gateway.configure(&outgoing_web()).unwrap();
    gateway.activate().unwrap();

    let GatewayKind::Network(net) = gateway.kind() else {
        panic!("wrong kind");
    };
    let assignment = net.assignment().unwrap().clone();
    // Three allow rules (the dns rule once per protocol) and the default,
    // in configuration order and ahead of the rule already on the host.
    let mut expected = net.firewall_rules(&chain_name, &assignment.host_interface);
    assert_eq!(expected.len(), 4);
    expected.push(host_rule.clone());
    assert_eq!(*chain.lock(), expected);
    assert_eq!(network.allocated(), 1);
    {
        let state = netlink.state.lock();
        assert!(state.links.contains(&assignment.host_interface));
        assert!(state.links.contains("eth0"));
        assert!(state
            .addresses
            .contains(&("eth0".to_string(), assignment.address)));
        assert_eq!(state.routes, vec![GATEWAY]);
    }
    assert!(matches!(
        gateway.undo_records().first(),
        Some(UndoRecord::ReleaseAddress(a)) if *a == assignment.address
    ));

    gateway.teardown().unwrap();
    assert_eq!(*chain.lock(), vec![host_rule]);
    assert_eq!(network.available(), available_before);
    let state = netlink.state.lock();
    assert_eq!(state.links.len(), links_before);
    assert!(!state.addresses.iter().any(|(name, _)| name == "eth0"));
}

#[test]
fn partial_activation_is_reversed_by_teardown() {
    let firewall = FakeFirewall {
        fail_after: Some(1),
        ..FakeFirewall::default()
    };
    let chain = Arc::clone(&firewall.chain);
    let (network, netlink) = support::host_network(24, firewall);
    let links_before = netlink.state.lock().links.len();

    let mut gateway = Gateway::new(
        Capability::Network,
        support::host(HostEnv::default(), Some(Arc::clone(&network))),
    );
    gateway.bind_container(FakeContainer::new("c1")).unwrap();
    gateway.configure(&outgoing_web()).unwrap();

    let err = gateway.activate().unwrap_err();
    assert!(matches!(err, Error::Network(NetworkError::Firewall { .. })));
    assert_eq!(gateway.state(), GatewayState::Configured);
    assert_eq!(chain.lock().len(), 1);

    gateway.teardown().unwrap();
    assert!(chain.lock().is_empty());
    assert_eq!(network.allocated(), 0);
    assert_eq!(netlink.state.lock().links.len(), links_before);
}

#[test]
fn failure_inside_the_container_keeps_earlier_records() {
    let netlink = FakeNetlink {
        fail_on: Some("add address"),
        ..FakeNetlink::with_bridge(&support::settings(24).bridge, GATEWAY)
    };
    let (network, netlink) = support::host_network_with(24, FakeFirewall::default(), netlink);

    let mut gateway = Gateway::new(
        Capability::Network,
        support::host(HostEnv::default(), Some(Arc::clone(&network))),
    );
    gateway.bind_container(FakeContainer::new("c1")).unwrap();
    gateway.configure(&outgoing_web()).unwrap();

    assert!(matches!(gateway.activate(), Err(Error::Exec { .. })));
    assert!(matches!(
        gateway.undo_records(),
        [UndoRecord::ReleaseAddress(_), UndoRecord::DeleteLink { .. }]
    ));
    gateway.teardown().unwrap();
    assert_eq!(network.allocated(), 0);
    assert!(!netlink.state.lock().links.contains("eth0"));
}

#[test]
fn missing_bridge_fails_before_allocation() {
    let (network, _netlink) =
        support::host_network_with(24, FakeFirewall::default(), FakeNetlink::default());
    let mut gateway = Gateway::new(
        Capability::Network,
        support::host(HostEnv::default(), Some(Arc::clone(&network))),
    );
    gateway.bind_container(FakeContainer::new("c1")).unwrap();
    gateway.configure(&outgoing_web()).unwrap();

    assert!(matches!(
        gateway.activate(),
        Err(Error::Network(NetworkError::BridgeUnavailable { .. }))
    ));
    assert_eq!(gateway.pending_undo(), 0);
    assert_eq!(network.allocated(), 0);
}

#[test]
fn exhausted_pool_is_retryable_and_shared_between_containers() {
    // A /30 leaves one address besides the gateway.
    let (network, _netlink) = support::host_network(30, FakeFirewall::default());
    let host = support::host(HostEnv::default(), Some(Arc::clone(&network)));

    let mut first = Gateway::new(Capability::Network, Arc::clone(&host));
    first.bind_container(FakeContainer::new("c1")).unwrap();
    first.configure(&outgoing_web()).unwrap();
    first.activate().unwrap();

    let mut second = Gateway::new(Capability::Network, Arc::clone(&host));
    second.bind_container(FakeContainer::new("c2")).unwrap();
    second.configure(&outgoing_web()).unwrap();
    let err = second.activate().unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(second.pending_undo(), 0);
    second.teardown().unwrap();

    first.teardown().unwrap();
    assert_eq!(network.available(), 1);
}

#[test]
fn equal_configuration_gives_equal_interface() {
    let mut names = Vec::new();
    for _ in 0..2 {
        let (network, _netlink) = support::host_network(24, FakeFirewall::default());
        let mut gateway = Gateway::new(
            Capability::Network,
            support::host(HostEnv::default(), Some(network)),
        );
        gateway.bind_container(FakeContainer::new("c1")).unwrap();
        gateway.configure(&outgoing_web()).unwrap();
        gateway.activate().unwrap();
        let GatewayKind::Network(net) = gateway.kind() else {
            panic!("wrong kind");
        };
        names.push(net.assignment().unwrap().clone());
        gateway.teardown().unwrap();
    }
    assert_eq!(names[0], names[1]);
}
