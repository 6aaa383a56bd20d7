//! Network gateway.
//!
//! Each element becomes one [`IPTableEntry`]:
//!
//! ```json
//! { "direction": "OUTGOING",
//!   "allow": [ { "host": "example.com", "ports": [80, 443], "protocols": "tcp" } ] }
//! ```
//!
//! Activation gives the container an address from the shared pool, a veth
//! pair bridged on the host and renamed to `eth0` inside, a default route,
//! and the firewall rules of every entry scoped to the host end of the
//! pair.

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde_json::Value;

use capgate_common::constants::CONTAINER_INTERFACE;
use capgate_common::error::{ConfigError, Result};
use capgate_core::cleanup::UndoRecord;
use capgate_core::network::iptables::{
    Direction, FirewallRule, IPTableEntry, PortFilter, Protocol, Rule, Target,
};
use capgate_core::network::netlink::veth_names;

use crate::container::Job;
use crate::element::Element;
use crate::gateway::Activation;

const ID: &str = "network";

/// Network configuration and, once activated, the assigned interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkGateway {
    entries: Vec<IPTableEntry>,
    assigned: Option<Assignment>,
}

/// Interface and address given to the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Container address.
    pub address: Ipv4Addr,
    /// Host end of the veth pair.
    pub host_interface: String,
}

impl NetworkGateway {
    /// Parsed entries, in configuration order.
    #[must_use]
    pub fn entries(&self) -> &[IPTableEntry] {
        &self.entries
    }

    /// Interface and address assigned during activation.
    #[must_use]
    pub const fn assignment(&self) -> Option<&Assignment> {
        self.assigned.as_ref()
    }

    /// Firewall rules of all entries for a given host interface, in
    /// insertion order.
    #[must_use]
    pub fn firewall_rules(&self, chain: &str, host_interface: &str) -> Vec<FirewallRule> {
        self.entries
            .iter()
            .flat_map(|entry| entry.firewall_rules(chain, host_interface))
            .collect()
    }

    pub(crate) fn read_element(&mut self, value: &Value) -> std::result::Result<(), ConfigError> {
        let element = Element::new(ID, value)?;
        let direction: Direction = element
            .string("direction")?
            .parse()
            .map_err(|e: String| element.malformed(e))?;
        let mut entry = IPTableEntry::new(direction);
        for rule in element.array("allow")? {
            entry.rules.push(parse_rule(rule)?);
        }
        self.entries.push(entry);
        Ok(())
    }

    pub(crate) fn activate(&mut self, act: &mut Activation<'_>) -> Result<()> {
        let network = act.network()?;
        network.check_bridge()?;
        let settings = network.settings().clone();
        let netlink = network.netlink();

        let address = network.allocate()?;
        act.log.push(UndoRecord::ReleaseAddress(address));

        let (host_if, peer_if) = veth_names(address);
        netlink.create_veth_pair(&host_if, &peer_if)?;
        act.log.push(UndoRecord::DeleteLink {
            name: host_if.clone(),
        });
        netlink.attach_to_bridge(&host_if, &settings.bridge)?;
        netlink.set_link_up(&host_if)?;
        netlink.move_to_namespace(&peer_if, act.container.pid())?;

        let prefix_len = settings.prefix_len;
        let inner = Arc::clone(&netlink);
        act.run(
            "interface setup",
            Job::function(move || {
                let steps = || -> Result<()> {
                    inner.set_link_up("lo")?;
                    inner.rename_link(&peer_if, CONTAINER_INTERFACE)?;
                    inner.set_link_up(CONTAINER_INTERFACE)?;
                    inner.add_address(CONTAINER_INTERFACE, address, prefix_len)
                };
                exit_status(steps())
            }),
        )?;
        act.log.push(UndoRecord::RemoveAddress {
            interface: CONTAINER_INTERFACE.to_string(),
            address,
            prefix_len,
        });

        let gateway = settings.gateway;
        let inner = Arc::clone(&netlink);
        act.run(
            "default route",
            Job::function(move || exit_status(inner.add_default_route(gateway))),
        )?;

        let rules = self.firewall_rules(&settings.chain, &host_if);
        {
            let mut firewall = network.firewall();
            for (index, rule) in rules.iter().enumerate() {
                firewall.insert(rule, index + 1)?;
                act.log.push(UndoRecord::DeleteRule(rule.clone()));
            }
        }

        tracing::info!(
            container = %act.container.id(),
            address = %address,
            interface = %host_if,
            rules = rules.len(),
            "container network configured"
        );
        self.assigned = Some(Assignment {
            address,
            host_interface: host_if,
        });
        Ok(())
    }
}

fn exit_status(outcome: Result<()>) -> i32 {
    match outcome {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "network setup inside container failed");
            1
        }
    }
}

fn parse_rule(value: &Value) -> std::result::Result<Rule, ConfigError> {
    let element = Element::new(ID, value)?;
    let host = element.string("host")?;

    let protocols = match element.get("protocols") {
        None => Vec::new(),
        Some(Value::String(p)) => vec![parse_protocol(&element, p)?],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(p) => parse_protocol(&element, p),
                other => Err(element.malformed(format!("protocol is not a string: {other}"))),
            })
            .collect::<std::result::Result<_, _>>()?,
        Some(other) => {
            return Err(element.malformed(format!("\"protocols\" has wrong type: {other}")));
        }
    };

    let ports = match element.get("ports") {
        None => PortFilter::Any,
        Some(Value::Number(n)) => PortFilter::Single(port_number(&element, n)?),
        Some(Value::String(s)) if s.contains(':') => {
            PortFilter::parse_range(s).map_err(|e| element.malformed(e))?
        }
        Some(Value::String(s)) => PortFilter::Single(
            s.trim()
                .parse()
                .map_err(|_| element.malformed(format!("bad port \"{s}\"")))?,
        ),
        Some(Value::Array(items)) if !items.is_empty() => PortFilter::List(
            items
                .iter()
                .map(|item| match item {
                    Value::Number(n) => port_number(&element, n),
                    other => Err(element.malformed(format!("port is not a number: {other}"))),
                })
                .collect::<std::result::Result<_, _>>()?,
        ),
        Some(other) => {
            return Err(element.malformed(format!("\"ports\" has wrong type: {other}")));
        }
    };

    if ports != PortFilter::Any && !protocols.iter().any(|p| *p != Protocol::Icmp) {
        return Err(element.malformed(format!(
            "ports for \"{host}\" need a tcp or udp protocol"
        )));
    }

    Ok(Rule {
        host,
        protocols,
        ports,
        target: Target::Accept,
    })
}

fn parse_protocol(
    element: &Element<'_>,
    text: &str,
) -> std::result::Result<Protocol, ConfigError> {
    text.parse().map_err(|e: String| element.malformed(e))
}

fn port_number(
    element: &Element<'_>,
    n: &serde_json::Number,
) -> std::result::Result<u16, ConfigError> {
    n.as_u64()
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| element.malformed(format!("port {n} is out of range")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(value: &Value) -> std::result::Result<NetworkGateway, ConfigError> {
        let mut gateway = NetworkGateway::default();
        gateway.read_element(value)?;
        Ok(gateway)
    }

    #[test]
    fn every_port_form_is_accepted() {
        let gateway = parse(&json!({
            "direction": "OUTGOING",
            "allow": [
                { "host": "a", "ports": 80, "protocols": "tcp" },
                { "host": "b", "ports": "8000:8080", "protocols": ["tcp", "udp"] },
                { "host": "c", "ports": [80, 443], "protocols": "tcp" },
                { "host": "d" }
            ]
        }))
        .unwrap();
        let rules = &gateway.entries()[0].rules;
        assert_eq!(rules[0].ports, PortFilter::Single(80));
        assert_eq!(rules[1].ports, PortFilter::Range(8000, 8080));
        assert_eq!(rules[1].protocols, vec![Protocol::Tcp, Protocol::Udp]);
        assert_eq!(rules[2].ports, PortFilter::List(vec![80, 443]));
        assert_eq!(rules[3].ports, PortFilter::Any);
        assert!(rules[3].protocols.is_empty());
    }

    #[test]
    fn direction_and_allow_are_required() {
        assert!(matches!(
            parse(&json!({ "allow": [] })),
            Err(ConfigError::MissingField { field: "direction", .. })
        ));
        assert!(matches!(
            parse(&json!({ "direction": "INCOMING" })),
            Err(ConfigError::MissingField { field: "allow", .. })
        ));
        assert!(parse(&json!({ "direction": "UP", "allow": [] })).is_err());
    }

    #[test]
    fn rules_need_a_host_and_known_protocols() {
        let missing_host = json!({ "direction": "INCOMING", "allow": [ { "ports": 22 } ] });
        assert!(matches!(
            parse(&missing_host),
            Err(ConfigError::MissingField { field: "host", .. })
        ));
        let sctp = json!({
            "direction": "INCOMING",
            "allow": [ { "host": "*", "protocols": "sctp" } ]
        });
        assert!(parse(&sctp).is_err());
    }

    #[test]
    fn ports_without_a_port_protocol_are_rejected() {
        let icmp_only = json!({
            "direction": "OUTGOING",
            "allow": [ { "host": "*", "ports": 53, "protocols": "icmp" } ]
        });
        assert!(parse(&icmp_only).is_err());
        let bad_port = json!({
            "direction": "OUTGOING",
            "allow": [ { "host": "*", "ports": 70000, "protocols": "tcp" } ]
        });
        assert!(parse(&bad_port).is_err());
    }

    #[test]
    fn rules_of_all_entries_keep_configuration_order() {
        let mut gateway = parse(&json!({
            "direction": "OUTGOING",
            "allow": [ { "host": "*", "ports": 443, "protocols": "tcp" } ]
        }))
        .unwrap();
        gateway
            .read_element(&json!({ "direction": "INCOMING", "allow": [] }))
            .unwrap();
        let rules = gateway.firewall_rules("FORWARD", "cgh0a000302");
        assert_eq!(rules.len(), 3);
        assert!(rules[0].spec.contains(&"--dport".to_string()));
        assert!(rules[1].spec.contains(&"--physdev-in".to_string()));
        assert!(rules[2].spec.contains(&"--physdev-out".to_string()));
    }
}
