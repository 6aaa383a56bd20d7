//! Firewall rule construction.
//!
//! An [`IPTableEntry`] is the parsed form of one network configuration
//! element: a traffic direction, an ordered list of allow rules and a
//! default target. It expands into concrete [`FirewallRule`]s scoped to a
//! container's host-side interface, in first-match-wins order, closed by
//! the default-target rule.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use capgate_common::error::{NetworkError, Result};

/// Traffic direction as seen from the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Traffic towards the container (`INPUT`).
    Incoming,
    /// Traffic leaving the container (`OUTPUT`).
    Outgoing,
}

impl Direction {
    /// Name of the container-side chain this direction maps to.
    #[must_use]
    pub const fn chain_name(self) -> &'static str {
        match self {
            Self::Incoming => "INPUT",
            Self::Outgoing => "OUTPUT",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "INCOMING" => Ok(Self::Incoming),
            "OUTGOING" => Ok(Self::Outgoing),
            other => Err(format!("unknown direction \"{other}\"")),
        }
    }
}

/// Verdict of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Target {
    /// Let the packet through.
    Accept,
    /// Silently discard the packet.
    #[default]
    Drop,
    /// Discard the packet and notify the sender.
    Reject,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Accept => "ACCEPT",
            Self::Drop => "DROP",
            Self::Reject => "REJECT",
        })
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ACCEPT" => Ok(Self::Accept),
            "DROP" => Ok(Self::Drop),
            "REJECT" => Ok(Self::Reject),
            other => Err(format!("unknown target \"{other}\"")),
        }
    }
}

/// Transport protocols a rule may match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// ICMP. Carries no ports.
    Icmp,
}

impl Protocol {
    const fn has_ports(self) -> bool {
        !matches!(self, Self::Icmp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        })
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            other => Err(format!("protocol \"{other}\" is not one of tcp, udp, icmp")),
        }
    }
}

/// Port filter of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PortFilter {
    /// Every port.
    #[default]
    Any,
    /// One port.
    Single(u16),
    /// Inclusive port range.
    Range(u16, u16),
    /// Explicit port list, matched with the multiport extension.
    List(Vec<u16>),
}

impl PortFilter {
    /// Parses a `"low:high"` range.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the text is not a valid
    /// ascending range.
    pub fn parse_range(text: &str) -> std::result::Result<Self, String> {
        let (low, high) = text
            .split_once(':')
            .ok_or_else(|| format!("port range \"{text}\" must look like low:high"))?;
        let low: u16 = low
            .trim()
            .parse()
            .map_err(|_| format!("bad port \"{low}\" in \"{text}\""))?;
        let high: u16 = high
            .trim()
            .parse()
            .map_err(|_| format!("bad port \"{high}\" in \"{text}\""))?;
        if low > high {
            return Err(format!("port range \"{text}\" is descending"));
        }
        Ok(Self::Range(low, high))
    }

    fn args(&self, flag_single: &str, flag_multi: &str) -> Vec<String> {
        match self {
            Self::Any => Vec::new(),
            Self::Single(port) => vec![flag_single.into(), port.to_string()],
            Self::Range(low, high) => vec![flag_single.into(), format!("{low}:{high}")],
            Self::List(ports) => vec![
                "-m".into(),
                "multiport".into(),
                flag_multi.into(),
                ports
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            ],
        }
    }
}

/// One allow rule of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Remote host or network (`*` matches any).
    pub host: String,
    /// Protocols matched; empty matches every protocol.
    pub protocols: Vec<Protocol>,
    /// Ports matched.
    pub ports: PortFilter,
    /// Verdict for matching packets.
    pub target: Target,
}

/// Parsed form of one network configuration element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IPTableEntry {
    /// Direction the rules apply to.
    pub direction: Direction,
    /// Verdict for packets no rule matched.
    pub default_target: Target,
    /// Allow rules, in match order.
    pub rules: Vec<Rule>,
}

impl IPTableEntry {
    /// Creates an empty entry with a `DROP` default.
    #[must_use]
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            default_target: Target::default(),
            rules: Vec::new(),
        }
    }

    /// Expands the entry into firewall rules for `chain`, scoped to the
    /// container's host-side interface.
    ///
    /// Incoming rules match on the remote source and source ports, outgoing
    /// rules on the remote destination and destination ports. The last
    /// rule always applies the default target.
    #[must_use]
    pub fn firewall_rules(&self, chain: &str, host_interface: &str) -> Vec<FirewallRule> {
        let scope = match self.direction {
            Direction::Incoming => ["-m", "physdev", "--physdev-out", host_interface],
            Direction::Outgoing => ["-m", "physdev", "--physdev-in", host_interface],
        };
        let (host_flag, port_flag, ports_flag) = match self.direction {
            Direction::Incoming => ("-s", "--sport", "--sports"),
            Direction::Outgoing => ("-d", "--dport", "--dports"),
        };

        let mut out = Vec::new();
        for rule in &self.rules {
            let protocols: Vec<Option<Protocol>> = if rule.protocols.is_empty() {
                vec![None]
            } else {
                rule.protocols.iter().copied().map(Some).collect()
            };
            for protocol in protocols {
                let mut spec: Vec<String> = scope.iter().map(ToString::to_string).collect();
                if rule.host != "*" {
                    spec.extend([host_flag.to_string(), rule.host.clone()]);
                }
                if let Some(protocol) = protocol {
                    spec.extend(["-p".to_string(), protocol.to_string()]);
                    if protocol.has_ports() {
                        spec.extend(rule.ports.args(port_flag, ports_flag));
                    }
                }
                spec.extend(["-j".to_string(), rule.target.to_string()]);
                out.push(FirewallRule::new(chain, spec));
            }
        }

        let mut closing: Vec<String> = scope.iter().map(ToString::to_string).collect();
        closing.extend(["-j".to_string(), self.default_target.to_string()]);
        out.push(FirewallRule::new(chain, closing));
        out
    }
}

/// A concrete rule in a host chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    /// Chain holding the rule.
    pub chain: String,
    /// Match and target arguments, without the chain operation.
    pub spec: Vec<String>,
}

impl FirewallRule {
    /// Creates a rule from its chain and argument list.
    #[must_use]
    pub fn new(chain: impl Into<String>, spec: Vec<String>) -> Self {
        Self {
            chain: chain.into(),
            spec,
        }
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.chain, self.spec.join(" "))
    }
}

/// Host firewall backend.
pub trait Firewall: Send {
    /// Inserts `rule` at the 1-based `position` of its chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule could not be inserted.
    fn insert(&mut self, rule: &FirewallRule, position: usize) -> Result<()>;

    /// Deletes the first rule in the chain matching `rule`.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule could not be deleted.
    fn delete(&mut self, rule: &FirewallRule) -> Result<()>;
}

/// Firewall backed by the `iptables` binary.
#[derive(Debug, Clone)]
pub struct IptablesFirewall {
    binary: PathBuf,
}

impl IptablesFirewall {
    /// Locates `iptables` in `PATH`.
    ///
    /// # Errors
    ///
    /// Returns an error if the binary is not installed.
    pub fn locate() -> Result<Self> {
        let binary = which::which("iptables").map_err(|e| NetworkError::Firewall {
            command: "iptables".into(),
            message: e.to_string(),
        })?;
        Ok(Self { binary })
    }

    fn run(&self, args: &[String]) -> Result<()> {
        let command = format!("{} {}", self.binary.display(), args.join(" "));
        let output = std::process::Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| NetworkError::Firewall {
                command: command.clone(),
                message: e.to_string(),
            })?;
        if output.status.success() {
            tracing::debug!(command = %command, "firewall updated");
            Ok(())
        } else {
            Err(NetworkError::Firewall {
                command,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into())
        }
    }
}

impl Firewall for IptablesFirewall {
    fn insert(&mut self, rule: &FirewallRule, position: usize) -> Result<()> {
        let mut args = vec![
            "-w".to_string(),
            "-I".to_string(),
            rule.chain.clone(),
            position.to_string(),
        ];
        args.extend(rule.spec.iter().cloned());
        self.run(&args)
    }

    fn delete(&mut self, rule: &FirewallRule) -> Result<()> {
        let mut args = vec!["-w".to_string(), "-D".to_string(), rule.chain.clone()];
        args.extend(rule.spec.iter().cloned());
        self.run(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing_web() -> IPTableEntry {
        IPTableEntry {
            direction: Direction::Outgoing,
            default_target: Target::Drop,
            rules: vec![
                Rule {
                    host: "example.com".into(),
                    protocols: vec![Protocol::Tcp],
                    ports: PortFilter::List(vec![80, 443]),
                    target: Target::Accept,
                },
                Rule {
                    host: "*".into(),
                    protocols: vec![Protocol::Udp, Protocol::Icmp],
                    ports: PortFilter::Single(53),
                    target: Target::Accept,
                },
            ],
        }
    }

    #[test]
    fn rules_keep_order_and_end_with_default() {
        let rules = outgoing_web().firewall_rules("FORWARD", "cgh0a000302");
        let lines: Vec<String> = rules.iter().map(ToString::to_string).collect();
        assert_eq!(
            lines,
            vec![
                "FORWARD -m physdev --physdev-in cgh0a000302 -d example.com -p tcp \
                 -m multiport --dports 80,443 -j ACCEPT",
                "FORWARD -m physdev --physdev-in cgh0a000302 -p udp --dport 53 -j ACCEPT",
                "FORWARD -m physdev --physdev-in cgh0a000302 -p icmp -j ACCEPT",
                "FORWARD -m physdev --physdev-in cgh0a000302 -j DROP",
            ]
        );
    }

    #[test]
    fn incoming_rules_match_the_source() {
        let mut entry = IPTableEntry::new(Direction::Incoming);
        entry.rules.push(Rule {
            host: "10.1.0.0/16".into(),
            protocols: vec![Protocol::Tcp],
            ports: PortFilter::Range(8000, 8080),
            target: Target::Accept,
        });
        let rules = entry.firewall_rules("FORWARD", "veth0");
        assert_eq!(
            rules[0].to_string(),
            "FORWARD -m physdev --physdev-out veth0 -s 10.1.0.0/16 -p tcp --sport 8000:8080 -j ACCEPT"
        );
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn empty_entry_still_applies_default_target() {
        let rules = IPTableEntry::new(Direction::Outgoing).firewall_rules("FORWARD", "v");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].spec.last().map(String::as_str), Some("DROP"));
    }

    #[test]
    fn port_ranges_must_ascend() {
        assert_eq!(
            PortFilter::parse_range("8000:8080").unwrap(),
            PortFilter::Range(8000, 8080)
        );
        assert!(PortFilter::parse_range("9000:80").is_err());
        assert!(PortFilter::parse_range("80").is_err());
    }

    #[test]
    fn directions_and_protocols_parse_from_configuration_names() {
        assert_eq!("INCOMING".parse::<Direction>().unwrap().chain_name(), "INPUT");
        assert_eq!("OUTGOING".parse::<Direction>().unwrap().chain_name(), "OUTPUT");
        assert!("SIDEWAYS".parse::<Direction>().is_err());
        assert!("sctp".parse::<Protocol>().is_err());
    }
}
