//! Network primitives: firewall rules, interface configuration and the
//! container address pool.

pub mod iptables;
pub mod netlink;
pub mod pool;
