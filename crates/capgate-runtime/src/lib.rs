//! Attaching capability gateways to running containers.
//!
//! [`NamespaceContainer`] wraps a process that already runs in its own
//! namespaces and exposes it to the gateways as a
//! [`capgate_gateway::ContainerHandle`].

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod exec;

pub use container::NamespaceContainer;
