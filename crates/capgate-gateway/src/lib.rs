//! # capgate-gateway
//!
//! Capability gateways mediating a container's access to host resources.
//!
//! Each resource category is handled by one [`Gateway`] moving through the
//! `Created`, `Configured` and `Activated` states. Every host mutation a
//! gateway performs during activation is recorded in its undo log, and
//! `teardown` reverses them in reverse order even after a partial
//! activation.
//!
//! [`GatewayConfiguration`] routes enabled JSON configuration elements to
//! the gateways of a [`GatewaySet`], which activates them in a fixed order
//! and tears them down in reverse.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod configuration;
pub mod container;
mod element;
pub mod gateway;
pub mod gateways;
pub mod host;
pub mod set;
mod undo;

pub use configuration::{GatewayConfiguration, Profile};
pub use container::{ContainerHandle, Job};
pub use gateway::Gateway;
pub use host::{HostContext, HostEnv, HostNetwork};
pub use set::GatewaySet;
