//! # capgate-core
//!
//! Host-side primitives the gateways are built from.
//!
//! This crate provides safe abstractions over:
//! - **Cleanup**: an append-only undo log that reverses host mutations in
//!   reverse order of creation.
//! - **Filesystem**: directories, placeholder files, symlinks, bind and
//!   overlay mounts, and device nodes, each recorded in the undo log only
//!   after it succeeded.
//! - **Cgroups**: limit token parsing and controller file writes.
//! - **Network**: firewall rule construction, netlink interface
//!   configuration, and the container address pool.
//!
//! All unsafe system calls are left to `nix`; this crate contains no
//! `unsafe` blocks of its own.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod cleanup;
pub mod filesystem;
pub mod network;
