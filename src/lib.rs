//! An intercepting SSH gateway for fleetctl.
//!
//! Speaks enough sshd to satisfy a fleetctl client: answers its control
//! channel with a filtered fleet API, and masquerades as the SSH server of
//! whatever node the client tunnels to.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod fleet;
pub mod keys;
pub mod masquerade;
pub mod policy;
pub mod ssh;
