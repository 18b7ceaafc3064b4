//! Shared plumbing for the Contrail charms.
//!
//! Every role is built from the same pieces: typed access to the host key-value scopes
//! ([`kv`]), dispatch of host events ([`hooks`]), file rendering that reports whether anything
//! changed ([`templating`]), a container runtime driver ([`docker`]), status aggregation over
//! the workload's own status tool ([`status`]), and the leader-owned cluster membership
//! ([`membership`]). The role specific reconcilers live in the `contrail-charm` binary.
pub mod compose;
pub mod docker;
pub mod executor;
pub mod haproxy;
pub mod hookenv;
pub mod hooks;
pub mod kv;
pub mod logging;
pub mod membership;
pub mod network;
pub mod nrpe;
pub mod payloads;
pub mod provisioner;
pub mod retry;
pub mod status;
pub mod templating;
pub mod tls;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Base directory for all rendered Contrail configuration
pub const CONFIGS_DIR: &str = "/etc/contrail";

/// Message set on a unit once all of its services report healthy
pub const READY_MESSAGE: &str = "Unit is ready";
