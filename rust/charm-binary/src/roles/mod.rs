//! The role catalogue and the reconcile error type shared by all roles.
use snafu::Snafu;
use strum::{Display, EnumDiscriminants, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use contrail_charm_core::{
    docker, executor, haproxy, hookenv, hooks::Hooks, kv, membership, network, nrpe,
    provisioner, status::ServiceMap, templating, tls,
};

use crate::context::Ctx;

pub mod agent;
pub mod analytics;
pub mod analyticsdb;
pub mod common;
pub mod controller;
pub mod keystone_auth;
pub mod kubernetes_master;
pub mod kubernetes_node;
pub mod lb;
pub mod openstack;
pub mod openstack_compute;
pub mod openstack_neutron_api;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("option {option} must be one of {allowed:?}, got {value:?}"))]
    InvalidConfig {
        option: String,
        value: String,
        allowed: Vec<&'static str>,
    },

    #[snafu(display("option {option} cannot be changed once the unit is deployed"))]
    ImmutableOption { option: String },

    #[snafu(display("failed to talk to the host framework"))]
    Host { source: hookenv::Error },

    #[snafu(display("failed to access unit or leader settings"))]
    Settings { source: kv::Error },

    #[snafu(display("failed to render configuration"))]
    Render { source: templating::Error },

    #[snafu(display("container runtime operation failed"))]
    Runtime { source: docker::Error },

    #[snafu(display("failed to update cluster membership"))]
    Membership { source: membership::Error },

    #[snafu(display("failed to publish HAProxy services"))]
    Haproxy { source: haproxy::Error },

    #[snafu(display("failed to handle TLS certificates"))]
    Tls { source: tls::Error },

    #[snafu(display("failed to install monitoring checks"))]
    Nrpe { source: nrpe::Error },

    #[snafu(display("failed to resolve the unit address"))]
    Address { source: network::Error },

    #[snafu(display("failed to deregister from the Contrail API"))]
    Deprovision { source: provisioner::Error },

    #[snafu(display("failed to serialize compose manifest"))]
    SerializeCompose { source: serde_yaml::Error },

    #[snafu(display("failed to encode {what}"))]
    Encode {
        source: serde_json::Error,
        what: &'static str,
    },

    #[snafu(display("kubectl failed while acquiring the service account token"))]
    Kubectl { source: executor::Error },

    #[snafu(display("service account token is not valid base64"))]
    DecodeToken { source: base64::DecodeError },

    #[snafu(display("failed to restart host service {service}"))]
    RestartService {
        source: executor::Error,
        service: String,
    },
}

impl Error {
    /// Short name of the failure, for logs
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

#[derive(Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, Hash, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum Role {
    Agent,
    Analytics,
    Analyticsdb,
    Controller,
    KeystoneAuth,
    KubernetesMaster,
    KubernetesNode,
    Lb,
    OpenstackCompute,
    OpenstackNeutronApi,
    Openstack,
}

/// Static facts about a role
#[derive(Clone, Copy, Debug)]
pub struct RoleProfile {
    /// Name of the workload module, used for config directories and the status container
    pub module: Option<&'static str>,
    /// Images pulled for every unit of the role
    pub images: &'static [&'static str],
    pub services: ServiceMap,
    pub ports: &'static [u16],
    /// Image and rpm package the application version is read from
    pub version: Option<(&'static str, &'static str)>,
    /// Options that may only be set at deployment time
    pub immutable_options: &'static [&'static str],
}

const NO_WORKLOAD: RoleProfile = RoleProfile {
    module: None,
    images: &[],
    services: &[],
    ports: &[],
    version: None,
    immutable_options: &[],
};

impl RoleProfile {
    pub fn uses_runtime(&self) -> bool {
        !self.images.is_empty()
    }
}

impl Role {
    pub fn profile(self) -> RoleProfile {
        match self {
            Role::Agent => agent::PROFILE,
            Role::Analytics => analytics::PROFILE,
            Role::Analyticsdb => analyticsdb::PROFILE,
            Role::Controller => controller::PROFILE,
            Role::KubernetesMaster => kubernetes_master::PROFILE,
            Role::KubernetesNode => kubernetes_node::PROFILE,
            Role::Lb => lb::PROFILE,
            Role::OpenstackCompute => openstack_compute::PROFILE,
            Role::Openstack => openstack::PROFILE,
            Role::KeystoneAuth | Role::OpenstackNeutronApi => NO_WORKLOAD,
        }
    }

    /// The role whose workload runs as `module`
    pub fn for_module(module: &str) -> Option<Role> {
        Role::iter().find(|role| role.profile().module == Some(module))
    }

    pub fn hooks(self) -> Hooks<Ctx, Error> {
        let hooks = common::lifecycle_hooks();
        match self {
            Role::Agent => agent::hooks(hooks),
            Role::Analytics => analytics::hooks(hooks),
            Role::Analyticsdb => analyticsdb::hooks(hooks),
            Role::Controller => controller::hooks(hooks),
            Role::KeystoneAuth => keystone_auth::hooks(hooks),
            Role::KubernetesMaster => kubernetes_master::hooks(hooks),
            Role::KubernetesNode => kubernetes_node::hooks(hooks),
            Role::Lb => lb::hooks(hooks),
            Role::OpenstackCompute => openstack_compute::hooks(hooks),
            Role::OpenstackNeutronApi => openstack_neutron_api::hooks(hooks),
            Role::Openstack => openstack::hooks(hooks),
        }
    }
}

/// Runs the handler of `hook` and commits the unit state when it succeeded
pub fn run_hook(ctx: &mut Ctx, hook: &str) -> Result<bool> {
    let handled = ctx.role.hooks().execute(hook, ctx)?;
    ctx.commit()?;
    Ok(handled)
}

/// Drives the unit of the context's role towards its target state
pub fn reconcile(ctx: &mut Ctx) -> Result<()> {
    match ctx.role {
        Role::Agent => agent::update_status(ctx),
        Role::Analytics => analytics::update_status(ctx),
        Role::Analyticsdb => analyticsdb::update_status(ctx),
        Role::Controller => controller::update_status(ctx),
        Role::KeystoneAuth => keystone_auth::update_status(ctx),
        Role::KubernetesMaster => kubernetes_master::update_status(ctx),
        Role::KubernetesNode => kubernetes_node::update_status(ctx),
        Role::Lb => lb::update_status(ctx),
        Role::OpenstackCompute => openstack_compute::update_status(ctx),
        Role::OpenstackNeutronApi => openstack_neutron_api::update_status(ctx),
        Role::Openstack => openstack::update_status(ctx),
    }
}
