//! Configures the vrouter services installed on nova-compute hosts and registers them with
//! the Contrail API.
use serde_json::json;
use snafu::ResultExt;

use contrail_charm_core::{
    hookenv::Settings,
    hooks::{Hooks, RelationEvent, STOP},
    payloads::{AuthInfo, KEYSTONE_ENDPOINT},
    provisioner::{ApiCredentials, LinklocalRegistration, Provisioner, VrouterRegistration},
    status::Status,
    templating::{Context, Perms},
    tls, CONFIGS_DIR,
};

use super::{
    common::{self, ControllerFacts, Precondition},
    DeprovisionSnafu, EncodeSnafu, Error, RenderSnafu, Result, RoleProfile,
};
use crate::{context::Ctx, templates};

pub const MODULE: &str = "vrouter";

const CONTROLLER: &str = "contrail-controller";
const NOVA_COMPUTE: &str = "nova-compute";

const METADATA: &str = "metadata";
const METADATA_IP: &str = "169.254.169.254";
const NOVA_METADATA_PORT: u16 = 8775;

pub const PROFILE: RoleProfile = RoleProfile {
    module: Some(MODULE),
    images: &[],
    services: &[("vrouter", &["agent", "nodemgr"])],
    ports: &[],
    version: None,
    immutable_options: &[],
};

/// Host files of the vrouter and the systemd unit reading each of them
const HOST_SERVICES: &[(&str, &str)] = &[
    (templates::VROUTER_AGENT_CONF, "contrail-vrouter-agent"),
    (templates::VROUTER_NODEMGR_CONF, "contrail-vrouter-nodemgr"),
];

pub fn hooks(hooks: Hooks<Ctx, Error>) -> Hooks<Ctx, Error> {
    common::workload_hooks(hooks)
        .on(&[STOP], stop)
        .on_relation(CONTROLLER, RelationEvent::DATA, common::reconcile)
        .on_relation(CONTROLLER, RelationEvent::GONE, common::reconcile)
        .on_relation(NOVA_COMPUTE, RelationEvent::DATA, common::reconcile)
}

struct Inputs {
    facts: ControllerFacts,
    api_ip: String,
    auth: AuthInfo,
}

fn inputs(ctx: &Ctx) -> Result<Precondition<Inputs>> {
    if let Err(status) = common::missing_relations(ctx, &[CONTROLLER])? {
        return Ok(Err(status));
    }
    let facts = ControllerFacts::collect(ctx, CONTROLLER)?;
    let Some(api_ip) = facts.api_ip().map(str::to_string) else {
        return Ok(Err(Status::blocked(
            "Missing api_ip info in relation with contrail-controller.",
        )));
    };
    let auth = facts.auth_info.clone();
    let auth = match common::require_auth(auth, KEYSTONE_ENDPOINT, CONTROLLER) {
        Ok(auth) => auth,
        Err(status) => return Ok(Err(status)),
    };
    if facts.analytics_servers.is_empty() {
        return Ok(Err(Status::blocked(
            "Missing analytics_servers info in relation with contrail-controller.",
        )));
    }
    if let Err(status) = common::tls_precondition(ctx)? {
        return Ok(Err(status));
    }
    Ok(Ok(Inputs {
        facts,
        api_ip,
        auth,
    }))
}

fn provisioner(ctx: &Ctx, inputs: &Inputs) -> Provisioner {
    let credentials = ApiCredentials::new(
        &inputs.api_ip,
        inputs.facts.api_port(),
        Some(&inputs.auth),
    );
    Provisioner::new(ctx.executor.clone(), credentials, ctx.retry)
}

fn agent_context(ctx: &Ctx, inputs: &Inputs, vhost_ip: &str) -> Context {
    let facts = &inputs.facts;
    let mut context = Context::new()
        .with("controller_servers", json!(facts.controller_data_ips))
        .with("analytics_servers", json!(facts.analytics_servers))
        .with("log_level", ctx.config.string_or("log-level", "SYS_NOTICE"))
        .with("vhost_ip", vhost_ip)
        .with(
            "physical_interface",
            ctx.config.string_or("physical-interface", "eth0"),
        )
        .with(
            "metadata_secret",
            facts.metadata_shared_secret.clone().unwrap_or_default(),
        );
    if let Some(gateway) = ctx.config.string("vhost-gateway").filter(|g| g != "auto") {
        context.insert("vhost_gateway", gateway);
    }
    if ctx.config.get_bool(common::SSL_ENABLED) {
        context
            .insert("ssl_enabled", true)
            .insert("ssl_ca", tls::ca_path(MODULE))
            .insert("ssl_cert", tls::cert_path(MODULE))
            .insert("ssl_key", tls::key_path(MODULE));
    }
    context
}

/// Renders the host configuration and restarts every service whose file changed, reporting the
/// first service that failed to come back
fn configure_host(ctx: &mut Ctx, inputs: &Inputs, vhost_ip: &str) -> Result<Option<Status>> {
    let auth = &inputs.auth;
    let mut vnc = Context::from_serializable(auth).context(RenderSnafu)?;
    vnc.insert("api_server", inputs.api_ip.as_str())
        .insert("api_port", inputs.facts.api_port())
        .insert(
            "keystone_protocol",
            auth.keystone_protocol.as_deref().unwrap_or("http"),
        )
        .insert(
            "keystone_public_port",
            auth.keystone_public_port.as_deref().unwrap_or("5000"),
        );
    ctx.render(
        templates::VNC_API_LIB_INI,
        &format!("{CONFIGS_DIR}/{}", templates::VNC_API_LIB_INI),
        &vnc,
        Perms::mode(0o644),
    )?;

    let agent = agent_context(ctx, inputs, vhost_ip);
    let nodemgr = Context::new().with("analytics_servers", json!(inputs.facts.analytics_servers));
    let mut failed = None;
    for &(template, service) in HOST_SERVICES {
        let context = if template == templates::VROUTER_AGENT_CONF {
            &agent
        } else {
            &nodemgr
        };
        let changed = ctx.render(
            template,
            &format!("{CONFIGS_DIR}/{template}"),
            context,
            Perms::mode(0o440),
        )?;
        if let Some(status) = common::restart_host_service(ctx, service, changed) {
            failed.get_or_insert(status);
        }
    }
    Ok(failed)
}

/// Registers the vrouter and the metadata link-local service; failures are reported as a
/// status and retried by the next hook
fn provision(ctx: &mut Ctx, inputs: &Inputs, vhost_ip: &str) -> Option<Status> {
    let provisioner = provisioner(ctx, inputs);
    let registration = VrouterRegistration {
        hostname: common::hostname(ctx),
        ip: vhost_ip.to_string(),
    };
    if let Err(error) = provisioner.ensure_vrouter(&mut ctx.config, &registration) {
        tracing::warn!(
            error = &error as &dyn std::error::Error,
            "failed to register vrouter"
        );
        return Some(Status::waiting("Failed to register vrouter, retrying."));
    }

    let metadata = if ctx.config.get_bool("enable-metadata-server") {
        let own_ip = match ctx.unit_ip("control-network", "control") {
            Ok(ip) => ip,
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to resolve the metadata backend address"
                );
                return Some(Status::waiting("Failed to resolve the unit address."));
            }
        };
        let registration = LinklocalRegistration {
            name: METADATA.to_string(),
            service_ip: METADATA_IP.to_string(),
            service_port: 80,
            backend_ip: own_ip,
            backend_port: NOVA_METADATA_PORT,
        };
        provisioner.ensure_linklocal(&mut ctx.config, &registration)
    } else {
        provisioner.remove_linklocal(&mut ctx.config, METADATA)
    };
    if let Err(error) = metadata {
        tracing::warn!(
            error = &error as &dyn std::error::Error,
            "failed to update the metadata service"
        );
        return Some(Status::waiting(
            "Failed to register the metadata service, retrying.",
        ));
    }
    None
}

/// Nova options for the Contrail metadata proxy
pub fn nova_settings(facts: &ControllerFacts) -> Result<Settings> {
    let secret = facts.metadata_shared_secret.clone().unwrap_or_default();
    let subordinate = json!({
        "nova": {
            "/etc/nova/nova.conf": {
                "sections": {
                    "DEFAULT": [["firewall_driver", "nova.virt.firewall.NoopFirewallDriver"]],
                    "neutron": [
                        ["service_metadata_proxy", "True"],
                        ["metadata_proxy_shared_secret", secret],
                    ],
                }
            }
        }
    });
    let subordinate = serde_json::to_string(&subordinate).context(EncodeSnafu {
        what: "nova subordinate configuration",
    })?;
    Ok(Settings::from([
        ("subordinate_configuration".to_string(), Some(subordinate)),
        ("metadata-shared-secret".to_string(), Some(secret)),
    ]))
}

pub fn update_status(ctx: &mut Ctx) -> Result<()> {
    let inputs = match inputs(ctx)? {
        Ok(inputs) => inputs,
        Err(status) => return ctx.set_status(status),
    };
    ctx.publish(NOVA_COMPUTE, nova_settings(&inputs.facts)?)?;
    if common::in_maintenance(ctx) {
        return common::update_workload_status(ctx);
    }

    let vhost_ip = ctx.unit_ip("data-network", "data")?;
    if let Some(status) = configure_host(ctx, &inputs, &vhost_ip)? {
        return ctx.set_status(status);
    }
    if let Some(status) = provision(ctx, &inputs, &vhost_ip) {
        return ctx.set_status(status);
    }
    common::update_workload_status(ctx)
}

/// Removes the unit's registrations from the API before it goes away
fn stop(ctx: &mut Ctx) -> Result<()> {
    let inputs = match inputs(ctx)? {
        Ok(inputs) => inputs,
        Err(status) => {
            tracing::warn!(
                reason = %status.message,
                "cannot reach the Contrail API, leaving registrations behind"
            );
            return Ok(());
        }
    };
    let provisioner = provisioner(ctx, &inputs);
    provisioner
        .remove_linklocal(&mut ctx.config, METADATA)
        .context(DeprovisionSnafu)?;
    provisioner
        .remove_vrouter(&mut ctx.config)
        .context(DeprovisionSnafu)?;
    Ok(())
}
