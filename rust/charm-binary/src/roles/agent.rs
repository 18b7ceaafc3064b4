//! The vrouter agent on compute nodes.
use std::collections::BTreeMap;

use contrail_charm_core::{
    compose::ComposeService,
    hookenv::Settings,
    hooks::{Hooks, RelationEvent},
    payloads::ORCHESTRATOR_KUBERNETES,
    status::Status,
};
use snafu::ResultExt;

use super::{
    common::{self, ControllerFacts, Precondition, Workload},
    Error, Result, RoleProfile, SettingsSnafu,
};
use crate::context::Ctx;

pub const MODULE: &str = "vrouter";
const CONTROLLER: &str = "contrail-controller";
const VROUTER_PLUGIN: &str = "vrouter-plugin";

const IMAGES: &[&str] = &[
    "contrail-node-init",
    "contrail-nodemgr",
    "contrail-vrouter-agent",
];
const KERNEL_INIT: &str = "contrail-vrouter-kernel-build-init";
const DPDK_KERNEL_INIT: &str = "contrail-vrouter-kernel-init-dpdk";
const DPDK_AGENT: &str = "contrail-vrouter-agent-dpdk";

pub const PROFILE: RoleProfile = RoleProfile {
    module: Some(MODULE),
    images: IMAGES,
    services: &[("vrouter", &["agent", "nodemgr"])],
    ports: &[],
    version: Some(("contrail-vrouter-agent", "contrail-vrouter-agent")),
    immutable_options: &["dpdk"],
};

pub fn hooks(hooks: Hooks<Ctx, Error>) -> Hooks<Ctx, Error> {
    let events = &[
        RelationEvent::Joined,
        RelationEvent::Changed,
        RelationEvent::Departed,
    ];
    common::workload_hooks(hooks)
        .on_relation(CONTROLLER, events, common::reconcile)
        .on_relation(VROUTER_PLUGIN, events, common::reconcile)
}

/// The images of the agent in kernel or DPDK mode
pub fn images(dpdk: bool) -> Vec<&'static str> {
    let mut images = IMAGES.to_vec();
    if dpdk {
        images.extend([DPDK_KERNEL_INIT, DPDK_AGENT]);
    } else {
        images.push(KERNEL_INIT);
    }
    images
}

struct Inputs {
    facts: ControllerFacts,
    orchestrator: String,
    plugin_settings: BTreeMap<String, String>,
}

fn plugin_settings(ctx: &Ctx) -> Result<Option<BTreeMap<String, String>>> {
    for remote in ctx.relation_units(VROUTER_PLUGIN)? {
        let settings: Option<BTreeMap<String, serde_json::Value>> =
            remote.bag.json("settings").context(SettingsSnafu)?;
        if let Some(settings) = settings {
            return Ok(Some(
                settings
                    .into_iter()
                    .map(|(key, value)| match value {
                        serde_json::Value::String(s) => (key, s),
                        other => (key, other.to_string()),
                    })
                    .collect(),
            ));
        }
    }
    Ok(None)
}

fn inputs(ctx: &Ctx) -> Result<Precondition<Inputs>> {
    let wait_for_plugin = ctx.config.get_bool("wait-for-external-plugin");
    let mut required = vec![CONTROLLER];
    if wait_for_plugin {
        required.push(VROUTER_PLUGIN);
    }
    if let Err(status) = common::missing_relations(ctx, &required)? {
        return Ok(Err(status));
    }

    let facts = ControllerFacts::collect(ctx, CONTROLLER)?;
    if facts.controller_ips.is_empty() {
        return Ok(Err(Status::blocked(
            "Missing controller servers info in relation with contrail-controller.",
        )));
    }
    let plugin_settings = plugin_settings(ctx)?;
    if wait_for_plugin && plugin_settings.is_none() {
        return Ok(Err(Status::waiting(
            "Waiting for settings in relation with vrouter-plugin.",
        )));
    }
    if facts.analytics_servers.is_empty() {
        return Ok(Err(Status::blocked(
            "Missing analytics_servers info in relation with contrail-controller.",
        )));
    }
    let Some(orchestrator) = facts.cloud_orchestrator().map(str::to_string) else {
        return Ok(Err(Status::blocked(
            "Missing cloud_orchestrator info in relation with contrail-controller.",
        )));
    };
    if let Err(status) = common::orchestrator_precondition(
        &orchestrator,
        facts.auth_info.as_ref(),
        &facts.orchestrator_info,
        CONTROLLER,
    ) {
        return Ok(Err(status));
    }
    if let Err(status) = common::tls_precondition(ctx)? {
        return Ok(Err(status));
    }
    Ok(Ok(Inputs {
        facts,
        orchestrator,
        plugin_settings: plugin_settings.unwrap_or_default(),
    }))
}

fn publish(ctx: &mut Ctx) -> Result<()> {
    let dpdk = ctx.config.get_bool("dpdk");
    ctx.publish(
        CONTROLLER,
        Settings::from([
            ("dpdk".to_string(), Some(dpdk.to_string())),
            ("unit-type".to_string(), Some("agent".to_string())),
        ]),
    )?;
    Ok(())
}

fn environment(ctx: &Ctx, inputs: &Inputs, dpdk: bool) -> BTreeMap<String, String> {
    let facts = &inputs.facts;
    let mut env = common::base_env(ctx, MODULE);
    env.extend([
        ("CONTROLLER_NODES".to_string(), common::join(&facts.controller_ips)),
        ("CONTROL_NODES".to_string(), common::join(&facts.controller_data_ips)),
        ("ANALYTICS_NODES".to_string(), common::join(&facts.analytics_servers)),
        ("CLOUD_ORCHESTRATOR".to_string(), inputs.orchestrator.clone()),
        (
            "AGENT_MODE".to_string(),
            if dpdk { "dpdk" } else { "kernel" }.to_string(),
        ),
    ]);
    common::auth_env(facts.auth_info.as_ref(), &mut env);

    let options = [
        ("PHYSICAL_INTERFACE", "physical-interface"),
        ("VROUTER_GATEWAY", "vhost-gateway"),
        ("VROUTER_MTU", "vhost-mtu"),
    ];
    for (key, option) in options {
        if let Some(value) = ctx.config.string(option).filter(|v| v != "auto") {
            env.insert(key.to_string(), value);
        }
    }
    if dpdk {
        env.extend([
            (
                "CPU_CORE_MASK".to_string(),
                ctx.config.string_or("dpdk-coremask", "1"),
            ),
            (
                "DPDK_UIO_DRIVER".to_string(),
                ctx.config.string_or("dpdk-driver", "uio_pci_generic"),
            ),
            (
                "HUGE_PAGES".to_string(),
                ctx.config.string_or("dpdk-hugepages", "70%"),
            ),
        ]);
    }
    if let Some(secret) = &facts.metadata_shared_secret {
        env.insert("METADATA_PROXY_SECRET".to_string(), secret.clone());
    }
    if inputs.orchestrator == ORCHESTRATOR_KUBERNETES {
        let info = &facts.orchestrator_info;
        if let Some(server) = &info.kubernetes_api_server {
            env.insert("KUBERNETES_API_SERVER".to_string(), server.clone());
        }
        if let Some(port) = &info.kubernetes_api_secure_port {
            env.insert("KUBERNETES_API_SECURE_PORT".to_string(), port.clone());
        }
    }
    env.extend(inputs.plugin_settings.clone());
    env
}

fn workload(ctx: &Ctx, inputs: &Inputs) -> Workload {
    let dpdk = ctx.config.get_bool("dpdk");
    let mut workload = Workload::new(MODULE, images(dpdk));
    workload.env = environment(ctx, inputs, dpdk);

    let kernel_init = if dpdk {
        ComposeService::init(ctx.image(DPDK_KERNEL_INIT).to_string())
            .volume("/etc/sysconfig/network-scripts:/etc/sysconfig/network-scripts")
    } else {
        ComposeService::init(ctx.image(KERNEL_INIT).to_string()).volume("/usr/src:/usr/src")
    };
    let kernel_init = kernel_init
        .env_file(common::env_path(MODULE))
        .privileged()
        .volumes(["/lib/modules:/lib/modules", "/bin:/host/bin"])
        .depends_on("node-init");

    let agent_volumes = [
        "/dev:/dev",
        "/etc/sysconfig/network-scripts:/etc/sysconfig/network-scripts",
        "/lib/modules:/lib/modules",
        "/var/run/vrouter:/var/run/vrouter",
        "/var/lib/contrail:/var/lib/contrail",
        "/var/log/contrail:/var/log/contrail",
        "/etc/contrail/ssl:/etc/contrail/ssl:ro",
    ];
    let mut compose = workload
        .compose
        .service("node-init", common::node_init(ctx, MODULE))
        .service("vrouter-kernel-init", kernel_init)
        .service(
            "nodemgr",
            common::nodemgr(ctx, MODULE, "vrouter").depends_on("vrouter-agent"),
        );
    if dpdk {
        compose = compose.service(
            "vrouter-agent-dpdk",
            common::service(ctx, MODULE, DPDK_AGENT)
                .privileged()
                .pid_host()
                .volumes(agent_volumes)
                .depends_on("vrouter-kernel-init"),
        );
    }
    let mut agent = common::service(ctx, MODULE, "contrail-vrouter-agent")
        .privileged()
        .volumes(agent_volumes)
        .depends_on("vrouter-kernel-init");
    if dpdk {
        agent = agent.depends_on("vrouter-agent-dpdk");
    }
    workload.compose = compose.service("vrouter-agent", agent);
    workload
}

pub fn update_status(ctx: &mut Ctx) -> Result<()> {
    publish(ctx)?;
    let inputs = match inputs(ctx)? {
        Ok(inputs) => inputs,
        Err(status) => return ctx.set_status(status),
    };
    let workload = workload(ctx, &inputs);
    common::deploy(ctx, workload)
}
