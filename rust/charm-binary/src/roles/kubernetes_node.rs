//! Installs the Contrail CNI plugin on Kubernetes workers.
use contrail_charm_core::{
    docker::RunSpec,
    hookenv::Settings,
    hooks::{Hooks, RelationEvent},
    status::Status,
    templating::{Context, Perms},
};
use snafu::ResultExt;

use super::{
    common::{self, Precondition},
    Error, Result, RoleProfile, RuntimeSnafu,
};
use crate::{context::Ctx, templates};

pub const MODULE: &str = "kubernetes_node";

const KUBERNETES_CONFIG: &str = "contrail-kubernetes-config";
const CNI: &str = "cni";

const CNI_INIT: &str = "contrail-kubernetes-cni-init";
const CNI_CONF_DIR: &str = "/etc/cni/net.d";
/// Image id the CNI binaries were last installed from
const CNI_INSTALLED: &str = "cni-init-image";

pub const PROFILE: RoleProfile = RoleProfile {
    module: Some(MODULE),
    images: &[CNI_INIT],
    services: &[],
    ports: &[],
    version: None,
    immutable_options: &[],
};

pub fn hooks(hooks: Hooks<Ctx, Error>) -> Hooks<Ctx, Error> {
    common::workload_hooks(hooks)
        .on_relation(KUBERNETES_CONFIG, RelationEvent::DATA, common::reconcile)
        .on_relation(KUBERNETES_CONFIG, RelationEvent::GONE, common::reconcile)
        .on_relation(CNI, RelationEvent::DATA, common::reconcile)
}

#[derive(Debug, PartialEq)]
struct KubernetesConfig {
    pod_subnets: String,
    nested_mode_config: Option<String>,
}

fn kubernetes_config(ctx: &Ctx) -> Result<Precondition<KubernetesConfig>> {
    if let Err(status) = common::missing_relations(ctx, &[KUBERNETES_CONFIG])? {
        return Ok(Err(status));
    }
    let remotes = ctx.relation_units(KUBERNETES_CONFIG)?;
    let Some(bag) = remotes
        .iter()
        .map(|remote| &remote.bag)
        .find(|bag| bag.get("pod_subnets").is_some())
    else {
        return Ok(Err(Status::waiting(
            "Waiting for pod_subnets in relation with contrail-kubernetes-config.",
        )));
    };
    let nested_mode_config = bag.get("nested_mode_config").map(str::to_string);
    if bag.flag("nested_mode") && nested_mode_config.is_none() {
        return Ok(Err(Status::waiting(
            "Waiting for nested_mode_config in relation with contrail-kubernetes-config.",
        )));
    }
    Ok(Ok(KubernetesConfig {
        pod_subnets: bag.get("pod_subnets").unwrap_or_default().to_string(),
        nested_mode_config,
    }))
}

/// Copies the CNI binaries onto the host, once per image
fn install_cni(ctx: &mut Ctx) -> Result<Option<Status>> {
    let image = ctx.image(CNI_INIT);
    let image_id = image.to_string();
    if ctx.config.string(CNI_INSTALLED).as_deref() == Some(image_id.as_str()) {
        return Ok(None);
    }
    if let Some(status) = common::pull_images(ctx, &[CNI_INIT])? {
        return Ok(Some(status));
    }
    let mut spec = RunSpec::new(image);
    spec.name = Some(CNI_INIT.to_string());
    spec.volumes = vec![
        "/opt/cni/bin:/host/opt_cni_bin".to_string(),
        "/var/log/contrail/cni:/host/log_cni".to_string(),
        "/etc/cni:/host/etc_cni".to_string(),
        "/var/lib/contrail:/var/lib/contrail".to_string(),
    ];
    ctx.runtime.run(&spec).context(RuntimeSnafu)?;
    tracing::info!(image = %image_id, "installed CNI plugin");
    ctx.config.set(CNI_INSTALLED, image_id);
    Ok(None)
}

pub fn update_status(ctx: &mut Ctx) -> Result<()> {
    let config = match kubernetes_config(ctx)? {
        Ok(config) => config,
        Err(status) => return ctx.set_status(status),
    };
    if common::in_maintenance(ctx) {
        return ctx.set_status(Status::ready());
    }
    if let Some(status) = install_cni(ctx)? {
        return ctx.set_status(status);
    }

    let mut context = Context::new().with("vrouter_ip", "127.0.0.1");
    if let Some(nested) = &config.nested_mode_config {
        context.insert("nested_mode_config", nested.as_str());
    }
    ctx.render(
        templates::CNI_CONF,
        &format!("{CNI_CONF_DIR}/{}", templates::CNI_CONF),
        &context,
        Perms::mode(0o644),
    )?;
    ctx.publish(
        CNI,
        Settings::from([
            ("cidr".to_string(), Some(config.pod_subnets)),
            (
                "cni-conf-file".to_string(),
                Some(templates::CNI_CONF.to_string()),
            ),
        ]),
    )?;
    ctx.set_status(Status::ready())
}
