//! Installs the Contrail plugins into OpenStack services and tells the controllers that
//! OpenStack orchestrates the cloud.
use serde_json::json;
use snafu::ResultExt;

use contrail_charm_core::{
    docker::RunSpec,
    hookenv::Settings,
    hooks::{Hooks, RelationEvent},
    payloads::{AuthInfo, OrchestratorInfo, KEYSTONE_ADMIN, ORCHESTRATOR_OPENSTACK},
    status::Status,
};

use super::{
    common::{self, ControllerFacts},
    openstack_compute, openstack_neutron_api, EncodeSnafu, Error, Result, RoleProfile,
    RuntimeSnafu,
};
use crate::context::Ctx;

const CONTROLLER: &str = "contrail-controller";
const NEUTRON_API: &str = "neutron-api";
const NOVA_COMPUTE: &str = "nova-compute";
const HEAT_PLUGIN: &str = "heat-plugin";

const NEUTRON_INIT: &str = "contrail-openstack-neutron-init";
const COMPUTE_INIT: &str = "contrail-openstack-compute-init";
const HEAT_INIT: &str = "contrail-openstack-heat-init";

/// The plugin image installed for each related OpenStack service
const PLUGINS: &[(&str, &str)] = &[
    (NEUTRON_API, NEUTRON_INIT),
    (NOVA_COMPUTE, COMPUTE_INIT),
    (HEAT_PLUGIN, HEAT_INIT),
];

pub const PROFILE: RoleProfile = RoleProfile {
    module: None,
    images: &[NEUTRON_INIT, COMPUTE_INIT, HEAT_INIT],
    services: &[],
    ports: &[],
    version: None,
    immutable_options: &[],
};

pub fn hooks(hooks: Hooks<Ctx, Error>) -> Hooks<Ctx, Error> {
    let hooks = hooks
        .on_relation(CONTROLLER, RelationEvent::DATA, common::reconcile)
        .on_relation(CONTROLLER, RelationEvent::GONE, common::reconcile);
    PLUGINS.iter().fold(hooks, |hooks, &(endpoint, _)| {
        hooks.on_relation(endpoint, RelationEvent::DATA, common::reconcile)
    })
}

fn installed_key(endpoint: &str) -> String {
    format!("plugin-installed-{endpoint}")
}

/// Copies the plugin shipped in `image` into the host's python tree, once per image
fn install_plugin(ctx: &mut Ctx, endpoint: &str, image_name: &str) -> Result<Option<Status>> {
    let image = ctx.image(image_name);
    let image_id = image.to_string();
    let key = installed_key(endpoint);
    if ctx.config.string(&key).as_deref() == Some(image_id.as_str()) {
        return Ok(None);
    }
    if let Some(status) = common::pull_images(ctx, &[image_name])? {
        return Ok(Some(status));
    }
    let mut spec = RunSpec::new(image);
    spec.name = Some(image_name.to_string());
    spec.volumes = vec![
        "/usr/lib/python3/dist-packages:/opt/plugin/site-packages".to_string(),
        "/usr/bin:/opt/plugin/bin".to_string(),
    ];
    ctx.runtime.run(&spec).context(RuntimeSnafu)?;
    tracing::info!(endpoint, image = %image_id, "installed plugin");
    ctx.config.set(key, image_id);
    Ok(None)
}

fn heat_settings(api_ip: &str, auth: &AuthInfo) -> Result<Settings> {
    let field = |value: &Option<String>| value.clone().unwrap_or_default();
    let subordinate = json!({
        "heat": {
            "/etc/heat/heat.conf": {
                "sections": {
                    "clients_contrail": [
                        ["user", field(&auth.keystone_admin_user)],
                        ["password", field(&auth.keystone_admin_password)],
                        ["tenant", field(&auth.keystone_admin_tenant)],
                        ["api_server", api_ip],
                        ["auth_host_ip", field(&auth.keystone_ip)],
                    ]
                }
            }
        }
    });
    let subordinate = serde_json::to_string(&subordinate).context(EncodeSnafu {
        what: "heat subordinate configuration",
    })?;
    Ok(Settings::from([(
        "subordinate_configuration".to_string(),
        Some(subordinate),
    )]))
}

pub fn update_status(ctx: &mut Ctx) -> Result<()> {
    let info = OrchestratorInfo {
        cloud_orchestrator: Some(ORCHESTRATOR_OPENSTACK.to_string()),
        ..OrchestratorInfo::default()
    };
    let info = serde_json::to_string(&info).context(EncodeSnafu {
        what: "orchestrator info",
    })?;
    ctx.publish(
        CONTROLLER,
        Settings::from([
            ("orchestrator-info".to_string(), Some(info)),
            ("unit-type".to_string(), Some(ORCHESTRATOR_OPENSTACK.to_string())),
        ]),
    )?;

    if let Err(status) = common::missing_relations(ctx, &[CONTROLLER])? {
        return ctx.set_status(status);
    }
    let facts = ControllerFacts::collect(ctx, CONTROLLER)?;
    let Some(api_ip) = facts.api_ip().map(str::to_string) else {
        return ctx.set_status(Status::blocked(
            "Missing api_ip info in relation with contrail-controller.",
        ));
    };
    let auth = facts.auth_info.clone();
    let auth = match common::require_auth(auth, KEYSTONE_ADMIN, CONTROLLER) {
        Ok(auth) => auth,
        Err(status) => return ctx.set_status(status),
    };
    if common::in_maintenance(ctx) {
        return ctx.set_status(Status::ready());
    }

    for &(endpoint, image) in PLUGINS {
        if !ctx.has_relation(endpoint)? {
            continue;
        }
        if let Some(status) = install_plugin(ctx, endpoint, image)? {
            return ctx.set_status(status);
        }
        let settings = match endpoint {
            NEUTRON_API => openstack_neutron_api::plugin_settings()?,
            NOVA_COMPUTE => openstack_compute::nova_settings(&facts)?,
            _ => heat_settings(&api_ip, &auth)?,
        };
        ctx.publish(endpoint, settings)?;
    }
    ctx.set_status(Status::ready())
}

#[cfg(test)]
mod tests {
    use contrail_charm_core::hooks::UPDATE_STATUS;

    use super::*;
    use crate::{harness::Harness, roles::Role};

    const AUTH: &str = r#"{"cloud_orchestrator":"openstack","keystone_ip":"10.0.0.3","keystone_admin_user":"admin","keystone_admin_password":"secret","keystone_admin_tenant":"admin"}"#;

    fn openstack() -> Harness {
        let harness = Harness::new(Role::Openstack, "contrail-openstack/0");
        harness.host.set_config("image-tag", "2011.138");
        harness.host.set_remote(
            "contrail-controller:1",
            "contrail-controller/0",
            [("controller_ips", r#"["10.0.0.10"]"#), ("auth-info", AUTH)],
        );
        harness
    }

    #[test]
    fn announces_the_orchestrator() {
        let harness = openstack();
        harness.run(UPDATE_STATUS).unwrap();
        let bag = harness.host.local_bag("contrail-controller:1");
        assert_eq!(bag.get("unit-type"), Some("openstack"));
        let info: OrchestratorInfo = bag.json("orchestrator-info").unwrap().unwrap();
        assert_eq!(info.cloud_orchestrator.as_deref(), Some("openstack"));
        assert_eq!(harness.status(), Status::ready());
        assert!(harness.runtime.runs().is_empty());
    }

    #[test]
    fn installs_plugins_of_related_services_once_per_image() {
        let harness = openstack();
        harness.host.add_relation("neutron-api:2");
        harness.host.add_relation("heat-plugin:3");
        harness.run(UPDATE_STATUS).unwrap();
        harness.run(UPDATE_STATUS).unwrap();

        let installed: Vec<String> = harness
            .runtime
            .runs()
            .into_iter()
            .map(|spec| spec.image.name)
            .collect();
        assert_eq!(installed, [NEUTRON_INIT, HEAT_INIT]);

        assert_eq!(
            harness.host.local_bag("neutron-api:2").get("neutron-plugin"),
            Some("contrail")
        );
        let heat: serde_json::Value = harness
            .host
            .local_bag("heat-plugin:3")
            .json("subordinate_configuration")
            .unwrap()
            .unwrap();
        assert_eq!(
            heat["heat"]["/etc/heat/heat.conf"]["sections"]["clients_contrail"][3][1],
            "10.0.0.10"
        );

        harness.host.set_config("image-tag", "2011.139");
        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(harness.runtime.runs().len(), 4);
    }

    #[test]
    fn missing_auth_blocks() {
        let harness = Harness::new(Role::Openstack, "contrail-openstack/0");
        harness.host.set_remote(
            "contrail-controller:1",
            "contrail-controller/0",
            [("controller_ips", r#"["10.0.0.10"]"#)],
        );
        harness.host.add_relation("nova-compute:2");
        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(
            harness.status(),
            Status::blocked("Missing auth info in relation with contrail-controller.")
        );
        assert!(harness.runtime.runs().is_empty());
    }

    #[test]
    fn auth_info_without_admin_tenant_blocks() {
        let harness = openstack();
        harness.host.set_remote(
            "contrail-controller:1",
            "contrail-controller/0",
            [(
                "auth-info",
                r#"{"keystone_ip":"10.0.0.3","keystone_admin_user":"admin"}"#,
            )],
        );
        harness.host.add_relation("heat-plugin:3");
        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(
            harness.status(),
            Status::blocked("Missing keystone_admin_tenant in auth info from contrail-controller.")
        );
        assert_eq!(harness.host.local_bag("heat-plugin:3").get("subordinate_configuration"), None);
    }
}
