//! Plugs the Contrail core plugin into neutron-server.
use serde_json::json;
use snafu::ResultExt;

use contrail_charm_core::{
    hookenv::Settings,
    hooks::{Hooks, RelationEvent},
    payloads::{AuthInfo, KEYSTONE_ADMIN},
    status::Status,
    templating::{Context, Perms},
};

use super::{
    common::{self, ControllerFacts},
    EncodeSnafu, Error, RenderSnafu, Result, SettingsSnafu,
};
use crate::{context::Ctx, templates};

const CONTROLLER: &str = "contrail-controller";
const AUTH: &str = "contrail-auth";
const NEUTRON_API: &str = "neutron-api";

const NEUTRON_SERVER: &str = "neutron-server";
pub const PLUGIN_CONFIG: &str = "/etc/neutron/plugins/opencontrail/ContrailPlugin.ini";
const EXTENSIONS_PATH: &str =
    "extensions:/usr/lib/python3/dist-packages/neutron_plugin_contrail/extensions";

pub fn hooks(hooks: Hooks<Ctx, Error>) -> Hooks<Ctx, Error> {
    hooks
        .on_relation(CONTROLLER, RelationEvent::DATA, common::reconcile)
        .on_relation(CONTROLLER, RelationEvent::GONE, common::reconcile)
        .on_relation(AUTH, RelationEvent::DATA, common::reconcile)
        .on_relation(AUTH, RelationEvent::GONE, common::reconcile)
        .on_relation(NEUTRON_API, RelationEvent::DATA, common::reconcile)
}

/// What neutron-api needs to load the Contrail plugin
pub fn plugin_settings() -> Result<Settings> {
    let subordinate = json!({
        "neutron": {
            "/etc/neutron/neutron.conf": {
                "sections": {"DEFAULT": [["api_extensions_path", EXTENSIONS_PATH]]}
            }
        }
    });
    let subordinate = serde_json::to_string(&subordinate).context(EncodeSnafu {
        what: "neutron subordinate configuration",
    })?;
    Ok([
        ("neutron-plugin", "contrail"),
        (
            "core-plugin",
            "neutron_plugin_contrail.plugins.opencontrail.contrail_plugin.NeutronPluginContrailCoreV2",
        ),
        (
            "service-plugins",
            "neutron_plugin_contrail.plugins.opencontrail.loadbalancer.v2.plugin.LoadBalancerPluginV2",
        ),
        (
            "quota-driver",
            "neutron_plugin_contrail.plugins.opencontrail.quota.driver.QuotaDriver",
        ),
        ("neutron-plugin-config", PLUGIN_CONFIG),
        ("subordinate_configuration", subordinate.as_str()),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), Some(value.to_string())))
    .collect())
}

/// Credentials published by the identity relay
fn relation_auth(ctx: &Ctx) -> Result<Option<AuthInfo>> {
    for remote in ctx.relation_units(AUTH)? {
        if let Some(auth) = remote.bag.json::<AuthInfo>("auth-info").context(SettingsSnafu)? {
            return Ok(Some(auth));
        }
    }
    Ok(None)
}

pub fn update_status(ctx: &mut Ctx) -> Result<()> {
    ctx.publish(NEUTRON_API, plugin_settings()?)?;
    if let Err(status) = common::missing_relations(ctx, &[CONTROLLER, AUTH])? {
        return ctx.set_status(status);
    }
    let facts = ControllerFacts::collect(ctx, CONTROLLER)?;
    let Some(api_ip) = facts.api_ip().map(str::to_string) else {
        return ctx.set_status(Status::blocked(
            "Missing api_ip info in relation with contrail-controller.",
        ));
    };
    let auth = relation_auth(ctx)?.or_else(|| facts.auth_info.clone());
    let auth = match common::require_auth(auth, KEYSTONE_ADMIN, AUTH) {
        Ok(auth) => auth,
        Err(status) => return ctx.set_status(status),
    };

    let mut context = Context::from_serializable(&auth).context(RenderSnafu)?;
    context
        .insert("api_server", api_ip)
        .insert("api_port", facts.api_port())
        .insert("auth_url", auth.auth_url().unwrap_or_default());
    let changed = ctx.render(
        templates::CONTRAIL_PLUGIN_INI,
        PLUGIN_CONFIG,
        &context,
        Perms::mode(0o640),
    )?;
    if let Some(status) = common::restart_host_service(ctx, NEUTRON_SERVER, changed) {
        return ctx.set_status(status);
    }
    ctx.set_status(Status::ready())
}

#[cfg(test)]
mod tests {
    use contrail_charm_core::hooks::{Hook, UPDATE_STATUS};

    use super::*;
    use crate::{harness::Harness, roles::Role};

    const RESTART: &[&str] = &["systemctl", "restart", "neutron-server"];

    fn auth_info(password: &str) -> String {
        format!(
            r#"{{"cloud_orchestrator":"openstack","keystone_ip":"10.0.0.3","keystone_admin_user":"admin","keystone_admin_password":"{password}","keystone_admin_tenant":"admin"}}"#
        )
    }

    fn neutron() -> Harness {
        let harness = Harness::new(Role::OpenstackNeutronApi, "contrail-openstack/0");
        harness.host.set_remote(
            "contrail-controller:1",
            "contrail-controller/0",
            [
                ("private-address", "10.0.0.10"),
                ("controller_ips", r#"["10.0.0.10"]"#),
                ("port", "8082"),
            ],
        );
        harness.host.set_remote(
            "contrail-auth:2",
            "contrail-keystone-auth/0",
            [("auth-info", auth_info("secret").as_str())],
        );
        harness.host.add_relation("neutron-api:3");
        harness
    }

    #[test]
    fn restarts_neutron_only_when_the_plugin_config_changes() {
        let harness = neutron();
        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(harness.executor.count(RESTART), 1);
        let ini = harness.file(PLUGIN_CONFIG).unwrap();
        assert!(ini.contains("api_server_ip = 10.0.0.10\n"));
        assert!(ini.contains("admin_password = secret\n"));
        assert!(ini.contains("auth_url = http://10.0.0.3:5000/v2.0\n"));
        assert_eq!(harness.status(), Status::ready());

        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(harness.executor.count(RESTART), 1);

        harness.host.set_remote(
            "contrail-auth:2",
            "contrail-keystone-auth/0",
            [("auth-info", auth_info("rotated").as_str())],
        );
        let changed = Hook::relation(AUTH, RelationEvent::Changed).to_string();
        harness
            .run_relation(&changed, "contrail-auth:2", Some("contrail-keystone-auth/0"))
            .unwrap();
        assert_eq!(harness.executor.count(RESTART), 2);
        assert!(harness.file(PLUGIN_CONFIG).unwrap().contains("admin_password = rotated\n"));
    }

    #[test]
    fn announces_the_plugin_to_neutron() {
        let harness = neutron();
        harness.run(UPDATE_STATUS).unwrap();
        let bag = harness.host.local_bag("neutron-api:3");
        assert_eq!(bag.get("neutron-plugin"), Some("contrail"));
        assert_eq!(bag.get("neutron-plugin-config"), Some(PLUGIN_CONFIG));
        let subordinate: serde_json::Value =
            bag.json("subordinate_configuration").unwrap().unwrap();
        assert_eq!(
            subordinate["neutron"]["/etc/neutron/neutron.conf"]["sections"]["DEFAULT"][0][0],
            "api_extensions_path"
        );
    }

    #[test]
    fn failed_restart_is_retried_by_the_next_hook() {
        let harness = neutron();
        harness.executor.fail(RESTART, "Job for neutron-server.service failed");
        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(harness.executor.count(RESTART), 1);
        assert_eq!(
            harness.status(),
            Status::blocked("neutron-server could not be restarted")
        );

        harness.executor.succeed(RESTART, "");
        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(harness.executor.count(RESTART), 2);
        assert_eq!(harness.status(), Status::ready());

        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(harness.executor.count(RESTART), 2);
    }

    #[test]
    fn partial_auth_info_blocks_naming_the_field() {
        let harness = neutron();
        harness.host.set_remote(
            "contrail-auth:2",
            "contrail-keystone-auth/0",
            [("auth-info", r#"{"keystone_ip":"10.0.0.3"}"#)],
        );
        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(
            harness.status(),
            Status::blocked("Missing keystone_admin_user in auth info from contrail-auth.")
        );
        assert!(harness.file(PLUGIN_CONFIG).is_none());
        assert_eq!(harness.executor.count(RESTART), 0);
    }

    #[test]
    fn missing_auth_blocks() {
        let harness = Harness::new(Role::OpenstackNeutronApi, "contrail-openstack/0");
        harness.host.set_remote(
            "contrail-controller:1",
            "contrail-controller/0",
            [("controller_ips", r#"["10.0.0.10"]"#)],
        );
        harness.host.add_relation("contrail-auth:2");
        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(
            harness.status(),
            Status::blocked("Missing auth info in relation with contrail-auth.")
        );
        assert_eq!(harness.executor.count(RESTART), 0);
    }
}
