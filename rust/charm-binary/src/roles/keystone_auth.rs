//! Relays identity service credentials to the controllers.
use contrail_charm_core::{
    hookenv::Settings,
    hooks::{Hooks, RelationEvent},
    kv::RelationBag,
    payloads::{AuthInfo, ORCHESTRATOR_OPENSTACK},
    status::Status,
};
use snafu::ResultExt;

use super::{common, EncodeSnafu, Error, Result};
use crate::context::Ctx;

const IDENTITY_ADMIN: &str = "identity-admin";
const AUTH: &str = "contrail-auth";

pub fn hooks(hooks: Hooks<Ctx, Error>) -> Hooks<Ctx, Error> {
    hooks
        .on_relation(IDENTITY_ADMIN, RelationEvent::DATA, common::reconcile)
        .on_relation(IDENTITY_ADMIN, RelationEvent::GONE, common::reconcile)
        .on_relation(AUTH, RelationEvent::DATA, common::reconcile)
}

/// Translates the identity service's admin bag into the payload the controllers consume
fn auth_info(bag: &RelationBag) -> AuthInfo {
    let get = |key: &str| bag.get(key).map(str::to_string);
    AuthInfo {
        cloud_orchestrator: Some(ORCHESTRATOR_OPENSTACK.to_string()),
        keystone_protocol: get("service_protocol").or_else(|| Some("http".to_string())),
        keystone_ip: get("service_hostname"),
        keystone_public_port: Some("5000".to_string()),
        keystone_admin_port: get("service_port"),
        keystone_api_version: get("api_version").or_else(|| Some("2".to_string())),
        keystone_admin_user: get("service_username"),
        keystone_admin_password: get("service_password"),
        keystone_admin_tenant: get("service_tenant_name"),
        keystone_region: get("service_region"),
        keystone_user_domain_name: get("service_user_domain_name"),
        keystone_project_domain_name: get("service_project_domain_name"),
        keystone_project_name: get("service_project_name"),
        keystone_ssl_ca: get("ca_cert"),
    }
}

pub fn update_status(ctx: &mut Ctx) -> Result<()> {
    if let Err(status) = common::missing_relations(ctx, &[IDENTITY_ADMIN])? {
        return ctx.set_status(status);
    }
    let remotes = ctx.relation_units(IDENTITY_ADMIN)?;
    let Some(bag) = remotes
        .iter()
        .map(|remote| &remote.bag)
        .find(|bag| bag.get("service_hostname").is_some())
    else {
        return ctx.set_status(Status::waiting(
            "Waiting for service_hostname in relation with identity-admin.",
        ));
    };
    let info = serde_json::to_string(&auth_info(bag)).context(EncodeSnafu { what: "auth info" })?;
    ctx.publish(AUTH, Settings::from([("auth-info".to_string(), Some(info))]))?;
    ctx.set_status(Status::ready())
}

#[cfg(test)]
mod tests {
    use contrail_charm_core::hooks::{Hook, UPDATE_STATUS};

    use super::*;
    use crate::{harness::Harness, roles::Role};

    #[test]
    fn maps_identity_admin_to_auth_info() {
        let bag = RelationBag::from([
            ("service_hostname", "10.0.0.3"),
            ("service_port", "35357"),
            ("service_username", "admin"),
            ("service_password", "secret"),
            ("service_tenant_name", "admin"),
            ("api_version", "3"),
        ]);
        let info = auth_info(&bag);
        assert_eq!(info.keystone_ip.as_deref(), Some("10.0.0.3"));
        assert_eq!(info.keystone_admin_port.as_deref(), Some("35357"));
        assert_eq!(info.keystone_protocol.as_deref(), Some("http"));
        assert_eq!(info.auth_url().as_deref(), Some("http://10.0.0.3:5000/v3"));
    }

    #[test]
    fn publishes_on_contrail_auth() {
        let harness = Harness::new(Role::KeystoneAuth, "keystone-auth/0");
        harness.host.add_relation("contrail-auth:2");
        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(
            harness.status(),
            Status::blocked("Missing or incomplete relations: identity-admin")
        );

        harness.host.set_remote(
            "identity-admin:1",
            "keystone/0",
            [("service_hostname", "10.0.0.3"), ("service_password", "secret")],
        );
        let changed = Hook::relation(IDENTITY_ADMIN, RelationEvent::Changed).to_string();
        harness
            .run_relation(&changed, "identity-admin:1", Some("keystone/0"))
            .unwrap();
        assert_eq!(harness.status(), Status::ready());
        let info: AuthInfo = harness
            .host
            .local_bag("contrail-auth:2")
            .json("auth-info")
            .unwrap()
            .unwrap();
        assert_eq!(info.cloud_orchestrator.as_deref(), Some("openstack"));
        assert_eq!(info.keystone_admin_password.as_deref(), Some("secret"));
    }

    #[test]
    fn waits_for_the_hostname() {
        let harness = Harness::new(Role::KeystoneAuth, "keystone-auth/0");
        harness.host.add_relation("identity-admin:1");
        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(
            harness.status(),
            Status::waiting("Waiting for service_hostname in relation with identity-admin.")
        );
    }
}
