//! Publishes the Contrail API endpoints to an HAProxy frontend.
use contrail_charm_core::{
    haproxy::{
        self, Endpoint, CONTRAIL_ANALYTICS_API, CONTRAIL_API, CONTRAIL_WEBUI_HTTP,
        CONTRAIL_WEBUI_HTTPS,
    },
    hookenv::Settings,
    hooks::{Hooks, RelationEvent},
    status::Status,
};
use snafu::ResultExt;

use super::{common, Error, HaproxySnafu, Result, RoleProfile};
use crate::context::Ctx;

const HTTP_SERVICES: &str = "http-services";

pub const PROFILE: RoleProfile = RoleProfile {
    module: None,
    images: &[],
    services: &[],
    ports: &[
        CONTRAIL_ANALYTICS_API.port,
        CONTRAIL_API.port,
        CONTRAIL_WEBUI_HTTP.port,
        CONTRAIL_WEBUI_HTTPS.port,
    ],
    version: None,
    immutable_options: &[],
};

pub fn hooks(hooks: Hooks<Ctx, Error>) -> Hooks<Ctx, Error> {
    hooks.on_relation(HTTP_SERVICES, RelationEvent::DATA, common::reconcile)
}

/// Every API the Contrail controllers and analytics nodes expose.
///
/// The balancer fronts the whole control plane from one frontend, so besides contrail-api it
/// also carries the analytics API and both web UI ports. Controller and analytics units only
/// advertise their own subset.
const FRONTED: &[Endpoint] = &[
    CONTRAIL_API,
    CONTRAIL_ANALYTICS_API,
    CONTRAIL_WEBUI_HTTP,
    CONTRAIL_WEBUI_HTTPS,
];

/// Publishes contrail-api, contrail-analytics-api and the http and https web UI endpoints
/// behind `vip` on the http-services relation
fn publish_services(ctx: &mut Ctx, vip: &str) -> Result<()> {
    let mode = common::http_mode(ctx)?;
    let ip = ctx.unit_ip("control-network", "control")?;
    let services = haproxy::services(FRONTED, vip, &ctx.local_unit(), &ip, mode);
    let yaml = haproxy::services_yaml(&services).context(HaproxySnafu)?;
    ctx.publish(
        HTTP_SERVICES,
        Settings::from([("services".to_string(), Some(yaml))]),
    )?;
    Ok(())
}

pub fn update_status(ctx: &mut Ctx) -> Result<()> {
    let vip = ctx.config.string("vip");
    if let Some(vip) = &vip {
        publish_services(ctx, vip)?;
    }
    haproxy::apply_port_policy(ctx.env(), PROFILE.ports, vip.as_deref()).context(HaproxySnafu)?;
    ctx.set_status(Status::ready())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use contrail_charm_core::{
        haproxy::{HaproxyService, Server, SERVER_CHECK},
        hookenv::HookEnvironment,
        hooks::{CONFIG_CHANGED, UPDATE_STATUS},
    };

    use super::*;
    use crate::{harness::Harness, roles::Role};

    fn lb() -> Harness {
        let harness = Harness::new(Role::Lb, "contrail-lb/0");
        harness.host.add_relation("http-services:1");
        harness
    }

    #[test]
    fn vip_publishes_services_and_closes_ports() {
        let harness = lb();
        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(
            harness.host.opened_ports().unwrap(),
            BTreeSet::from([8080, 8081, 8082, 8143])
        );

        harness.host.set_config("vip", "10.0.0.99");
        harness.host.set_config("haproxy-http-mode", "http");
        harness.run(CONFIG_CHANGED).unwrap();

        assert!(harness.host.opened_ports().unwrap().is_empty());
        let services: Vec<HaproxyService> = harness
            .host
            .local_bag("http-services:1")
            .yaml("services")
            .unwrap()
            .unwrap();
        let api = services
            .iter()
            .find(|service| service.service_name == "contrail-api")
            .unwrap();
        assert_eq!(api.service_host, "10.0.0.99");
        assert_eq!(api.service_port, 8082);
        assert_eq!(
            api.servers,
            [Server(
                "contrail-lb-0".to_string(),
                "10.0.0.5".to_string(),
                8082,
                SERVER_CHECK.to_string()
            )]
        );
        assert!(api.service_options.contains(
            &"redirect scheme https code 301 if { hdr(host) -i 10.0.0.99 } !{ ssl_fc }".to_string()
        ));
        assert!(api.service_options.contains(&"option httpchk GET /".to_string()));
        assert_eq!(harness.status(), Status::ready());
    }

    #[test]
    fn https_mode_is_plain_tcp() {
        let harness = lb();
        harness.host.set_config("vip", "10.0.0.99");
        harness.host.set_config("haproxy-http-mode", "https");
        harness.run(CONFIG_CHANGED).unwrap();
        let services: Vec<HaproxyService> = harness
            .host
            .local_bag("http-services:1")
            .yaml("services")
            .unwrap()
            .unwrap();
        assert!(services[0].service_options.contains(&"mode tcp".to_string()));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let harness = lb();
        harness.host.set_config("haproxy-http-mode", "quic");
        let error = harness.run(CONFIG_CHANGED).unwrap_err();
        assert_eq!(error.category(), "InvalidConfig");
    }

    #[test]
    fn unknown_mode_fails_every_hook_that_publishes() {
        let harness = lb();
        harness.host.set_config("vip", "10.0.0.99");
        harness.host.set_config("haproxy-http-mode", "quic");
        let error = harness.run(UPDATE_STATUS).unwrap_err();
        assert_eq!(error.category(), "InvalidConfig");
        assert_eq!(harness.host.local_bag("http-services:1").get("services"), None);
    }

    #[test]
    fn fronts_the_whole_control_plane() {
        let harness = lb();
        harness.host.set_config("vip", "10.0.0.99");
        harness.run(UPDATE_STATUS).unwrap();
        let services: Vec<HaproxyService> = harness
            .host
            .local_bag("http-services:1")
            .yaml("services")
            .unwrap()
            .unwrap();
        let names: BTreeSet<&str> = services
            .iter()
            .map(|service| service.service_name.as_str())
            .collect();
        assert_eq!(
            names,
            BTreeSet::from([
                "contrail-analytics-api",
                "contrail-api",
                "contrail-webui-http",
                "contrail-webui-https"
            ])
        );
    }
}
