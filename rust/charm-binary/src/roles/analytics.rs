//! Analytics API, collector, alarm generation and SNMP collection.
use std::collections::BTreeMap;

use contrail_charm_core::{
    compose::ComposeService,
    haproxy::{self, CONTRAIL_ANALYTICS_API},
    hookenv::Settings,
    hooks::{Hooks, RelationEvent},
    status::Status,
};
use snafu::ResultExt;

use super::{
    common::{self, ControllerFacts, Precondition, Workload},
    Error, HaproxySnafu, Result, RoleProfile,
};
use crate::context::Ctx;

pub const MODULE: &str = "analytics";

const CLUSTER: &str = "analytics-cluster";
const CONTROLLER: &str = "contrail-analytics";
const ANALYTICSDB: &str = "contrail-analyticsdb";
const HTTP_SERVICES: &str = "http-services";

const IMAGES: &[&str] = &[
    "contrail-node-init",
    "contrail-nodemgr",
    "contrail-analytics-api",
    "contrail-analytics-collector",
    "contrail-analytics-alarm-gen",
    "contrail-analytics-snmp-collector",
    "contrail-analytics-snmp-topology",
    "contrail-external-kafka",
];

pub const PROFILE: RoleProfile = RoleProfile {
    module: Some(MODULE),
    images: IMAGES,
    services: &[
        ("analytics", &["api", "collector", "nodemgr"]),
        ("analytics-alarm", &["alarm-gen", "kafka", "nodemgr"]),
        ("analytics-snmp", &["snmp-collector", "topology", "nodemgr"]),
    ],
    ports: &[8081],
    version: Some(("contrail-analytics-api", "python-contrail")),
    immutable_options: &[],
};

pub fn hooks(hooks: Hooks<Ctx, Error>) -> Hooks<Ctx, Error> {
    let mut hooks = common::workload_hooks(hooks);
    for endpoint in [CONTROLLER, ANALYTICSDB, CLUSTER] {
        hooks = hooks
            .on_relation(endpoint, RelationEvent::DATA, common::reconcile)
            .on_relation(endpoint, RelationEvent::GONE, common::reconcile);
    }
    hooks.on_relation(HTTP_SERVICES, RelationEvent::DATA, common::reconcile)
}

struct Inputs {
    facts: ControllerFacts,
    analytics_ips: Vec<String>,
    analyticsdb_ips: Vec<String>,
}

/// Addresses of this unit and its analytics peers, sorted
fn cluster_ips(ctx: &Ctx, own_ip: &str) -> Result<Vec<String>> {
    let mut ips: Vec<String> = ctx
        .relation_units(CLUSTER)?
        .iter()
        .filter_map(|peer| peer.bag.get("private-address").map(str::to_string))
        .collect();
    ips.push(own_ip.to_string());
    ips.sort();
    ips.dedup();
    Ok(ips)
}

fn inputs(ctx: &Ctx, own_ip: &str) -> Result<Precondition<Inputs>> {
    if let Err(status) = common::missing_relations(ctx, &[CONTROLLER, ANALYTICSDB])? {
        return Ok(Err(status));
    }
    let facts = ControllerFacts::collect(ctx, CONTROLLER)?;
    if facts.controller_ips.is_empty() {
        return Ok(Err(Status::blocked(
            "Missing controller servers info in relation with contrail-analytics.",
        )));
    }
    let mut analyticsdb_ips: Vec<String> = ctx
        .relation_units(ANALYTICSDB)?
        .iter()
        .filter_map(|remote| remote.bag.get("private-address").map(str::to_string))
        .collect();
    analyticsdb_ips.sort();
    analyticsdb_ips.dedup();
    if analyticsdb_ips.is_empty() {
        return Ok(Err(Status::waiting(
            "Waiting for analyticsdb units in relation with contrail-analyticsdb.",
        )));
    }
    if let Some(orchestrator) = facts.cloud_orchestrator() {
        if let Err(status) = common::orchestrator_precondition(
            orchestrator,
            facts.auth_info.as_ref(),
            &facts.orchestrator_info,
            CONTROLLER,
        ) {
            return Ok(Err(status));
        }
    }
    // controllers running with TLS expect the analytics API to do the same
    if facts.ssl_enabled && !ctx.config.get_bool(common::TLS_PRESENT) {
        if let Err(status) = common::missing_relations(ctx, &[common::TLS_CERTIFICATES])? {
            return Ok(Err(status));
        }
    }
    if let Err(status) = common::tls_precondition(ctx)? {
        return Ok(Err(status));
    }
    Ok(Ok(Inputs {
        facts,
        analytics_ips: cluster_ips(ctx, own_ip)?,
        analyticsdb_ips,
    }))
}

fn publish(ctx: &mut Ctx, own_ip: &str) -> Result<()> {
    let settings = Settings::from([
        ("private-address".to_string(), Some(own_ip.to_string())),
        ("unit-type".to_string(), Some("analytics".to_string())),
    ]);
    ctx.publish(CONTROLLER, settings.clone())?;
    ctx.publish(ANALYTICSDB, settings)?;
    ctx.publish(
        CLUSTER,
        Settings::from([("private-address".to_string(), Some(own_ip.to_string()))]),
    )?;

    let vip = ctx.config.string("vip");
    if let Some(vip) = &vip {
        let mode = common::http_mode(ctx)?;
        let services = haproxy::services(
            &[CONTRAIL_ANALYTICS_API],
            vip,
            &ctx.local_unit(),
            own_ip,
            mode,
        );
        let yaml = haproxy::services_yaml(&services).context(HaproxySnafu)?;
        ctx.publish(
            HTTP_SERVICES,
            Settings::from([("services".to_string(), Some(yaml))]),
        )?;
    }
    haproxy::apply_port_policy(ctx.env(), PROFILE.ports, vip.as_deref()).context(HaproxySnafu)
}

fn environment(ctx: &Ctx, inputs: &Inputs) -> BTreeMap<String, String> {
    let facts = &inputs.facts;
    let analytics = common::join(&inputs.analytics_ips);
    let mut env = common::base_env(ctx, MODULE);
    env.extend([
        ("CONTROLLER_NODES".to_string(), common::join(&facts.controller_ips)),
        ("CONFIG_NODES".to_string(), common::join(&facts.controller_ips)),
        ("CONFIGDB_NODES".to_string(), common::join(&facts.controller_ips)),
        ("ANALYTICS_NODES".to_string(), analytics.clone()),
        ("ANALYTICS_ALARM_NODES".to_string(), analytics.clone()),
        ("ANALYTICS_SNMP_NODES".to_string(), analytics.clone()),
        ("KAFKA_NODES".to_string(), analytics),
        ("ANALYTICSDB_NODES".to_string(), common::join(&inputs.analyticsdb_ips)),
        (
            "ANALYTICS_API_VIP".to_string(),
            ctx.config.string("vip").unwrap_or_default(),
        ),
    ]);
    if let Some(mode) = &facts.auth_mode {
        env.insert("AAA_MODE".to_string(), mode.clone());
    }
    if let Some(orchestrator) = facts.cloud_orchestrator() {
        env.insert("CLOUD_ORCHESTRATOR".to_string(), orchestrator.to_string());
    }
    common::auth_env(facts.auth_info.as_ref(), &mut env);
    env.retain(|_, value| !value.is_empty());
    env
}

fn workload(ctx: &Ctx, inputs: &Inputs) -> Workload {
    let mut workload = Workload::new(MODULE, IMAGES.to_vec());
    workload.env = environment(ctx, inputs);

    let service = |image: &str| -> ComposeService {
        common::service(ctx, MODULE, image)
            .volume("/var/log/contrail:/var/log/contrail")
            .volume("/etc/contrail/ssl:/etc/contrail/ssl:ro")
            .depends_on("node-init")
    };
    workload.compose = workload
        .compose
        .service("node-init", common::node_init(ctx, MODULE))
        .service("api", service("contrail-analytics-api"))
        .service("collector", service("contrail-analytics-collector"))
        .service(
            "kafka",
            service("contrail-external-kafka").env("NODE_TYPE", "analytics-alarm"),
        )
        .service(
            "alarm-gen",
            service("contrail-analytics-alarm-gen").depends_on("kafka"),
        )
        .service("snmp-collector", service("contrail-analytics-snmp-collector"))
        .service("topology", service("contrail-analytics-snmp-topology"))
        .service("nodemgr", common::nodemgr(ctx, MODULE, "analytics"))
        .service(
            "alarm-nodemgr",
            common::nodemgr(ctx, MODULE, "analytics-alarm"),
        )
        .service(
            "snmp-nodemgr",
            common::nodemgr(ctx, MODULE, "analytics-snmp"),
        );
    workload
}

pub fn update_status(ctx: &mut Ctx) -> Result<()> {
    let own_ip = ctx.unit_ip("control-network", "control")?;
    publish(ctx, &own_ip)?;
    let inputs = match inputs(ctx, &own_ip)? {
        Ok(inputs) => inputs,
        Err(status) => return ctx.set_status(status),
    };
    let workload = workload(ctx, &inputs);
    common::deploy(ctx, workload)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use contrail_charm_core::{
        hookenv::HookEnvironment,
        hooks::{INSTALL, UPDATE_STATUS},
        status::WorkloadState,
    };

    use super::*;
    use crate::{harness::Harness, roles::Role};

    fn analytics() -> Harness {
        let harness = Harness::new(Role::Analytics, "contrail-analytics/0");
        harness.host.set_remote(
            "contrail-analytics:2",
            "contrail-controller/0",
            [
                ("private-address", "10.0.0.10"),
                ("controller_ips", r#"["10.0.0.10"]"#),
                ("orchestrator-info", r#"{"cloud_orchestrator":"kubernetes","kube_manager_token":"t","kubernetes_api_server":"10.0.0.30"}"#),
            ],
        );
        harness.host.set_remote(
            "contrail-analyticsdb:3",
            "contrail-analyticsdb/0",
            [("private-address", "10.0.0.20")],
        );
        harness.services_active(PROFILE.services);
        harness
    }

    #[test]
    fn happy_path() {
        let harness = analytics();
        harness.run(INSTALL).unwrap();
        assert_eq!(harness.status(), Status::ready());
        let env = harness.file("/etc/contrail/common_analytics.env").unwrap();
        assert!(env.contains("ANALYTICS_NODES=10.0.0.5\n"));
        assert!(env.contains("ANALYTICSDB_NODES=10.0.0.20\n"));
        assert!(env.contains("CLOUD_ORCHESTRATOR=kubernetes\n"));
        assert!(!env.contains("ANALYTICS_API_VIP"));
        assert_eq!(harness.runtime.pulls().len(), IMAGES.len());

        let bag = harness.host.local_bag("contrail-analytics:2");
        assert_eq!(bag.get("unit-type"), Some("analytics"));
        assert_eq!(bag.get("private-address"), Some("10.0.0.5"));
        assert_eq!(
            harness.host.opened_ports().unwrap(),
            BTreeSet::from([8081])
        );
    }

    #[test]
    fn waits_for_analyticsdb_units() {
        let harness = analytics();
        harness.host.remove_remote("contrail-analyticsdb:3", "contrail-analyticsdb/0");
        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(harness.status().state, WorkloadState::Waiting);
        assert!(harness.runtime.compose_ups().is_empty());
    }

    #[test]
    fn missing_relations_are_named() {
        let harness = Harness::new(Role::Analytics, "contrail-analytics/0");
        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(
            harness.status(),
            Status::blocked(
                "Missing or incomplete relations: contrail-analytics, contrail-analyticsdb"
            )
        );
    }

    #[test]
    fn tls_controllers_require_certificates() {
        let harness = analytics();
        harness
            .host
            .set_remote("contrail-analytics:2", "contrail-controller/0", [("ssl-enabled", "true")]);
        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(
            harness.status(),
            Status::blocked("Missing or incomplete relations: tls-certificates")
        );
    }

    #[test]
    fn vip_moves_traffic_to_the_balancer() {
        let harness = analytics();
        harness.host.add_relation("http-services:9");
        harness.host.set_config("vip", "10.0.0.99");
        harness.run(UPDATE_STATUS).unwrap();
        assert!(harness.host.opened_ports().unwrap().is_empty());
        let services = harness.host.local_bag("http-services:9");
        let yaml = services.get("services").unwrap();
        assert!(yaml.contains("contrail-analytics-api"));
        assert!(yaml.contains("10.0.0.99"));
        let env = harness.file("/etc/contrail/common_analytics.env").unwrap();
        assert!(env.contains("ANALYTICS_API_VIP=10.0.0.99\n"));
    }
}
