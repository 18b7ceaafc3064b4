//! The analytics database: cassandra and the query engine.
use std::collections::BTreeMap;

use contrail_charm_core::{
    hookenv::Settings,
    hooks::{Hooks, RelationEvent},
    status::Status,
};

use super::{
    common::{self, ControllerFacts, Precondition, Workload},
    Error, Result, RoleProfile,
};
use crate::context::Ctx;

pub const MODULE: &str = "analyticsdb";

const CLUSTER: &str = "analyticsdb-cluster";
const CONTROLLER: &str = "contrail-analyticsdb";

const IMAGES: &[&str] = &[
    "contrail-node-init",
    "contrail-nodemgr",
    "contrail-analytics-query-engine",
    "contrail-external-cassandra",
];

pub const PROFILE: RoleProfile = RoleProfile {
    module: Some(MODULE),
    images: IMAGES,
    services: &[("database", &["nodemgr", "query-engine", "cassandra"])],
    ports: &[],
    version: Some(("contrail-analytics-query-engine", "python-contrail")),
    immutable_options: &[],
};

pub fn hooks(hooks: Hooks<Ctx, Error>) -> Hooks<Ctx, Error> {
    common::workload_hooks(hooks)
        .on_relation(CONTROLLER, RelationEvent::DATA, common::reconcile)
        .on_relation(CONTROLLER, RelationEvent::GONE, common::reconcile)
        .on_relation(CLUSTER, RelationEvent::DATA, common::reconcile)
        .on_relation(CLUSTER, RelationEvent::GONE, common::reconcile)
}

struct Inputs {
    facts: ControllerFacts,
    analytics_ips: Vec<String>,
    analyticsdb_ips: Vec<String>,
}

fn inputs(ctx: &Ctx, own_ip: &str) -> Result<Precondition<Inputs>> {
    if let Err(status) = common::missing_relations(ctx, &[CONTROLLER])? {
        return Ok(Err(status));
    }
    let remotes = ctx.relation_units(CONTROLLER)?;
    let facts = ControllerFacts::collect(ctx, CONTROLLER)?;
    if remotes.iter().all(|remote| remote.bag.get("controller_ips").is_none()) {
        return Ok(Err(Status::blocked(
            "Missing controller servers info in relation with contrail-analyticsdb.",
        )));
    }
    let mut analytics_ips: Vec<String> = remotes
        .iter()
        .filter(|remote| remote.bag.get("unit-type") == Some("analytics"))
        .filter_map(|remote| remote.bag.get("private-address").map(str::to_string))
        .collect();
    analytics_ips.sort();
    analytics_ips.dedup();
    if analytics_ips.is_empty() {
        analytics_ips = facts.analytics_servers.clone();
    }
    if analytics_ips.is_empty() {
        return Ok(Err(Status::blocked(
            "Missing analytics servers info in relation with contrail-analyticsdb.",
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
    if let Err(status) = common::tls_precondition(ctx)? {
        return Ok(Err(status));
    }

    let mut analyticsdb_ips: Vec<String> = ctx
        .relation_units(CLUSTER)?
        .iter()
        .filter_map(|peer| peer.bag.get("private-address").map(str::to_string))
        .collect();
    analyticsdb_ips.push(own_ip.to_string());
    analyticsdb_ips.sort();
    analyticsdb_ips.dedup();
    Ok(Ok(Inputs {
        facts,
        analytics_ips,
        analyticsdb_ips,
    }))
}

fn environment(ctx: &Ctx, inputs: &Inputs) -> BTreeMap<String, String> {
    let facts = &inputs.facts;
    let mut env = common::base_env(ctx, MODULE);
    env.extend([
        ("CONTROLLER_NODES".to_string(), common::join(&facts.controller_ips)),
        ("CONFIG_NODES".to_string(), common::join(&facts.controller_ips)),
        ("ANALYTICS_NODES".to_string(), common::join(&inputs.analytics_ips)),
        ("ANALYTICSDB_NODES".to_string(), common::join(&inputs.analyticsdb_ips)),
        (
            "JVM_EXTRA_OPTS".to_string(),
            ctx.config
                .string_or("cassandra-jvm-extra-opts", "-Xms1g -Xmx2g"),
        ),
        (
            "CASSANDRA_MINIMUM_DISKGB".to_string(),
            ctx.config.string_or("cassandra-minimum-diskgb", "20"),
        ),
    ]);
    common::auth_env(facts.auth_info.as_ref(), &mut env);
    env
}

fn workload(ctx: &Ctx, inputs: &Inputs) -> Workload {
    let mut workload = Workload::new(MODULE, IMAGES.to_vec());
    workload.env = environment(ctx, inputs);
    workload.compose = workload
        .compose
        .service("node-init", common::node_init(ctx, MODULE))
        .service(
            "cassandra",
            common::service(ctx, MODULE, "contrail-external-cassandra")
                .env("NODE_TYPE", "database")
                .volumes([
                    "/var/lib/contrail/analytics_database:/var/lib/cassandra",
                    "/var/log/contrail:/var/log/contrail",
                ])
                .depends_on("node-init"),
        )
        .service(
            "query-engine",
            common::service(ctx, MODULE, "contrail-analytics-query-engine")
                .volumes([
                    "/var/log/contrail:/var/log/contrail",
                    "/etc/contrail/ssl:/etc/contrail/ssl:ro",
                ])
                .depends_on("cassandra"),
        )
        .service("nodemgr", common::nodemgr(ctx, MODULE, "database"));
    workload
}

pub fn update_status(ctx: &mut Ctx) -> Result<()> {
    let own_ip = ctx.unit_ip("control-network", "control")?;
    let address = Settings::from([("private-address".to_string(), Some(own_ip.clone()))]);
    ctx.publish(CONTROLLER, address.clone())?;
    ctx.publish(CLUSTER, address)?;

    let inputs = match inputs(ctx, &own_ip)? {
        Ok(inputs) => inputs,
        Err(status) => return ctx.set_status(status),
    };
    let workload = workload(ctx, &inputs);
    common::deploy(ctx, workload)
}

#[cfg(test)]
mod tests {
    use contrail_charm_core::hooks::{STOP, UPDATE_STATUS};

    use super::*;
    use crate::{harness::Harness, roles::Role};

    fn analyticsdb() -> Harness {
        let harness = Harness::new(Role::Analyticsdb, "contrail-analyticsdb/0");
        harness.host.set_remote(
            "contrail-analyticsdb:1",
            "contrail-controller/0",
            [
                ("private-address", "10.0.0.10"),
                ("controller_ips", r#"["10.0.0.10"]"#),
                ("analytics-server", r#"["10.0.0.2"]"#),
            ],
        );
        harness.services_active(PROFILE.services);
        harness
    }

    #[test]
    fn happy_path() {
        let harness = analyticsdb();
        harness
            .host
            .set_remote("analyticsdb-cluster:4", "contrail-analyticsdb/1", [("private-address", "10.0.0.4")]);
        harness.run(UPDATE_STATUS).unwrap();

        assert_eq!(harness.status(), Status::ready());
        let env = harness.file("/etc/contrail/common_analyticsdb.env").unwrap();
        assert!(env.contains("ANALYTICSDB_NODES=10.0.0.4,10.0.0.5\n"));
        assert!(env.contains("ANALYTICS_NODES=10.0.0.2\n"));
        assert!(env.contains("AUTH_MODE=noauth\n"));
        assert_eq!(
            harness.host.local_bag("contrail-analyticsdb:1").get("private-address"),
            Some("10.0.0.5")
        );
    }

    #[test]
    fn analytics_units_take_precedence() {
        let harness = analyticsdb();
        harness.host.set_remote(
            "contrail-analyticsdb:1",
            "contrail-analytics/0",
            [("private-address", "10.0.0.7"), ("unit-type", "analytics")],
        );
        harness.run(UPDATE_STATUS).unwrap();
        let env = harness.file("/etc/contrail/common_analyticsdb.env").unwrap();
        assert!(env.contains("ANALYTICS_NODES=10.0.0.7\n"));
    }

    #[test]
    fn missing_controller_facts_block() {
        let harness = Harness::new(Role::Analyticsdb, "contrail-analyticsdb/0");
        harness.host.set_remote(
            "contrail-analyticsdb:1",
            "contrail-controller/0",
            [("private-address", "10.0.0.10")],
        );
        harness.run(UPDATE_STATUS).unwrap();
        assert_eq!(
            harness.status(),
            Status::blocked("Missing controller servers info in relation with contrail-analyticsdb.")
        );
    }

    #[test]
    fn stop_takes_the_containers_down() {
        let harness = analyticsdb();
        harness.run(STOP).unwrap();
        assert!(harness.runtime.compose_downs().is_empty());

        harness.run(UPDATE_STATUS).unwrap();
        harness.run(STOP).unwrap();
        let downs = harness.runtime.compose_downs();
        assert_eq!(downs.len(), 1);
        assert!(downs[0].ends_with("etc/contrail/analyticsdb/docker-compose.yaml"));
    }
}
