//! Config, control and web UI nodes; the leader owns the cluster membership.
use std::collections::{BTreeMap, BTreeSet};

use contrail_charm_core::{
    haproxy::{self, CONTRAIL_API, CONTRAIL_WEBUI_HTTP, CONTRAIL_WEBUI_HTTPS},
    hookenv::Settings,
    hooks::{Hooks, RelationEvent},
    membership::{AddressFamily, Membership},
    payloads::{AgentsInfo, AuthInfo, OrchestratorInfo, ORCHESTRATOR_OPENSTACK},
    status::Status,
};
use snafu::ResultExt;

use super::{
    common::{self, Precondition, Workload},
    EncodeSnafu, Error, HaproxySnafu, MembershipSnafu, Result, RoleProfile, SettingsSnafu,
};
use crate::context::Ctx;

pub const MODULE: &str = "controller";

const CLUSTER: &str = "controller-cluster";
const CONTROLLER: &str = "contrail-controller";
const ANALYTICS: &str = "contrail-analytics";
const ANALYTICSDB: &str = "contrail-analyticsdb";
const AUTH: &str = "contrail-auth";
const ISSU: &str = "contrail-issu";
const HTTP_SERVICES: &str = "http-services";
const HTTPS_SERVICES: &str = "https-services";

/// Leader settings key of the secret shared between the metadata proxy and nova
pub const METADATA_SHARED_SECRET: &str = "metadata_shared_secret";

/// Every endpoint the cluster facts are published on
const DOWNSTREAM: &[&str] = &[CONTROLLER, ANALYTICS, ANALYTICSDB, ISSU];

const IMAGES: &[&str] = &[
    "contrail-node-init",
    "contrail-nodemgr",
    "contrail-controller-config-api",
    "contrail-controller-config-svcmonitor",
    "contrail-controller-config-schema",
    "contrail-controller-config-devicemgr",
    "contrail-controller-control-control",
    "contrail-controller-control-named",
    "contrail-controller-control-dns",
    "contrail-controller-webui-web",
    "contrail-controller-webui-job",
    "contrail-external-cassandra",
    "contrail-external-zookeeper",
    "contrail-external-rabbitmq",
    "contrail-external-redis",
];

pub const PROFILE: RoleProfile = RoleProfile {
    module: Some(MODULE),
    images: IMAGES,
    services: &[
        ("control", &["control", "nodemgr", "named", "dns"]),
        (
            "config-database",
            &["nodemgr", "zookeeper", "rabbitmq", "cassandra"],
        ),
        ("webui", &["web", "job"]),
        (
            "config",
            &["svc-monitor", "nodemgr", "device-manager", "api", "schema"],
        ),
    ],
    ports: &[8082, 8080, 8143],
    version: Some(("contrail-controller-config-api", "python-contrail")),
    immutable_options: &[],
};

pub fn hooks(hooks: Hooks<Ctx, Error>) -> Hooks<Ctx, Error> {
    let mut hooks = common::workload_hooks(hooks)
        .on_relation(CLUSTER, RelationEvent::DATA, common::reconcile)
        .on_relation(CLUSTER, &[RelationEvent::Departed], peer_departed);
    for endpoint in [CONTROLLER, ANALYTICS, ANALYTICSDB, AUTH, ISSU] {
        hooks = hooks
            .on_relation(endpoint, RelationEvent::DATA, common::reconcile)
            .on_relation(endpoint, RelationEvent::GONE, common::reconcile);
    }
    hooks
        .on_relation(HTTP_SERVICES, RelationEvent::DATA, common::reconcile)
        .on_relation(HTTPS_SERVICES, RelationEvent::DATA, common::reconcile)
}

/// Drops the departing peer from the membership before reconciling
fn peer_departed(ctx: &mut Ctx) -> Result<()> {
    if let Some(unit) = ctx.env.remote_unit().filter(|_| ctx.is_leader()) {
        let mut settings = Settings::new();
        for family in AddressFamily::all() {
            let mut membership = Membership::load(&ctx.leader, family).context(MembershipSnafu)?;
            if let Some(address) = membership.depart(&unit) {
                tracing::info!(%unit, %address, ?family, "controller left the cluster");
                settings.extend(membership.to_settings(family).context(MembershipSnafu)?);
            }
        }
        let env = ctx.env.clone();
        ctx.leader.set(env.as_ref(), settings).context(SettingsSnafu)?;
    }
    common::reconcile(ctx)
}

struct Addresses {
    ip: String,
    data_ip: String,
}

impl Addresses {
    fn of(&self, family: AddressFamily) -> &str {
        match family {
            AddressFamily::Ip => &self.ip,
            AddressFamily::DataIp => &self.data_ip,
        }
    }
}

/// Observes every current peer, departs vanished ones and generates the shared secret
fn lead(ctx: &mut Ctx, own: &Addresses) -> Result<()> {
    let unit = ctx.local_unit();
    let peers = ctx.relation_units(CLUSTER)?;
    let mut settings = Settings::new();

    for family in AddressFamily::all() {
        let mut observations = vec![(unit.clone(), own.of(family).to_string())];
        for peer in &peers {
            let key = match family {
                AddressFamily::Ip => "unit-address",
                AddressFamily::DataIp => "data-address",
            };
            let address = peer
                .bag
                .get(key)
                .or_else(|| peer.bag.get("unit-address"))
                .or_else(|| peer.bag.get("private-address"));
            if let Some(address) = address {
                observations.push((peer.unit.clone(), address.to_string()));
            }
        }

        let mut membership = Membership::load(&ctx.leader, family).context(MembershipSnafu)?;
        let before = membership.clone();
        let seeded = membership.seed(
            observations
                .iter()
                .map(|(unit, address)| (unit.as_str(), address.as_str())),
        );
        if !seeded {
            for (unit, address) in &observations {
                membership.observe(unit, address);
            }
            let present: BTreeSet<&str> = observations.iter().map(|(u, _)| u.as_str()).collect();
            let gone: Vec<String> = membership
                .units()
                .keys()
                .filter(|member| !present.contains(member.as_str()))
                .cloned()
                .collect();
            for member in gone {
                membership.depart(&member);
            }
        }
        if membership != before {
            tracing::info!(?family, members = ?membership.list(), "cluster membership changed");
            settings.extend(membership.to_settings(family).context(MembershipSnafu)?);
        }
    }

    if ctx.leader.get(METADATA_SHARED_SECRET).is_none() {
        tracing::info!("generating the metadata shared secret");
        settings.insert(
            METADATA_SHARED_SECRET.to_string(),
            Some(uuid::Uuid::new_v4().to_string()),
        );
    }
    let env = ctx.env.clone();
    ctx.leader.set(env.as_ref(), settings).context(SettingsSnafu)
}

/// Everything the controllers learn from their consumers
#[derive(Default)]
struct Inputs {
    controller_ips: Vec<String>,
    controller_data_ips: Vec<String>,
    analytics_servers: Vec<String>,
    analyticsdb_servers: Vec<String>,
    auth_info: Option<AuthInfo>,
    orchestrator_info: OrchestratorInfo,
    agents_info: AgentsInfo,
}

fn private_addresses(ctx: &Ctx, endpoint: &str) -> Result<Vec<String>> {
    let addresses: BTreeSet<String> = ctx
        .relation_units(endpoint)?
        .iter()
        .filter_map(|remote| remote.bag.get("private-address").map(str::to_string))
        .collect();
    Ok(addresses.into_iter().collect())
}

fn merge(into: &mut Option<String>, from: Option<String>) {
    if into.is_none() {
        *into = from;
    }
}

fn collect(ctx: &Ctx) -> Result<Inputs> {
    let mut inputs = Inputs {
        controller_ips: Membership::load(&ctx.leader, AddressFamily::Ip)
            .context(MembershipSnafu)?
            .list()
            .to_vec(),
        controller_data_ips: Membership::load(&ctx.leader, AddressFamily::DataIp)
            .context(MembershipSnafu)?
            .list()
            .to_vec(),
        analytics_servers: private_addresses(ctx, ANALYTICS)?,
        analyticsdb_servers: private_addresses(ctx, ANALYTICSDB)?,
        ..Inputs::default()
    };

    for remote in ctx.relation_units(AUTH)? {
        if let Some(auth) = remote.bag.json::<AuthInfo>("auth-info").context(SettingsSnafu)? {
            inputs.auth_info = Some(auth);
        }
    }

    for remote in ctx.relation_units(CONTROLLER)? {
        match remote.bag.get("unit-type") {
            Some("agent") => {
                inputs
                    .agents_info
                    .dpdk
                    .insert(remote.unit.clone(), remote.bag.flag("dpdk"));
            }
            Some("openstack" | "kubernetes") => {
                let Some(info) = remote
                    .bag
                    .json::<OrchestratorInfo>("orchestrator-info")
                    .context(SettingsSnafu)?
                else {
                    continue;
                };
                let merged = &mut inputs.orchestrator_info;
                merge(&mut merged.cloud_orchestrator, info.cloud_orchestrator);
                merge(&mut merged.kube_manager_token, info.kube_manager_token);
                merge(&mut merged.kubernetes_api_server, info.kubernetes_api_server);
                merge(&mut merged.kubernetes_api_port, info.kubernetes_api_port);
                merge(
                    &mut merged.kubernetes_api_secure_port,
                    info.kubernetes_api_secure_port,
                );
            }
            // ISSU peers and anything unknown do not take part in orchestration
            _ => {}
        }
    }
    Ok(inputs)
}

fn encode<T: serde::Serialize>(value: &T, what: &'static str) -> Result<Option<String>> {
    serde_json::to_string(value)
        .map(Some)
        .context(EncodeSnafu { what })
}

/// The cluster facts every downstream role consumes
fn facts(ctx: &Ctx, inputs: &Inputs) -> Result<Settings> {
    let mut settings = Settings::from([
        (
            "controller_ips".to_string(),
            encode(&inputs.controller_ips, "controller ips")?,
        ),
        (
            "controller_data_ips".to_string(),
            encode(&inputs.controller_data_ips, "controller data ips")?,
        ),
        (
            "analytics-server".to_string(),
            encode(&inputs.analytics_servers, "analytics servers")?,
        ),
        (
            "orchestrator-info".to_string(),
            encode(&inputs.orchestrator_info, "orchestrator info")?,
        ),
        (
            "agents-info".to_string(),
            encode(&inputs.agents_info, "agents info")?,
        ),
        (
            "auth-mode".to_string(),
            Some(ctx.config.string_or("auth-mode", "rbac")),
        ),
        ("api-vip".to_string(), ctx.config.string("vip")),
        ("port".to_string(), Some(CONTRAIL_API.port.to_string())),
        (
            "ssl-enabled".to_string(),
            Some(ctx.config.get_bool(common::SSL_ENABLED).to_string()),
        ),
        (
            "metadata-shared-secret".to_string(),
            ctx.leader.get(METADATA_SHARED_SECRET).map(str::to_string),
        ),
    ]);
    let auth_info = match &inputs.auth_info {
        Some(auth) => encode(auth, "auth info")?,
        None => None,
    };
    settings.insert("auth-info".to_string(), auth_info);
    Ok(settings)
}

fn publish(ctx: &mut Ctx, own: &Addresses, inputs: &Inputs) -> Result<()> {
    let peer = Settings::from([
        ("unit-address".to_string(), Some(own.ip.clone())),
        ("data-address".to_string(), Some(own.data_ip.clone())),
    ]);
    ctx.publish(CLUSTER, peer)?;

    if !inputs.controller_ips.is_empty() {
        let facts = facts(ctx, inputs)?;
        for endpoint in DOWNSTREAM {
            ctx.publish(endpoint, facts.clone())?;
        }
    }

    let vip = ctx.config.string("vip");
    if let Some(vip) = &vip {
        let mode = common::http_mode(ctx)?;
        let unit = ctx.local_unit();
        let http = haproxy::services(&[CONTRAIL_API, CONTRAIL_WEBUI_HTTP], vip, &unit, &own.ip, mode);
        let https = haproxy::services(&[CONTRAIL_WEBUI_HTTPS], vip, &unit, &own.ip, mode);
        for (endpoint, services) in [(HTTP_SERVICES, http), (HTTPS_SERVICES, https)] {
            let yaml = haproxy::services_yaml(&services).context(HaproxySnafu)?;
            ctx.publish(endpoint, Settings::from([("services".to_string(), Some(yaml))]))?;
        }
    }
    haproxy::apply_port_policy(ctx.env(), PROFILE.ports, vip.as_deref()).context(HaproxySnafu)
}

fn preconditions(ctx: &Ctx, own: &Addresses, inputs: &Inputs) -> Result<Precondition<String>> {
    if let Err(status) = common::missing_relations(ctx, &[ANALYTICS])? {
        return Ok(Err(status));
    }
    if !inputs.controller_ips.contains(&own.ip) {
        return Ok(Err(Status::waiting(
            "Waiting for the leader to add this unit to the cluster.",
        )));
    }
    if let Err(status) = common::tls_precondition(ctx)? {
        return Ok(Err(status));
    }
    let min_cluster_size = ctx.config.get_u64("min-cluster-size").unwrap_or(1);
    if (inputs.controller_ips.len() as u64) < min_cluster_size {
        return Ok(Err(Status::waiting(format!(
            "Waiting for {min_cluster_size} controllers, {} in the cluster.",
            inputs.controller_ips.len()
        ))));
    }
    if inputs.analytics_servers.is_empty() {
        return Ok(Err(Status::blocked(
            "Missing analytics servers info in relation with contrail-analytics.",
        )));
    }
    let Some(orchestrator) = inputs.orchestrator_info.cloud_orchestrator.clone() else {
        return Ok(Err(Status::blocked(
            "Missing cloud orchestrator info in relations.",
        )));
    };
    let endpoint = if orchestrator == ORCHESTRATOR_OPENSTACK {
        AUTH
    } else {
        CONTROLLER
    };
    if let Err(status) = common::orchestrator_precondition(
        &orchestrator,
        inputs.auth_info.as_ref(),
        &inputs.orchestrator_info,
        endpoint,
    ) {
        return Ok(Err(status));
    }
    Ok(Ok(orchestrator))
}

fn environment(ctx: &Ctx, inputs: &Inputs, orchestrator: &str) -> BTreeMap<String, String> {
    let controllers = common::join(&inputs.controller_ips);
    let mut env = common::base_env(ctx, MODULE);
    env.extend([
        ("CONTROLLER_NODES".to_string(), controllers.clone()),
        ("CONFIGDB_NODES".to_string(), controllers.clone()),
        ("ZOOKEEPER_NODES".to_string(), controllers.clone()),
        ("RABBITMQ_NODES".to_string(), controllers.clone()),
        ("REDIS_NODES".to_string(), controllers),
        (
            "CONTROL_NODES".to_string(),
            common::join(&inputs.controller_data_ips),
        ),
        (
            "ANALYTICS_NODES".to_string(),
            common::join(&inputs.analytics_servers),
        ),
        ("CLOUD_ORCHESTRATOR".to_string(), orchestrator.to_string()),
        (
            "AAA_MODE".to_string(),
            ctx.config.string_or("auth-mode", "rbac"),
        ),
        ("RABBITMQ_NODE_PORT".to_string(), "5673".to_string()),
    ]);
    if !inputs.analyticsdb_servers.is_empty() {
        env.insert(
            "ANALYTICSDB_NODES".to_string(),
            common::join(&inputs.analyticsdb_servers),
        );
    }
    if let Some(vip) = ctx.config.string("vip") {
        env.insert("CONFIG_API_VIP".to_string(), vip);
    }
    common::auth_env(inputs.auth_info.as_ref(), &mut env);
    env
}

fn workload(ctx: &Ctx, inputs: &Inputs, orchestrator: &str) -> Workload {
    let mut workload = Workload::new(MODULE, IMAGES.to_vec());
    workload.env = environment(ctx, inputs, orchestrator);

    let logs = "/var/log/contrail:/var/log/contrail";
    let service = |image: &str| common::service(ctx, MODULE, image).volume(logs);
    workload.compose = workload
        .compose
        .service("node-init", common::node_init(ctx, MODULE))
        .service(
            "configdb",
            service("contrail-external-cassandra")
                .env("NODE_TYPE", "config-database")
                .volume("/var/lib/contrail/config_database:/var/lib/cassandra"),
        )
        .service(
            "zookeeper",
            service("contrail-external-zookeeper")
                .env("NODE_TYPE", "config-database")
                .volume("/var/lib/contrail/config_zookeeper:/data"),
        )
        .service(
            "rabbitmq",
            service("contrail-external-rabbitmq")
                .env("NODE_TYPE", "config-database")
                .volume("/var/lib/contrail/config_rabbitmq:/var/lib/rabbitmq"),
        )
        .service("redis", service("contrail-external-redis"))
        .service(
            "config-api",
            service("contrail-controller-config-api")
                .volume("/etc/contrail/ssl:/etc/contrail/ssl:ro")
                .depends_on("configdb")
                .depends_on("zookeeper")
                .depends_on("rabbitmq"),
        )
        .service(
            "svc-monitor",
            service("contrail-controller-config-svcmonitor").depends_on("config-api"),
        )
        .service(
            "schema",
            service("contrail-controller-config-schema").depends_on("config-api"),
        )
        .service(
            "device-manager",
            service("contrail-controller-config-devicemgr").depends_on("config-api"),
        )
        .service(
            "control",
            service("contrail-controller-control-control").depends_on("node-init"),
        )
        .service(
            "named",
            service("contrail-controller-control-named")
                .privileged()
                .depends_on("control"),
        )
        .service(
            "dns",
            service("contrail-controller-control-dns").depends_on("control"),
        )
        .service(
            "webui-web",
            service("contrail-controller-webui-web")
                .volume("/etc/contrail/ssl:/etc/contrail/ssl:ro")
                .depends_on("redis"),
        )
        .service(
            "webui-job",
            service("contrail-controller-webui-job").depends_on("redis"),
        )
        .service("config-nodemgr", common::nodemgr(ctx, MODULE, "config"))
        .service("control-nodemgr", common::nodemgr(ctx, MODULE, "control"))
        .service(
            "database-nodemgr",
            common::nodemgr(ctx, MODULE, "config-database"),
        );
    workload
}

pub fn update_status(ctx: &mut Ctx) -> Result<()> {
    let own = Addresses {
        ip: ctx.unit_ip("control-network", "control")?,
        data_ip: ctx.unit_ip("data-network", "data")?,
    };
    if ctx.is_leader() {
        lead(ctx, &own)?;
    }
    let inputs = collect(ctx)?;
    publish(ctx, &own, &inputs)?;

    let orchestrator = match preconditions(ctx, &own, &inputs)? {
        Ok(orchestrator) => orchestrator,
        Err(status) => return ctx.set_status(status),
    };
    let workload = workload(ctx, &inputs, &orchestrator);
    common::deploy(ctx, workload)
}
