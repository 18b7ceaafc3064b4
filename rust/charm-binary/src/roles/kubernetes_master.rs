//! The kube-manager bridging a Kubernetes cluster into Contrail.
use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use const_format::concatcp;
use contrail_charm_core::{
    executor::Invocation,
    hookenv::Settings,
    hooks::{Hooks, RelationEvent},
    payloads::{OrchestratorInfo, ORCHESTRATOR_KUBERNETES},
    status::Status,
    templating::{Context, Perms},
    CONFIGS_DIR,
};
use snafu::ResultExt;

use super::{
    common::{self, ControllerFacts, Precondition, Workload},
    DecodeTokenSnafu, EncodeSnafu, Error, KubectlSnafu, Result, RoleProfile, SettingsSnafu,
};
use crate::{context::Ctx, templates};

pub const MODULE: &str = "kubernetes_manager";

const CLUSTER: &str = "kubernetes-master-cluster";
const CONTROLLER: &str = "contrail-controller";
const KUBE_API: &str = "kube-api-endpoint";
const KUBERNETES_CONFIG: &str = "contrail-kubernetes-config";

const KUBECONFIG: &str = "/root/.kube/config";
const SERVICE_ACCOUNT_MANIFEST: &str = concatcp!(CONFIGS_DIR, "/", MODULE, "/contrail-manager-sa.yaml");
const SERVICE_ACCOUNT_NAMESPACE: &str = "contrail";
const SERVICE_ACCOUNT: &str = "contrail-manager";

/// Leader settings key of the decoded service account token
pub const KUBE_MANAGER_TOKEN: &str = "kube_manager_token";

const IMAGES: &[&str] = &["contrail-kubernetes-kube-manager"];

pub const PROFILE: RoleProfile = RoleProfile {
    module: Some(MODULE),
    images: IMAGES,
    services: &[("kubernetes", &["kube-manager"])],
    ports: &[],
    version: Some(("contrail-kubernetes-kube-manager", "python-contrail")),
    immutable_options: &["nested_mode"],
};

pub fn hooks(hooks: Hooks<Ctx, Error>) -> Hooks<Ctx, Error> {
    let mut hooks = common::workload_hooks(hooks);
    for endpoint in [CONTROLLER, KUBE_API, KUBERNETES_CONFIG, CLUSTER] {
        hooks = hooks
            .on_relation(endpoint, RelationEvent::DATA, common::reconcile)
            .on_relation(endpoint, RelationEvent::GONE, common::reconcile);
    }
    hooks
}

#[derive(Clone, Debug, Default, PartialEq)]
struct KubeApi {
    server: String,
    port: String,
}

/// The first API endpoint announced on `kube-api-endpoint`
fn kube_api(ctx: &Ctx) -> Result<Option<KubeApi>> {
    Ok(ctx.relation_units(KUBE_API)?.iter().find_map(|remote| {
        Some(KubeApi {
            server: remote.bag.get("hostname")?.to_string(),
            port: remote.bag.get("port")?.to_string(),
        })
    }))
}

fn kubectl<'a>(args: impl IntoIterator<Item = &'a str>) -> Invocation {
    Invocation::new("kubectl")
        .args(["--kubeconfig", KUBECONFIG])
        .args(args)
}

/// Creates the service account and reads back its token
fn acquire_token(ctx: &Ctx) -> Result<String> {
    ctx.render(
        templates::SERVICE_ACCOUNT,
        SERVICE_ACCOUNT_MANIFEST,
        &Context::new()
            .with("namespace", SERVICE_ACCOUNT_NAMESPACE)
            .with("account", SERVICE_ACCOUNT),
        Perms::mode(0o644),
    )?;
    let manifest = ctx.renderer.path(SERVICE_ACCOUNT_MANIFEST);
    let manifest = manifest.to_string_lossy().into_owned();
    ctx.executor
        .execute(&kubectl(["apply", "-f", manifest.as_str()]))
        .context(KubectlSnafu)?;

    let secret = ctx
        .executor
        .execute(&kubectl([
            "get",
            "sa",
            SERVICE_ACCOUNT,
            "-n",
            SERVICE_ACCOUNT_NAMESPACE,
            "-o",
            "jsonpath={.secrets[0].name}",
        ]))
        .context(KubectlSnafu)?;
    let secret = match secret.trim() {
        "" => format!("{SERVICE_ACCOUNT}-token"),
        name => name.to_string(),
    };
    let encoded = ctx
        .executor
        .execute(&kubectl([
            "get",
            "secret",
            secret.as_str(),
            "-n",
            SERVICE_ACCOUNT_NAMESPACE,
            "-o",
            "jsonpath={.data.token}",
        ]))
        .context(KubectlSnafu)?;
    let token = STANDARD
        .decode(encoded.trim())
        .context(DecodeTokenSnafu)?;
    Ok(String::from_utf8_lossy(&token).into_owned())
}

/// Stores the token in the leader settings once the cluster API is reachable
fn ensure_token(ctx: &mut Ctx) -> Result<()> {
    if !ctx.is_leader() || ctx.leader.get(KUBE_MANAGER_TOKEN).is_some() {
        return Ok(());
    }
    match acquire_token(ctx) {
        Ok(token) => {
            tracing::info!(account = SERVICE_ACCOUNT, "acquired service account token");
            let env = ctx.env.clone();
            ctx.leader
                .set(
                    env.as_ref(),
                    Settings::from([(KUBE_MANAGER_TOKEN.to_string(), Some(token))]),
                )
                .context(SettingsSnafu)
        }
        // the cluster may not be up yet, try again on the next hook
        Err(Error::Kubectl { source }) => {
            tracing::warn!(
                error = &source as &dyn std::error::Error,
                "failed to acquire service account token"
            );
            Ok(())
        }
        Err(error) => Err(error),
    }
}

fn nested_mode(ctx: &Ctx) -> bool {
    ctx.config.get_bool("nested_mode")
}

fn orchestrator_info(ctx: &Ctx, api: Option<&KubeApi>) -> OrchestratorInfo {
    OrchestratorInfo {
        cloud_orchestrator: Some(ORCHESTRATOR_KUBERNETES.to_string()),
        kube_manager_token: ctx.leader.get(KUBE_MANAGER_TOKEN).map(str::to_string),
        kubernetes_api_server: api.map(|api| api.server.clone()),
        kubernetes_api_port: ctx.config.string("kubernetes_api_port"),
        kubernetes_api_secure_port: api.map(|api| api.port.clone()),
    }
}

fn publish(ctx: &mut Ctx, api: Option<&KubeApi>) -> Result<()> {
    let info = serde_json::to_string(&orchestrator_info(ctx, api)).context(EncodeSnafu {
        what: "orchestrator info",
    })?;
    ctx.publish(
        CONTROLLER,
        Settings::from([
            ("orchestrator-info".to_string(), Some(info)),
            ("unit-type".to_string(), Some(ORCHESTRATOR_KUBERNETES.to_string())),
        ]),
    )?;

    let nested = nested_mode(ctx);
    ctx.publish(
        KUBERNETES_CONFIG,
        Settings::from([
            (
                "pod_subnets".to_string(),
                Some(ctx.config.string_or("cluster_subnets", "10.32.0.0/12")),
            ),
            ("nested_mode".to_string(), Some(nested.to_string())),
            (
                "nested_mode_config".to_string(),
                ctx.config.string("nested_mode_config").filter(|_| nested),
            ),
        ]),
    )?;
    Ok(())
}

struct Inputs {
    facts: ControllerFacts,
    api: KubeApi,
    token: String,
}

fn inputs(ctx: &Ctx, api: Option<KubeApi>) -> Result<Precondition<Inputs>> {
    if let Err(status) = common::missing_relations(ctx, &[CONTROLLER, KUBE_API])? {
        return Ok(Err(status));
    }
    let facts = ControllerFacts::collect(ctx, CONTROLLER)?;
    if facts.controller_ips.is_empty() {
        return Ok(Err(Status::blocked(
            "Missing controller servers info in relation with contrail-controller.",
        )));
    }
    if facts.analytics_servers.is_empty() {
        return Ok(Err(Status::blocked(
            "Missing analytics_servers info in relation with contrail-controller.",
        )));
    }
    let Some(api) = api else {
        return Ok(Err(Status::waiting(
            "Waiting for API endpoint in relation with kube-api-endpoint.",
        )));
    };
    let Some(token) = ctx.leader.get(KUBE_MANAGER_TOKEN).map(str::to_string) else {
        return Ok(Err(Status::waiting(
            "Waiting for the service account token.",
        )));
    };
    if let Err(status) = common::tls_precondition(ctx)? {
        return Ok(Err(status));
    }
    Ok(Ok(Inputs { facts, api, token }))
}

fn environment(ctx: &Ctx, inputs: &Inputs) -> BTreeMap<String, String> {
    let facts = &inputs.facts;
    let mut env = common::base_env(ctx, MODULE);
    env.extend([
        ("CONTROLLER_NODES".to_string(), common::join(&facts.controller_ips)),
        ("ANALYTICS_NODES".to_string(), common::join(&facts.analytics_servers)),
        (
            "CLOUD_ORCHESTRATOR".to_string(),
            ORCHESTRATOR_KUBERNETES.to_string(),
        ),
        ("KUBERNETES_API_SERVER".to_string(), inputs.api.server.clone()),
        ("KUBERNETES_API_SECURE_PORT".to_string(), inputs.api.port.clone()),
        ("K8S_TOKEN".to_string(), inputs.token.clone()),
        (
            "KUBERNETES_CLUSTER_NAME".to_string(),
            ctx.config.string_or("cluster_name", "k8s"),
        ),
        (
            "KUBERNETES_POD_SUBNETS".to_string(),
            ctx.config.string_or("cluster_subnets", "10.32.0.0/12"),
        ),
        (
            "KUBERNETES_IP_FABRIC_SUBNETS".to_string(),
            ctx.config.string_or("ip_fabric_subnets", "10.64.0.0/12"),
        ),
        (
            "KUBERNETES_SERVICE_SUBNETS".to_string(),
            ctx.config.string_or("service_subnets", "10.96.0.0/12"),
        ),
        (
            "KUBERNETES_IP_FABRIC_FORWARDING".to_string(),
            ctx.config.get_bool("ip_fabric_forwarding").to_string(),
        ),
        (
            "KUBERNETES_IP_FABRIC_SNAT".to_string(),
            ctx.config.get_bool("ip_fabric_snat").to_string(),
        ),
    ]);
    if nested_mode(ctx) {
        env.insert("KUBE_MANAGER__NESTED_MODE".to_string(), "1".to_string());
    }
    if let Some(mode) = &facts.auth_mode {
        env.insert("AAA_MODE".to_string(), mode.clone());
    }
    common::auth_env(facts.auth_info.as_ref(), &mut env);
    env
}

fn workload(ctx: &Ctx, inputs: &Inputs) -> Workload {
    let mut workload = Workload::new(MODULE, IMAGES.to_vec());
    workload.env = environment(ctx, inputs);
    workload.compose = workload.compose.service(
        "kube-manager",
        common::service(ctx, MODULE, "contrail-kubernetes-kube-manager").volumes([
            "/var/log/contrail:/var/log/contrail",
            "/etc/contrail/ssl:/etc/contrail/ssl:ro",
        ]),
    );
    workload
}

pub fn update_status(ctx: &mut Ctx) -> Result<()> {
    let api = kube_api(ctx)?;
    if api.is_some() {
        ensure_token(ctx)?;
    }
    publish(ctx, api.as_ref())?;
    let inputs = match inputs(ctx, api)? {
        Ok(inputs) => inputs,
        Err(status) => return ctx.set_status(status),
    };
    let workload = workload(ctx, &inputs);
    common::deploy(ctx, workload)
}
