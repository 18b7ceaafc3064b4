//! Handlers and reconcile steps shared by all roles.
use std::collections::BTreeMap;

use serde_json::json;
use snafu::ResultExt;

use contrail_charm_core::{
    compose::{ComposeFile, ComposeService},
    docker::{self, render_logging},
    executor::Invocation,
    haproxy::HttpMode,
    hooks::{
        Hooks, RelationEvent, CONFIG_CHANGED, INSTALL, LEADER_ELECTED, LEADER_SETTINGS_CHANGED,
        STOP, UPDATE_STATUS, UPGRADE_CHARM,
    },
    nrpe,
    payloads::{AuthInfo, OrchestratorInfo, ORCHESTRATOR_KUBERNETES, ORCHESTRATOR_OPENSTACK},
    status::{self, Status},
    templating::{Context, Perms},
    tls::{self, CertificateBundle, CertificateRequest},
    CONFIGS_DIR,
};

use super::{
    Error, HostSnafu, NrpeSnafu, RestartServiceSnafu, Result, RuntimeSnafu,
    SerializeComposeSnafu, SettingsSnafu, TlsSnafu,
};
use crate::{context::Ctx, templates};

/// A precondition outcome: the value needed to go on, or the status explaining what is missing
pub type Precondition<T> = std::result::Result<T, Status>;

pub const TLS_CERTIFICATES: &str = "tls-certificates";
pub const NRPE_EXTERNAL_MASTER: &str = "nrpe-external-master";

pub const SSL_ENABLED: &str = "ssl_enabled";
pub const TLS_PRESENT: &str = "tls_present";
const FORCE_RESTART: &str = "force-restart";
const PENDING_RESTART: &str = "pending-restart";
const APP_VERSION_IMAGE: &str = "app-version-image";

pub const LOG_DRIVERS: &[&str] = &[
    "json-file",
    "local",
    "journald",
    "syslog",
    "fluentd",
    "gelf",
    "awslogs",
    "splunk",
    "gcplogs",
    "logentries",
    "none",
];

const ENUMERATED_OPTIONS: &[(&str, &[&str])] = &[
    ("auth-mode", &["rbac", "cloud-admin", "no-auth"]),
    ("haproxy-http-mode", &["http", "https"]),
    ("docker-log-driver", LOG_DRIVERS),
];

const RUNTIME_OPTIONS: &[&str] = &[
    "docker-registry",
    "docker-registry-insecure",
    "docker-user",
    "docker-password",
    "docker-log-driver",
    "docker-log-options",
];

pub fn lifecycle_hooks() -> Hooks<Ctx, Error> {
    Hooks::new()
        .on(&[INSTALL], install)
        .on(&[CONFIG_CHANGED], config_changed)
        .on(
            &[UPGRADE_CHARM, UPDATE_STATUS, LEADER_ELECTED, LEADER_SETTINGS_CHANGED],
            reconcile,
        )
}

/// Certificate and monitoring handlers, for roles running a workload module
pub fn workload_hooks(hooks: Hooks<Ctx, Error>) -> Hooks<Ctx, Error> {
    hooks
        .on_relation(TLS_CERTIFICATES, &[RelationEvent::Joined], tls_joined)
        .on_relation(TLS_CERTIFICATES, &[RelationEvent::Changed], tls_changed)
        .on_relation(TLS_CERTIFICATES, RelationEvent::GONE, tls_gone)
        .on_relation(NRPE_EXTERNAL_MASTER, RelationEvent::DATA, nrpe_changed)
        .on(&[STOP], stop_workload)
}

/// Takes the module's containers down when the unit is removed
fn stop_workload(ctx: &mut Ctx) -> Result<()> {
    let Some(module) = ctx.role.profile().module else {
        return Ok(());
    };
    let manifest = compose_path(module);
    if !ctx.renderer.exists(&manifest) {
        return Ok(());
    }
    tracing::info!(module, "stopping containers");
    ctx.runtime
        .compose_down(&ctx.renderer.path(&manifest))
        .context(RuntimeSnafu)
}

pub fn reconcile(ctx: &mut Ctx) -> Result<()> {
    super::reconcile(ctx)
}

fn install(ctx: &mut Ctx) -> Result<()> {
    if ctx.role.profile().uses_runtime() {
        ctx.set_status(Status::maintenance("Installing container runtime"))?;
        ensure_runtime(ctx)?;
    }
    reconcile(ctx)
}

fn config_changed(ctx: &mut Ctx) -> Result<()> {
    validate_options(ctx)?;
    let runtime_changed = RUNTIME_OPTIONS.iter().any(|option| ctx.config.changed(option));
    if ctx.role.profile().uses_runtime() && runtime_changed {
        ensure_runtime(ctx)?;
    }
    reconcile(ctx)
}

/// Rejects enumerated options outside their allowed values and changes to immutable ones
pub fn validate_options(ctx: &Ctx) -> Result<()> {
    for option in ctx.role.profile().immutable_options {
        if ctx.config.changed(option) && ctx.config.previous(option).is_some() {
            return Err(Error::ImmutableOption {
                option: option.to_string(),
            });
        }
    }
    for (option, allowed) in ENUMERATED_OPTIONS {
        if let Some(value) = ctx.config.string(option) {
            if !allowed.contains(&value.as_str()) {
                return Err(Error::InvalidConfig {
                    option: option.to_string(),
                    value,
                    allowed: allowed.to_vec(),
                });
            }
        }
    }
    Ok(())
}

/// The configured balancing mode for HTTP APIs behind the VIP
pub fn http_mode(ctx: &Ctx) -> Result<HttpMode> {
    const OPTION: &str = "haproxy-http-mode";
    let value = ctx.config.string_or(OPTION, "http");
    value.parse().map_err(|_| Error::InvalidConfig {
        option: OPTION.to_string(),
        value,
        allowed: vec!["http", "https"],
    })
}

/// Identity credentials received over `relation`, or why they cannot be used yet
pub fn require_auth(
    auth: Option<AuthInfo>,
    fields: &[&'static str],
    relation: &str,
) -> Precondition<AuthInfo> {
    let Some(auth) = auth else {
        return Err(Status::blocked(format!(
            "Missing auth info in relation with {relation}."
        )));
    };
    match auth.missing(fields) {
        Some(field) => Err(Status::blocked(format!(
            "Missing {field} in auth info from {relation}."
        ))),
        None => Ok(auth),
    }
}

/// Restarts a host service whose configuration changed, or whose last restart failed.
///
/// A failed restart is remembered in the unit config and reported as a status, so the next
/// hook restarts again even though the rendered file no longer changes.
pub fn restart_host_service(ctx: &mut Ctx, service: &str, changed: bool) -> Option<Status> {
    let pending_key = format!("{PENDING_RESTART}-{service}");
    let pending = ctx.config.pop(&pending_key).is_some();
    if !changed && !pending {
        return None;
    }
    tracing::info!(service, changed, pending, "restarting host service");
    let restarted = ctx
        .executor
        .execute(&Invocation::new("systemctl").args(["restart", service]))
        .context(RestartServiceSnafu { service });
    match restarted {
        Ok(_) => None,
        Err(error) => {
            tracing::error!(
                service,
                error = &error as &dyn std::error::Error,
                "failed to restart host service"
            );
            ctx.config.set(pending_key, true);
            Some(Status::blocked(format!("{service} could not be restarted")))
        }
    }
}

pub fn ensure_runtime(ctx: &Ctx) -> Result<()> {
    let settings = ctx.runtime_settings();
    ctx.runtime.install(&settings).context(RuntimeSnafu)?;
    if let (Some(user), Some(password)) = (&settings.user, &settings.password) {
        ctx.runtime
            .login(&settings.registry, user, password)
            .context(RuntimeSnafu)?;
    }
    Ok(())
}

pub fn in_maintenance(ctx: &Ctx) -> bool {
    ctx.config
        .string("maintenance")
        .is_some_and(|value| value != "false")
}

pub fn compose_path(module: &str) -> String {
    format!("{CONFIGS_DIR}/{module}/docker-compose.yaml")
}

pub fn env_path(module: &str) -> String {
    format!("{CONFIGS_DIR}/common_{module}.env")
}

/// A templated file belonging to a workload
pub struct RenderedFile {
    pub template: &'static str,
    pub dest: String,
    pub context: Context,
    pub perms: Perms,
}

/// Everything a containerised role deploys
pub struct Workload {
    pub module: &'static str,
    pub images: Vec<&'static str>,
    pub env: BTreeMap<String, String>,
    pub compose: ComposeFile,
    pub files: Vec<RenderedFile>,
}

impl Workload {
    pub fn new(module: &'static str, images: Vec<&'static str>) -> Self {
        Workload {
            module,
            images,
            env: BTreeMap::new(),
            compose: ComposeFile::new(),
            files: Vec::new(),
        }
    }
}

/// A long-running service of `module` reading the module's env file
pub fn service(ctx: &Ctx, module: &str, image: &str) -> ComposeService {
    let settings = ctx.runtime_settings();
    ComposeService::host_network(ctx.image(image).to_string())
        .env_file(env_path(module))
        .logging(render_logging(
            settings.log_driver.as_deref(),
            settings.log_options.as_deref(),
        ))
}

/// The node-init container every module starts with
pub fn node_init(ctx: &Ctx, module: &str) -> ComposeService {
    let settings = ctx.runtime_settings();
    ComposeService::init(ctx.image("contrail-node-init").to_string())
        .env_file(env_path(module))
        .privileged()
        .pid_host()
        .volumes(["/usr/bin:/host/usr/bin", "/var/log/contrail:/var/log/contrail"])
        .logging(render_logging(
            settings.log_driver.as_deref(),
            settings.log_options.as_deref(),
        ))
}

/// The node manager of `module`, reporting into the analytics collectors
pub fn nodemgr(ctx: &Ctx, module: &str, node_type: &str) -> ComposeService {
    service(ctx, module, "contrail-nodemgr")
        .env("NODE_TYPE", node_type)
        .volumes([
            "/var/run/docker.sock:/var/run/docker.sock",
            "/var/log/contrail:/var/log/contrail",
        ])
        .depends_on("node-init")
}

/// Environment shared by every module
pub fn base_env(ctx: &Ctx, module: &str) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        (
            "LOG_LEVEL".to_string(),
            ctx.config.string_or("log-level", "SYS_NOTICE"),
        ),
        ("CONTRAIL_VERSION".to_string(), ctx.image_tag()),
    ]);
    if ctx.config.get_bool(SSL_ENABLED) {
        env.extend([
            ("SSL_ENABLE".to_string(), "true".to_string()),
            ("SERVER_CERTFILE".to_string(), tls::cert_path(module)),
            ("SERVER_KEYFILE".to_string(), tls::key_path(module)),
            ("SERVER_CA_CERTFILE".to_string(), tls::ca_path(module)),
        ]);
    }
    env
}

/// Keystone settings every module talking to the API needs
pub fn auth_env(auth: Option<&AuthInfo>, env: &mut BTreeMap<String, String>) {
    let Some(auth) = auth else {
        env.insert("AUTH_MODE".to_string(), "noauth".to_string());
        return;
    };
    let fields = [
        ("KEYSTONE_AUTH_HOST", &auth.keystone_ip),
        ("KEYSTONE_AUTH_PROTO", &auth.keystone_protocol),
        ("KEYSTONE_AUTH_PUBLIC_PORT", &auth.keystone_public_port),
        ("KEYSTONE_AUTH_ADMIN_PORT", &auth.keystone_admin_port),
        ("KEYSTONE_AUTH_ADMIN_USER", &auth.keystone_admin_user),
        ("KEYSTONE_AUTH_ADMIN_PASSWORD", &auth.keystone_admin_password),
        ("KEYSTONE_AUTH_ADMIN_TENANT", &auth.keystone_admin_tenant),
        ("KEYSTONE_AUTH_REGION_NAME", &auth.keystone_region),
        ("KEYSTONE_AUTH_USER_DOMAIN_NAME", &auth.keystone_user_domain_name),
        ("KEYSTONE_AUTH_PROJECT_DOMAIN_NAME", &auth.keystone_project_domain_name),
    ];
    env.insert("AUTH_MODE".to_string(), "keystone".to_string());
    for (key, value) in fields {
        if let Some(value) = value {
            env.insert(key.to_string(), value.clone());
        }
    }
    if let Some(version) = auth.keystone_api_version.as_deref() {
        env.insert(
            "KEYSTONE_AUTH_URL_VERSION".to_string(),
            if version == "3" { "/v3" } else { "/v2.0" }.to_string(),
        );
    }
}

pub fn join(values: &[String]) -> String {
    values.join(",")
}

/// Pulls every image; a failed pull becomes a blocked status naming the image
pub fn pull_images(ctx: &Ctx, images: &[&str]) -> Result<Option<Status>> {
    for name in images {
        let image = ctx.image(name);
        match ctx.runtime.pull(&image) {
            Ok(outcome) => tracing::debug!(%image, ?outcome, "image available"),
            Err(docker::Error::ImagePull { source, image }) => {
                tracing::error!(
                    %image,
                    error = &source as &dyn std::error::Error,
                    "failed to pull image"
                );
                return Ok(Some(Status::blocked(format!(
                    "Image could not be pulled: {}:{}",
                    image.name, image.tag
                ))));
            }
            Err(error) => return Err(error).context(RuntimeSnafu),
        }
    }
    Ok(None)
}

/// Pulls, renders and (re)starts a workload, then aggregates its status.
///
/// Containers are only recreated when one of the workload's files changed.
pub fn deploy(ctx: &mut Ctx, workload: Workload) -> Result<()> {
    let module = workload.module;
    if in_maintenance(ctx) {
        tracing::info!(module, "unit is in maintenance, leaving the workload alone");
        return update_workload_status(ctx);
    }
    if let Some(status) = pull_images(ctx, &workload.images)? {
        return ctx.set_status(status);
    }

    let mut changed = ctx.render(
        templates::ENV_FILE,
        &env_path(module),
        &Context::new().with("env", json!(workload.env)),
        Perms::mode(0o600),
    )?;
    for file in &workload.files {
        changed |= ctx.render(file.template, &file.dest, &file.context, file.perms)?;
    }
    let manifest = workload.compose.to_yaml().context(SerializeComposeSnafu)?;
    changed |= ctx.write(&compose_path(module), &manifest, Perms::mode(0o644))?;
    changed |= ctx.config.pop(FORCE_RESTART).is_some();

    let path = ctx.renderer.path(compose_path(module));
    match ctx.runtime.compose_up(&path, changed) {
        Ok(()) => {}
        Err(error @ docker::Error::Compose { .. }) => {
            tracing::error!(
                module,
                error = &error as &dyn std::error::Error,
                "failed to start containers"
            );
            ctx.config.set(FORCE_RESTART, true);
            return ctx.set_status(Status::blocked(format!(
                "Containers of {module} could not be started"
            )));
        }
        Err(error) => return Err(error).context(RuntimeSnafu),
    }
    update_workload_status(ctx)
}

/// Aggregates the workload status and publishes the application version once healthy
pub fn update_workload_status(ctx: &mut Ctx) -> Result<()> {
    let profile = ctx.role.profile();
    // roles without long-running services have nothing to ask the status tool about
    let Some(module) = profile.module.filter(|_| !profile.services.is_empty()) else {
        return ctx.set_status(Status::ready());
    };
    let status = status::services_status(&ctx.executor, module, profile.services);
    if status.is_active() {
        update_version(ctx)?;
    }
    ctx.set_status(status)
}

fn update_version(ctx: &mut Ctx) -> Result<()> {
    let Some((image_name, package)) = ctx.role.profile().version else {
        return Ok(());
    };
    let image = ctx.image(image_name);
    let image_id = image.to_string();
    if ctx.config.string(APP_VERSION_IMAGE).as_deref() == Some(image_id.as_str()) {
        return Ok(());
    }
    match ctx.runtime.get_version(&image, package) {
        Ok(version) => {
            ctx.env
                .application_version_set(&version)
                .context(HostSnafu)?;
            ctx.config.set(APP_VERSION_IMAGE, image_id);
        }
        Err(error) => tracing::warn!(
            %image,
            package,
            error = &error as &dyn std::error::Error,
            "failed to read application version"
        ),
    }
    Ok(())
}

/// Waits for certificates when a certificate issuer is related but nothing was issued yet
pub fn tls_precondition(ctx: &Ctx) -> Result<Precondition<()>> {
    if ctx.has_relation(TLS_CERTIFICATES)? && !ctx.config.get_bool(TLS_PRESENT) {
        return Ok(Err(Status::waiting("Waiting for TLS certificates.")));
    }
    Ok(Ok(()))
}

/// Checks what the cloud orchestrator needs before the workload can talk to it
pub fn orchestrator_precondition(
    orchestrator: &str,
    auth: Option<&AuthInfo>,
    info: &OrchestratorInfo,
    endpoint: &str,
) -> Precondition<()> {
    match orchestrator {
        ORCHESTRATOR_OPENSTACK if auth.and_then(|a| a.keystone_ip.as_deref()).is_none() => Err(
            Status::blocked(format!("Missing auth info in relation with {endpoint}.")),
        ),
        ORCHESTRATOR_KUBERNETES
            if info.kube_manager_token.is_none() || info.kubernetes_api_server.is_none() =>
        {
            Err(Status::waiting(format!(
                "Missing kubernetes info in relation with {endpoint}."
            )))
        }
        _ => Ok(()),
    }
}

/// Status naming every relation in `required` that is not established
pub fn missing_relations(ctx: &Ctx, required: &[&str]) -> Result<Precondition<()>> {
    let mut missing = Vec::new();
    for endpoint in required {
        if !ctx.has_relation(endpoint)? {
            missing.push(*endpoint);
        }
    }
    if missing.is_empty() {
        return Ok(Ok(()));
    }
    Ok(Err(Status::blocked(format!(
        "Missing or incomplete relations: {}",
        missing.join(", ")
    ))))
}

/// Fully qualified host name, falling back to the unit name
pub fn hostname(ctx: &Ctx) -> String {
    ctx.executor
        .execute(&Invocation::new("hostname").arg("-f"))
        .ok()
        .map(|output| output.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| ctx.local_unit().replace('/', "-"))
}

fn tls_joined(ctx: &mut Ctx) -> Result<()> {
    let mut addresses = vec![ctx.unit_ip("control-network", "control")?];
    addresses.push(ctx.unit_ip("data-network", "data")?);
    addresses.dedup();
    let request = CertificateRequest::new(&hostname(ctx), addresses);
    let settings = request.to_settings().context(TlsSnafu)?;
    ctx.publish(TLS_CERTIFICATES, settings)?;
    reconcile(ctx)
}

fn tls_changed(ctx: &mut Ctx) -> Result<()> {
    let Some(module) = ctx.role.profile().module else {
        return reconcile(ctx);
    };
    let unit = ctx.local_unit();
    let bundle = ctx
        .relation_units(TLS_CERTIFICATES)?
        .iter()
        .find_map(|remote| CertificateBundle::from_bag(&remote.bag, &unit));
    if let Some(bundle) = bundle {
        if tls::install(&ctx.renderer, module, &bundle).context(TlsSnafu)? {
            ctx.config.set(FORCE_RESTART, true);
        }
        ctx.config.set(SSL_ENABLED, true);
        ctx.config.set(TLS_PRESENT, true);
    }
    reconcile(ctx)
}

fn tls_gone(ctx: &mut Ctx) -> Result<()> {
    if let Some(module) = ctx.role.profile().module {
        if tls::remove(&ctx.renderer, module).context(TlsSnafu)? {
            ctx.config.set(FORCE_RESTART, true);
        }
    }
    ctx.config.set(SSL_ENABLED, false);
    ctx.config.pop(TLS_PRESENT);
    ctx.config.pop(&format!("published-{TLS_CERTIFICATES}"));
    reconcile(ctx)
}

fn nrpe_changed(ctx: &mut Ctx) -> Result<()> {
    let Some(module) = ctx.role.profile().module else {
        return Ok(());
    };
    nrpe::install_checks(&ctx.renderer, module).context(NrpeSnafu)?;
    let settings = nrpe::monitors_settings(module).context(NrpeSnafu)?;
    ctx.publish(NRPE_EXTERNAL_MASTER, settings)?;
    Ok(())
}

/// What the controllers publish to the roles consuming them
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControllerFacts {
    pub controller_ips: Vec<String>,
    pub controller_data_ips: Vec<String>,
    pub analytics_servers: Vec<String>,
    pub auth_info: Option<AuthInfo>,
    pub orchestrator_info: OrchestratorInfo,
    pub auth_mode: Option<String>,
    pub api_vip: Option<String>,
    pub api_port: Option<String>,
    pub ssl_enabled: bool,
    pub metadata_shared_secret: Option<String>,
}

impl ControllerFacts {
    /// Merges the bags of all controller units on `endpoint`.
    ///
    /// Units announcing a `unit-type` are peers of the consumer, not controllers. When no
    /// controller published `controller_ips` yet, the private addresses of the controller
    /// units stand in for them.
    pub fn collect(ctx: &Ctx, endpoint: &str) -> Result<Self> {
        let mut facts = ControllerFacts::default();
        let mut addresses = Vec::new();
        for remote in ctx.relation_units(endpoint)? {
            let bag = &remote.bag;
            if bag.get("unit-type").is_some() {
                continue;
            }
            if let Some(address) = bag.get("private-address") {
                addresses.push(address.to_string());
            }
            let json = |key: &str| bag.json::<Vec<String>>(key).context(SettingsSnafu);
            if let Some(ips) = json("controller_ips")?.filter(|ips| !ips.is_empty()) {
                facts.controller_ips = ips;
            }
            if let Some(ips) = json("controller_data_ips")?.filter(|ips| !ips.is_empty()) {
                facts.controller_data_ips = ips;
            }
            if let Some(ips) = json("analytics-server")?.filter(|ips| !ips.is_empty()) {
                facts.analytics_servers = ips;
            }
            if let Some(auth) = bag.json::<AuthInfo>("auth-info").context(SettingsSnafu)? {
                facts.auth_info = Some(auth);
            }
            if let Some(info) = bag
                .json::<OrchestratorInfo>("orchestrator-info")
                .context(SettingsSnafu)?
            {
                facts.orchestrator_info = info;
            }
            let text = |key: &str| bag.get(key).map(str::to_string);
            facts.auth_mode = text("auth-mode").or(facts.auth_mode);
            facts.api_vip = text("api-vip").or(facts.api_vip);
            facts.api_port = text("port").or(facts.api_port);
            facts.metadata_shared_secret =
                text("metadata-shared-secret").or(facts.metadata_shared_secret);
            facts.ssl_enabled |= bag.flag("ssl-enabled");
        }
        if facts.controller_ips.is_empty() {
            facts.controller_ips = addresses;
        }
        if facts.controller_data_ips.is_empty() {
            facts.controller_data_ips = facts.controller_ips.clone();
        }
        Ok(facts)
    }

    pub fn cloud_orchestrator(&self) -> Option<&str> {
        self.orchestrator_info
            .cloud_orchestrator
            .as_deref()
            .or_else(|| {
                self.auth_info
                    .as_ref()
                    .and_then(|auth| auth.cloud_orchestrator.as_deref())
            })
    }

    /// Where the config API is reached: the VIP when there is one, otherwise the first
    /// controller
    pub fn api_ip(&self) -> Option<&str> {
        self.api_vip
            .as_deref()
            .or_else(|| self.controller_ips.first().map(String::as_str))
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
            .as_deref()
            .and_then(|port| port.parse().ok())
            .unwrap_or(8082)
    }
}
