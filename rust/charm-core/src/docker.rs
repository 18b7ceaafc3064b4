//! Container runtime driver on top of the docker CLI and docker-compose.
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};

use crate::{
    compose::ComposeLogging,
    executor::{self, BoxedExecutor, Invocation},
    templating,
};

type Result<T, E = Error> = std::result::Result<T, E>;

pub const DAEMON_CONFIG: &str = "/etc/docker/daemon.json";
const DOCKER: &str = "docker";
const DOCKER_COMPOSE: &str = "docker-compose";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to install the container runtime"))]
    Install { source: executor::Error },

    #[snafu(display("failed to read {}", path.display()))]
    ReadDaemonConfig {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("{} is not a valid JSON object", path.display()))]
    ParseDaemonConfig {
        source: serde_json::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to write {}", path.display()))]
    WriteDaemonConfig {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to restart the container runtime"))]
    Restart { source: executor::Error },

    #[snafu(display("failed to log in to registry {registry}"))]
    Login {
        source: executor::Error,
        registry: String,
    },

    #[snafu(display("failed to pull image {image}"))]
    ImagePull {
        source: executor::Error,
        image: ImageRef,
    },

    #[snafu(display("docker-compose failed for {}", path.display()))]
    Compose {
        source: executor::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to run a container from {image}"))]
    Run {
        source: executor::Error,
        image: ImageRef,
    },

    #[snafu(display("failed to run {command:?} in container {container}"))]
    Exec {
        source: executor::Error,
        container: String,
        command: String,
    },

    #[snafu(display("failed to copy {from} to {to}"))]
    Copy {
        source: executor::Error,
        from: String,
        to: String,
    },

    #[snafu(display("failed to list containers"))]
    ListContainers { source: executor::Error },

    #[snafu(display("failed to remove container {container}"))]
    RemoveContainer {
        source: executor::Error,
        container: String,
    },

    #[snafu(display("failed to read version of {package} from {image}"))]
    Version {
        source: executor::Error,
        image: ImageRef,
        package: String,
    },
}

/// A fully qualified image, `<registry>/<name>:<tag>`
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ImageRef {
    pub registry: String,
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(registry: &str, name: &str, tag: &str) -> Self {
        ImageRef {
            registry: registry.trim_end_matches('/').to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Splits an image string as printed by the runtime.
    ///
    /// Everything up to the final `/` is the registry (including any repository path), and a
    /// `:` after that is the tag; a registry port is never mistaken for a tag. Digests are
    /// dropped.
    pub fn parse(image: &str) -> Self {
        let image = image.split_once('@').map_or(image, |(image, _digest)| image);
        let (registry, rest) = image.rsplit_once('/').unwrap_or(("", image));
        let (name, tag) = rest.split_once(':').unwrap_or((rest, "latest"));
        ImageRef::new(registry, name, tag)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.registry.is_empty() {
            write!(f, "{}/", self.registry)?;
        }
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// Registry access and daemon settings, taken from the charm options
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuntimeSettings {
    pub registry: String,
    pub insecure: bool,
    pub user: Option<String>,
    pub password: Option<String>,
    pub log_driver: Option<String>,
    pub log_options: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PullOutcome {
    Pulled,
    AlreadyPresent,
}

/// A one-off container run
#[derive(Clone, Debug, PartialEq)]
pub struct RunSpec {
    pub image: ImageRef,
    pub name: Option<String>,
    pub volumes: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub remove: bool,
    pub entrypoint: Option<String>,
    pub args: Vec<String>,
}

impl RunSpec {
    pub fn new(image: ImageRef) -> Self {
        RunSpec {
            image,
            name: None,
            volumes: Vec::new(),
            env: BTreeMap::new(),
            remove: true,
            entrypoint: None,
            args: Vec::new(),
        }
    }
}

/// Operations the reconcilers need from the container runtime
pub trait ContainerRuntime {
    /// Installs the runtime and brings its daemon config in line with `settings`
    fn install(&self, settings: &RuntimeSettings) -> Result<()>;
    fn login(&self, registry: &str, user: &str, password: &str) -> Result<()>;
    fn pull(&self, image: &ImageRef) -> Result<PullOutcome>;

    /// Starts the services of a compose manifest, recreating them when `recreate` is set
    fn compose_up(&self, manifest: &Path, recreate: bool) -> Result<()>;
    fn compose_down(&self, manifest: &Path) -> Result<()>;

    fn run(&self, spec: &RunSpec) -> Result<String>;
    fn exec(&self, container: &str, command: &[&str], shell: bool) -> Result<String>;

    /// Copies `src` out of `container` to `dst` on the host
    fn cp(&self, container: &str, src: &str, dst: &str) -> Result<()>;

    fn is_launched(&self, container: &str) -> bool;
    fn is_present(&self, container: &str) -> bool;

    /// Removes every container whose image name is exactly `image_name`, returning the count
    fn remove_by_image(&self, image_name: &str) -> Result<usize>;

    /// Reads `<version>-<release>` of an rpm package inside the image
    fn get_version(&self, image: &ImageRef, package: &str) -> Result<String>;
}

/// Builds the compose `logging:` block for a driver and its `key=value` options
pub fn render_logging(driver: Option<&str>, options: Option<&str>) -> Option<ComposeLogging> {
    let driver = driver.map(str::trim).filter(|driver| !driver.is_empty())?;
    let options = options
        .unwrap_or_default()
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter_map(|option| option.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect();
    Some(ComposeLogging {
        driver: driver.to_string(),
        options,
    })
}

/// Applies `settings` to an existing daemon config, returning the updated config
pub fn update_daemon_config(
    mut config: Map<String, Value>,
    settings: &RuntimeSettings,
) -> Map<String, Value> {
    if settings.insecure && !settings.registry.is_empty() {
        let registries = config
            .entry("insecure-registries")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !registries.is_array() {
            *registries = Value::Array(Vec::new());
        }
        if let Value::Array(registries) = registries {
            // the daemon only knows registry hosts, not repository paths
            let host = settings.registry.split('/').next().unwrap_or_default();
            let registry = Value::String(host.to_string());
            if !registries.contains(&registry) {
                registries.push(registry);
            }
        }
    }

    let logging = render_logging(
        settings.log_driver.as_deref(),
        settings.log_options.as_deref(),
    );
    if let Some(logging) = logging {
        config.insert("log-driver".to_string(), Value::String(logging.driver));
        if logging.options.is_empty() {
            config.remove("log-opts");
        } else {
            config.insert(
                "log-opts".to_string(),
                Value::Object(
                    logging
                        .options
                        .into_iter()
                        .map(|(key, value)| (key, Value::String(value)))
                        .collect(),
                ),
            );
        }
    }
    config
}

/// [`ContainerRuntime`] backed by the docker CLI
pub struct Docker {
    executor: BoxedExecutor,
    root: PathBuf,
}

impl Docker {
    pub fn new(executor: BoxedExecutor, root: impl Into<PathBuf>) -> Self {
        Docker {
            executor,
            root: root.into(),
        }
    }

    fn daemon_config_path(&self) -> PathBuf {
        self.root
            .join(DAEMON_CONFIG.strip_prefix('/').unwrap_or(DAEMON_CONFIG))
    }

    /// Read-modify-write of the daemon config; returns whether the file changed
    fn configure_daemon(&self, settings: &RuntimeSettings) -> Result<bool> {
        let path = self.daemon_config_path();
        let existing = match std::fs::read_to_string(&path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err).context(ReadDaemonConfigSnafu { path }),
        };
        let config: Map<String, Value> = match existing.as_deref().map(str::trim) {
            Some(contents) if !contents.is_empty() => {
                serde_json::from_str(contents).context(ParseDaemonConfigSnafu { path: &path })?
            }
            _ => Map::new(),
        };

        let updated = update_daemon_config(config.clone(), settings);
        if existing.is_some() && updated == config {
            return Ok(false);
        }
        let contents = Value::Object(updated).to_string();
        templating::write_atomically(&path, contents.as_bytes(), 0o644)
            .context(WriteDaemonConfigSnafu { path })?;
        Ok(true)
    }

    fn docker(&self, args: &[&str]) -> std::result::Result<String, executor::Error> {
        self.executor
            .execute(&Invocation::new(DOCKER).args(args.iter().copied()))
    }

    fn image_present(&self, image: &ImageRef) -> bool {
        self.docker(&["image", "inspect", &image.to_string()]).is_ok()
    }

    fn inspect(&self, container: &str, format: &str) -> Option<String> {
        self.docker(&["inspect", "--format", format, container])
            .ok()
            .map(|output| output.trim().to_string())
    }
}

impl ContainerRuntime for Docker {
    fn install(&self, settings: &RuntimeSettings) -> Result<()> {
        tracing::info!(registry = settings.registry.as_str(), "installing container runtime");
        self.executor
            .execute(
                &Invocation::new("apt-get")
                    .args(["install", "-y", "--no-install-recommends", "docker.io", DOCKER_COMPOSE])
                    .env("DEBIAN_FRONTEND", "noninteractive"),
            )
            .context(InstallSnafu)?;

        if self.configure_daemon(settings)? {
            tracing::info!("daemon config changed, restarting docker");
            self.executor
                .execute(&Invocation::new("systemctl").args(["restart", "docker"]))
                .context(RestartSnafu)?;
        }
        Ok(())
    }

    fn login(&self, registry: &str, user: &str, password: &str) -> Result<()> {
        self.executor
            .execute(
                &Invocation::new(DOCKER)
                    .args(["login", registry, "--username", user, "--password-stdin"])
                    .stdin(password),
            )
            .context(LoginSnafu { registry })
            .map(drop)
    }

    fn pull(&self, image: &ImageRef) -> Result<PullOutcome> {
        if self.image_present(image) {
            tracing::debug!(%image, "image already present");
            return Ok(PullOutcome::AlreadyPresent);
        }
        tracing::info!(%image, "pulling image");
        self.docker(&["pull", &image.to_string()])
            .context(ImagePullSnafu { image: image.clone() })?;
        Ok(PullOutcome::Pulled)
    }

    fn compose_up(&self, manifest: &Path, recreate: bool) -> Result<()> {
        let mut invocation = Invocation::new(DOCKER_COMPOSE)
            .arg("-f")
            .arg(manifest.to_string_lossy())
            .args(["up", "-d"]);
        if recreate {
            invocation = invocation.arg("--force-recreate");
        }
        tracing::info!(manifest = %manifest.display(), recreate, "starting workload");
        self.executor
            .execute(&invocation)
            .context(ComposeSnafu { path: manifest })
            .map(drop)
    }

    fn compose_down(&self, manifest: &Path) -> Result<()> {
        self.executor
            .execute(
                &Invocation::new(DOCKER_COMPOSE)
                    .arg("-f")
                    .arg(manifest.to_string_lossy())
                    .arg("down"),
            )
            .context(ComposeSnafu { path: manifest })
            .map(drop)
    }

    fn run(&self, spec: &RunSpec) -> Result<String> {
        let mut invocation = Invocation::new(DOCKER).args(["run", "--network", "host"]);
        if spec.remove {
            invocation = invocation.arg("--rm");
        }
        if let Some(name) = &spec.name {
            invocation = invocation.args(["--name", name.as_str()]);
        }
        for volume in &spec.volumes {
            invocation = invocation.args(["--volume", volume.as_str()]);
        }
        for (key, value) in &spec.env {
            invocation = invocation.args(["--env".to_string(), format!("{key}={value}")]);
        }
        if let Some(entrypoint) = &spec.entrypoint {
            invocation = invocation.args(["--entrypoint", entrypoint.as_str()]);
        }
        invocation = invocation
            .arg(spec.image.to_string())
            .args(spec.args.iter().cloned());
        self.executor.execute(&invocation).context(RunSnafu {
            image: spec.image.clone(),
        })
    }

    fn exec(&self, container: &str, command: &[&str], shell: bool) -> Result<String> {
        let joined = command.join(" ");
        let mut invocation = Invocation::new(DOCKER).args(["exec", container]);
        invocation = if shell {
            invocation.args(["bash", "-c", joined.as_str()])
        } else {
            invocation.args(command.iter().copied())
        };
        self.executor.execute(&invocation).context(ExecSnafu {
            container,
            command: joined,
        })
    }

    fn cp(&self, container: &str, src: &str, dst: &str) -> Result<()> {
        let from = format!("{container}:{src}");
        self.docker(&["cp", &from, dst])
            .context(CopySnafu { from: &from, to: dst })
            .map(drop)
    }

    fn is_launched(&self, container: &str) -> bool {
        self.inspect(container, "{{.State.Running}}").as_deref() == Some("true")
    }

    fn is_present(&self, container: &str) -> bool {
        self.inspect(container, "{{.State.Status}}").is_some()
    }

    fn remove_by_image(&self, image_name: &str) -> Result<usize> {
        let listing = self
            .docker(&["ps", "--all", "--format", "{{.ID}} {{.Image}}"])
            .context(ListContainersSnafu)?;
        let mut removed = 0;
        for line in listing.lines() {
            let Some((id, image)) = line.trim().split_once(' ') else {
                continue;
            };
            if ImageRef::parse(image.trim()).name != image_name {
                continue;
            }
            tracing::info!(container = id, image, "removing container");
            self.docker(&["rm", "--force", id])
                .context(RemoveContainerSnafu { container: id })?;
            removed += 1;
        }
        Ok(removed)
    }

    fn get_version(&self, image: &ImageRef, package: &str) -> Result<String> {
        let output = self
            .docker(&[
                "run",
                "--rm",
                "--entrypoint",
                "rpm",
                &image.to_string(),
                "-q",
                "--queryformat",
                "%{VERSION}-%{RELEASE}",
                package,
            ])
            .context(VersionSnafu {
                image: image.clone(),
                package,
            })?;
        Ok(output.trim().to_string())
    }
}
