//! Everything a hook handler works with, loaded at hook entry and committed at exit.
use std::{
    hash::Hasher,
    path::{Path, PathBuf},
    rc::Rc,
};

use fnv::FnvHasher;
use snafu::ResultExt;

use contrail_charm_core::{
    docker::{ContainerRuntime, ImageRef, RuntimeSettings},
    executor::BoxedExecutor,
    hookenv::{self, HookEnvironment, RemoteUnit, Settings},
    kv::{LeaderSettings, UnitConfig},
    network,
    retry::RetryPolicy,
    status::Status,
    templating::{Context, Perms, Renderer},
};

use crate::{
    roles::{AddressSnafu, HostSnafu, RenderSnafu, Result, Role, SettingsSnafu},
    templates,
};

pub const DEFAULT_REGISTRY: &str = "opencontrailnightly";
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// Per-hook state of one unit
pub struct Ctx {
    pub role: Role,
    pub env: Rc<dyn HookEnvironment>,
    pub executor: BoxedExecutor,
    pub runtime: Rc<dyn ContainerRuntime>,
    pub renderer: Renderer,
    pub config: UnitConfig,
    pub leader: LeaderSettings,
    pub retry: RetryPolicy,
}

impl Ctx {
    /// Loads the unit's persisted state from `charm_dir` and overlays the current options
    pub fn load(
        role: Role,
        env: Rc<dyn HookEnvironment>,
        executor: BoxedExecutor,
        runtime: Rc<dyn ContainerRuntime>,
        renderer: Renderer,
        charm_dir: &Path,
    ) -> Result<Self> {
        let mut config =
            UnitConfig::load(charm_dir.join(UnitConfig::STATE_FILE)).context(SettingsSnafu)?;
        config.merge_options(env.config_get().context(HostSnafu)?);
        let leader = LeaderSettings::load(env.as_ref()).context(SettingsSnafu)?;
        Ok(Ctx {
            role,
            env,
            executor,
            runtime,
            renderer,
            config,
            leader,
            retry: RetryPolicy::PROVISIONING,
        })
    }

    pub fn renderer_for(root: impl Into<PathBuf>) -> Renderer {
        Renderer::new(root, templates::template_set())
    }

    pub fn env(&self) -> &dyn HookEnvironment {
        self.env.as_ref()
    }

    pub fn local_unit(&self) -> String {
        self.env.local_unit()
    }

    pub fn is_leader(&self) -> bool {
        self.leader.is_leader()
    }

    pub fn set_status(&self, status: Status) -> Result<()> {
        tracing::info!(state = %status.state, message = status.message, "setting unit status");
        self.env.status_set(&status).context(HostSnafu)
    }

    pub fn image_tag(&self) -> String {
        self.config.string_or("image-tag", DEFAULT_IMAGE_TAG)
    }

    pub fn image(&self, name: &str) -> ImageRef {
        ImageRef::new(
            &self.config.string_or("docker-registry", DEFAULT_REGISTRY),
            name,
            &self.image_tag(),
        )
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            registry: self.config.string_or("docker-registry", DEFAULT_REGISTRY),
            insecure: self.config.get_bool("docker-registry-insecure"),
            user: self.config.string("docker-user"),
            password: self.config.string("docker-password"),
            log_driver: self.config.string("docker-log-driver"),
            log_options: self.config.string("docker-log-options"),
        }
    }

    /// Address of this unit on the network named by the option `network_option`
    pub fn unit_ip(&self, network_option: &str, binding: &str) -> Result<String> {
        network::get_ip(
            &self.executor,
            self.env(),
            self.config.string(network_option).as_deref(),
            binding,
        )
        .context(AddressSnafu)
    }

    pub fn relation_units(&self, endpoint: &str) -> Result<Vec<RemoteUnit>> {
        hookenv::relation_units(self.env(), endpoint).context(HostSnafu)
    }

    pub fn has_relation(&self, endpoint: &str) -> Result<bool> {
        Ok(!self
            .env
            .relation_ids(endpoint)
            .context(HostSnafu)?
            .is_empty())
    }

    /// Publishes `settings` on every relation of `endpoint`.
    ///
    /// A fingerprint of what was last published is kept in the unit state so that unchanged
    /// settings are not written again; returns whether anything was written.
    pub fn publish(&mut self, endpoint: &str, settings: Settings) -> Result<bool> {
        let relation_ids = self.env.relation_ids(endpoint).context(HostSnafu)?;
        let key = format!("published-{endpoint}");
        let fingerprint = fingerprint(&relation_ids, &settings);
        let unchanged = self.config.string(&key).as_deref() == Some(fingerprint.as_str());
        if relation_ids.is_empty() || unchanged {
            return Ok(false);
        }
        hookenv::set_on_endpoint(self.env(), endpoint, &settings).context(HostSnafu)?;
        self.config.set(key, fingerprint);
        Ok(true)
    }

    pub fn render(
        &self,
        template: &str,
        dest: &str,
        context: &Context,
        perms: Perms,
    ) -> Result<bool> {
        self.renderer
            .render(template, dest, context, perms)
            .context(RenderSnafu)
    }

    pub fn write(&self, dest: &str, contents: &str, perms: Perms) -> Result<bool> {
        self.renderer
            .write(dest, contents, perms)
            .context(RenderSnafu)
    }

    /// Persists the unit state; called once the handler succeeded
    pub fn commit(&self) -> Result<()> {
        self.config.save().context(SettingsSnafu)
    }
}

fn fingerprint(relation_ids: &[String], settings: &Settings) -> String {
    let mut hasher = FnvHasher::default();
    for relation_id in relation_ids {
        hasher.write(relation_id.as_bytes());
        hasher.write_u8(0);
    }
    for (key, value) in settings {
        hasher.write(key.as_bytes());
        hasher.write_u8(0);
        hasher.write(value.as_deref().unwrap_or_default().as_bytes());
        hasher.write_u8(0xff);
    }
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(value: &str) -> Settings {
        Settings::from([("unit-type".to_string(), Some(value.to_string()))])
    }

    #[test]
    fn fingerprint_covers_relations_and_values() {
        let one = vec!["contrail-controller:1".to_string()];
        let two = vec![
            "contrail-controller:1".to_string(),
            "contrail-controller:7".to_string(),
        ];
        assert_eq!(
            fingerprint(&one, &settings("agent")),
            fingerprint(&one, &settings("agent"))
        );
        assert_ne!(
            fingerprint(&one, &settings("agent")),
            fingerprint(&two, &settings("agent"))
        );
        assert_ne!(
            fingerprint(&one, &settings("agent")),
            fingerprint(&one, &settings("openstack"))
        );
    }
}
