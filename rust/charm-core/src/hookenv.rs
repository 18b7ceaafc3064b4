//! Access to the host framework from inside a hook.
//!
//! The host exposes its state through a set of small programs (`config-get`, `relation-get`,
//! `leader-set`, ...) plus a handful of environment variables describing the current event.
//! [`HookEnvironment`] is the seam the rest of the crate programs against; [`JujuHookTools`]
//! is the production implementation.
use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    executor::{self, BoxedExecutor, Invocation},
    kv::RelationBag,
    status::Status,
};

type Result<T, E = Error> = std::result::Result<T, E>;

/// Keys to write into a relation bag or the leader settings; `None` deletes the key
pub type Settings = BTreeMap<String, Option<String>>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("environment variable {var} is not set, not running inside a hook?"))]
    MissingEnv { var: &'static str },

    #[snafu(display("hook tool {tool} failed"))]
    HookTool {
        source: executor::Error,
        tool: &'static str,
    },

    #[snafu(display("failed to parse output of {tool}"))]
    ParseOutput {
        source: serde_json::Error,
        tool: &'static str,
    },

    #[snafu(display("failed to serialize relation settings"))]
    SerializeSettings { source: serde_yaml::Error },
}

/// Everything a hook can ask of, or tell, the host framework
pub trait HookEnvironment {
    /// Name of the unit the hook runs for, e.g. `contrail-controller/0`
    fn local_unit(&self) -> String;

    /// The remote unit of the relation event being handled, if any
    fn remote_unit(&self) -> Option<String>;

    /// The relation id of the relation event being handled, if any
    fn relation_id(&self) -> Option<String>;

    /// Current values of all charm options
    fn config_get(&self) -> Result<BTreeMap<String, serde_json::Value>>;

    fn is_leader(&self) -> Result<bool>;
    fn leader_get(&self) -> Result<BTreeMap<String, String>>;
    fn leader_set(&self, settings: &Settings) -> Result<()>;

    fn relation_ids(&self, endpoint: &str) -> Result<Vec<String>>;
    fn related_units(&self, relation_id: &str) -> Result<Vec<String>>;
    fn relation_get(&self, relation_id: &str, unit: &str) -> Result<RelationBag>;
    fn relation_set(&self, relation_id: &str, settings: &Settings) -> Result<()>;

    fn status_set(&self, status: &Status) -> Result<()>;
    fn application_version_set(&self, version: &str) -> Result<()>;

    fn open_port(&self, port: u16) -> Result<()>;
    fn close_port(&self, port: u16) -> Result<()>;
    fn opened_ports(&self) -> Result<BTreeSet<u16>>;

    fn unit_private_address(&self) -> Result<String>;

    /// Primary address of the unit on a network binding, if the binding exists
    fn network_address(&self, binding: &str) -> Result<Option<String>>;
}

/// A remote unit on one of the relations of an endpoint, together with its bag
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteUnit {
    pub relation_id: String,
    pub unit: String,
    pub bag: RelationBag,
}

/// Collects the bags of all remote units on all relations of `endpoint`
pub fn relation_units(env: &dyn HookEnvironment, endpoint: &str) -> Result<Vec<RemoteUnit>> {
    let mut units = Vec::new();
    for relation_id in env.relation_ids(endpoint)? {
        for unit in env.related_units(&relation_id)? {
            let bag = env.relation_get(&relation_id, &unit)?;
            units.push(RemoteUnit {
                relation_id: relation_id.clone(),
                unit,
                bag,
            });
        }
    }
    Ok(units)
}

/// Publishes `settings` on every relation of `endpoint`, returning how many were updated
pub fn set_on_endpoint(
    env: &dyn HookEnvironment,
    endpoint: &str,
    settings: &Settings,
) -> Result<usize> {
    let relation_ids = env.relation_ids(endpoint)?;
    for relation_id in &relation_ids {
        tracing::debug!(endpoint, relation_id, keys = ?settings.keys(), "publishing relation data");
        env.relation_set(relation_id, settings)?;
    }
    Ok(relation_ids.len())
}

/// The endpoint name a relation id belongs to (`contrail-controller:12` -> `contrail-controller`)
pub fn relation_endpoint(relation_id: &str) -> &str {
    relation_id
        .split_once(':')
        .map(|(endpoint, _)| endpoint)
        .unwrap_or(relation_id)
}

/// Production [`HookEnvironment`] backed by the host framework's hook tools
pub struct JujuHookTools {
    executor: BoxedExecutor,
    unit: String,
    remote_unit: Option<String>,
    relation_id: Option<String>,
}

impl JujuHookTools {
    pub const UNIT_ENV: &'static str = "JUJU_UNIT_NAME";
    pub const REMOTE_UNIT_ENV: &'static str = "JUJU_REMOTE_UNIT";
    pub const RELATION_ID_ENV: &'static str = "JUJU_RELATION_ID";

    pub fn from_env(executor: BoxedExecutor) -> Result<Self> {
        let non_empty = |var: &str| std::env::var(var).ok().filter(|value| !value.is_empty());
        Ok(JujuHookTools {
            executor,
            unit: non_empty(Self::UNIT_ENV).context(MissingEnvSnafu {
                var: Self::UNIT_ENV,
            })?,
            remote_unit: non_empty(Self::REMOTE_UNIT_ENV),
            relation_id: non_empty(Self::RELATION_ID_ENV),
        })
    }

    fn run(&self, tool: &'static str, args: &[&str]) -> Result<String> {
        self.executor
            .execute(&Invocation::new(tool).args(args.iter().copied()))
            .context(HookToolSnafu { tool })
    }

    fn run_json<T: DeserializeOwned>(&self, tool: &'static str, args: &[&str]) -> Result<T> {
        let mut all_args = vec!["--format=json"];
        all_args.extend_from_slice(args);
        let output = self.run(tool, &all_args)?;
        let output = output.trim();
        // Some tools print nothing at all instead of `null`
        serde_json::from_str(if output.is_empty() { "null" } else { output })
            .context(ParseOutputSnafu { tool })
    }
}

fn key_value_args(settings: &Settings) -> Vec<String> {
    settings
        .iter()
        .map(|(key, value)| format!("{key}={}", value.as_deref().unwrap_or_default()))
        .collect()
}

impl HookEnvironment for JujuHookTools {
    fn local_unit(&self) -> String {
        self.unit.clone()
    }

    fn remote_unit(&self) -> Option<String> {
        self.remote_unit.clone()
    }

    fn relation_id(&self) -> Option<String> {
        self.relation_id.clone()
    }

    fn config_get(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        let options: Option<BTreeMap<String, serde_json::Value>> =
            self.run_json("config-get", &[])?;
        Ok(options
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .collect())
    }

    fn is_leader(&self) -> Result<bool> {
        self.run_json("is-leader", &[])
    }

    fn leader_get(&self) -> Result<BTreeMap<String, String>> {
        let settings: Option<BTreeMap<String, String>> = self.run_json("leader-get", &[])?;
        Ok(settings.unwrap_or_default())
    }

    fn leader_set(&self, settings: &Settings) -> Result<()> {
        if settings.is_empty() {
            return Ok(());
        }
        let args = key_value_args(settings);
        let args = args.iter().map(String::as_str).collect::<Vec<_>>();
        self.run("leader-set", &args).map(drop)
    }

    fn relation_ids(&self, endpoint: &str) -> Result<Vec<String>> {
        let ids: Option<Vec<String>> = self.run_json("relation-ids", &[endpoint])?;
        Ok(ids.unwrap_or_default())
    }

    fn related_units(&self, relation_id: &str) -> Result<Vec<String>> {
        let units: Option<Vec<String>> = self.run_json("related-units", &["-r", relation_id])?;
        Ok(units.unwrap_or_default())
    }

    fn relation_get(&self, relation_id: &str, unit: &str) -> Result<RelationBag> {
        let bag: Option<BTreeMap<String, String>> =
            self.run_json("relation-get", &["-r", relation_id, "-", unit])?;
        Ok(RelationBag::from(bag.unwrap_or_default()))
    }

    fn relation_set(&self, relation_id: &str, settings: &Settings) -> Result<()> {
        if settings.is_empty() {
            return Ok(());
        }
        // Values may be multi-line documents, so they travel as a YAML file on stdin
        let document: BTreeMap<&str, &str> = settings
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_deref().unwrap_or_default()))
            .collect();
        let document = serde_yaml::to_string(&document).context(SerializeSettingsSnafu)?;
        self.executor
            .execute(
                &Invocation::new("relation-set")
                    .args(["-r", relation_id, "--file", "-"])
                    .stdin(document),
            )
            .context(HookToolSnafu {
                tool: "relation-set",
            })
            .map(drop)
    }

    fn status_set(&self, status: &Status) -> Result<()> {
        self.run("status-set", &[&status.state.to_string(), &status.message])
            .map(drop)
    }

    fn application_version_set(&self, version: &str) -> Result<()> {
        self.run("application-version-set", &[version]).map(drop)
    }

    fn open_port(&self, port: u16) -> Result<()> {
        self.run("open-port", &[&format!("{port}/tcp")]).map(drop)
    }

    fn close_port(&self, port: u16) -> Result<()> {
        self.run("close-port", &[&format!("{port}/tcp")]).map(drop)
    }

    fn opened_ports(&self) -> Result<BTreeSet<u16>> {
        let ports: Option<Vec<String>> = self.run_json("opened-ports", &[])?;
        Ok(ports
            .unwrap_or_default()
            .iter()
            .filter_map(|port| port.split('/').next()?.parse().ok())
            .collect())
    }

    fn unit_private_address(&self) -> Result<String> {
        self.run_json("unit-get", &["private-address"])
    }

    fn network_address(&self, binding: &str) -> Result<Option<String>> {
        match self.run_json::<Option<String>>("network-get", &[binding, "--primary-address"]) {
            Ok(address) => Ok(address.filter(|address| !address.is_empty())),
            // Unknown bindings are reported as a tool failure
            Err(Error::HookTool { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_of_relation_id() {
        assert_eq!(relation_endpoint("contrail-controller:12"), "contrail-controller");
        assert_eq!(relation_endpoint("weird"), "weird");
    }

    #[test]
    fn key_value_args_unset_missing_values() {
        let settings = Settings::from([
            ("a".to_string(), Some("1".to_string())),
            ("b".to_string(), None),
        ]);
        assert_eq!(key_value_args(&settings), vec!["a=1", "b="]);
    }
}
