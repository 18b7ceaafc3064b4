//! Typed access to the three key-value scopes a hook sees: the unit's own config, the
//! replicated leader settings, and the per-unit relation bags.
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use snafu::{ResultExt, Snafu};

use crate::{
    hookenv::{self, HookEnvironment, Settings},
    templating,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to read unit state from {}", path.display()))]
    ReadState {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("unit state in {} is corrupt", path.display()))]
    ParseState {
        source: serde_json::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to serialize unit state"))]
    SerializeState { source: serde_json::Error },

    #[snafu(display("failed to write unit state to {}", path.display()))]
    WriteState {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("unit is not the leader, refusing to write leader settings {keys:?}"))]
    NotLeader { keys: Vec<String> },

    #[snafu(display("failed to access leader settings"))]
    LeaderAccess { source: hookenv::Error },

    #[snafu(display("value of {key:?} is not valid JSON for the expected type"))]
    DecodeJson {
        source: serde_json::Error,
        key: String,
    },

    #[snafu(display("value of {key:?} is not valid YAML for the expected type"))]
    DecodeYaml {
        source: serde_yaml::Error,
        key: String,
    },

    #[snafu(display("failed to encode value of {key:?}"))]
    EncodeJson {
        source: serde_json::Error,
        key: String,
    },
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn value_as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        Value::Number(n) => n.as_u64().is_some_and(|n| n != 0),
        _ => false,
    }
}

/// Decodes a structured value that may have been stored either natively or as a JSON string
fn decode_value<T: DeserializeOwned>(key: &str, value: &Value) -> Result<Option<T>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => serde_json::from_str(s)
            .map(Some)
            .context(DecodeJsonSnafu { key }),
        other => T::deserialize(other)
            .map(Some)
            .context(DecodeJsonSnafu { key }),
    }
}

/// The unit's own persisted key-value store.
///
/// Loaded once when a hook starts; `changed` and `previous` compare against that snapshot,
/// and [`UnitConfig::save`] commits the current values.
#[derive(Clone, Debug, Default)]
pub struct UnitConfig {
    path: Option<PathBuf>,
    entry: BTreeMap<String, Value>,
    current: BTreeMap<String, Value>,
}

impl UnitConfig {
    pub const STATE_FILE: &'static str = ".contrail-charm-state.json";

    /// Loads the state persisted at `path`; a missing file is an empty store
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entry: BTreeMap<String, Value> = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                serde_json::from_str(&contents).context(ParseStateSnafu { path: &path })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err).context(ReadStateSnafu { path: &path }),
        };
        Ok(UnitConfig {
            path: Some(path),
            current: entry.clone(),
            entry,
        })
    }

    /// A store that is never persisted
    pub fn in_memory(values: BTreeMap<String, Value>) -> Self {
        UnitConfig {
            path: None,
            current: values.clone(),
            entry: values,
        }
    }

    const OPTION_KEYS: &'static str = "charm-option-keys";

    /// Overlays the host's current charm options onto the store.
    ///
    /// Options merged by an earlier hook but no longer reported by the host are dropped so that
    /// defaults apply again.
    pub fn merge_options(&mut self, options: BTreeMap<String, Value>) {
        let known: Vec<String> = self
            .current
            .get(Self::OPTION_KEYS)
            .and_then(|keys| Vec::<String>::deserialize(keys).ok())
            .unwrap_or_default();
        for key in known {
            if !options.contains_key(&key) {
                self.current.remove(&key);
            }
        }
        self.current.insert(
            Self::OPTION_KEYS.to_string(),
            Value::from(options.keys().cloned().collect::<Vec<_>>()),
        );
        self.current.extend(options);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.current.get(key).filter(|value| !value.is_null())
    }

    /// The value as a non-empty string; scalars are stringified
    pub fn string(&self, key: &str) -> Option<String> {
        self.current.get(key).and_then(value_as_string)
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.current.get(key).is_some_and(value_as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.current.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.current.get(key) {
            Some(value) => decode_value(key, value),
            None => Ok(None),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.current.insert(key.into(), value.into());
    }

    pub fn set_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).context(EncodeJsonSnafu { key })?;
        self.current.insert(key.to_string(), value);
        Ok(())
    }

    pub fn pop(&mut self, key: &str) -> Option<Value> {
        self.current.remove(key)
    }

    /// Whether the value differs from the one seen when the hook started
    pub fn changed(&self, key: &str) -> bool {
        self.entry.get(key) != self.current.get(key)
    }

    pub fn previous(&self, key: &str) -> Option<&Value> {
        self.entry.get(key)
    }

    /// Commits the current values; stores without a backing file are left as they are
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents = serde_json::to_string_pretty(&self.current).context(SerializeStateSnafu)?;
        templating::write_atomically(path, contents.as_bytes(), 0o600)
            .context(WriteStateSnafu { path })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Settings replicated to all units of an application, writable only by its leader
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LeaderSettings {
    is_leader: bool,
    values: BTreeMap<String, String>,
}

impl LeaderSettings {
    pub fn load(env: &dyn HookEnvironment) -> Result<Self> {
        Ok(LeaderSettings {
            is_leader: env.is_leader().context(LeaderAccessSnafu)?,
            values: env.leader_get().context(LeaderAccessSnafu)?,
        })
    }

    pub fn new(is_leader: bool, values: BTreeMap<String, String>) -> Self {
        LeaderSettings { is_leader, values }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(value) => serde_json::from_str(value)
                .map(Some)
                .context(DecodeJsonSnafu { key }),
            None => Ok(None),
        }
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Writes `settings` through the host; fails without touching anything on non-leaders
    pub fn set(&mut self, env: &dyn HookEnvironment, settings: Settings) -> Result<()> {
        if !self.is_leader {
            return NotLeaderSnafu {
                keys: settings.keys().cloned().collect::<Vec<_>>(),
            }
            .fail();
        }
        let settings: Settings = settings
            .into_iter()
            .filter(|(key, value)| self.values.get(key) != value.as_ref())
            .collect();
        if settings.is_empty() {
            return Ok(());
        }
        env.leader_set(&settings).context(LeaderAccessSnafu)?;
        for (key, value) in settings {
            match value.filter(|value| !value.is_empty()) {
                Some(value) => self.values.insert(key, value),
                None => self.values.remove(&key),
            };
        }
        Ok(())
    }
}

/// The string-keyed data one remote unit published on one relation
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RelationBag(BTreeMap<String, String>);

impl From<BTreeMap<String, String>> for RelationBag {
    fn from(values: BTreeMap<String, String>) -> Self {
        RelationBag(values)
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for RelationBag {
    fn from(values: [(K, V); N]) -> Self {
        RelationBag(
            values
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

impl RelationBag {
    /// The value of `key`, treating empty strings as absent
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(value) => serde_json::from_str(value)
                .map(Some)
                .context(DecodeJsonSnafu { key }),
            None => Ok(None),
        }
    }

    pub fn yaml<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(value) => serde_yaml::from_str(value)
                .map(Some)
                .context(DecodeYamlSnafu { key }),
            None => Ok(None),
        }
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key)
            .is_some_and(|value| matches!(value.to_ascii_lowercase().as_str(), "true" | "yes"))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Applies relation settings the way the host does: empty or missing values delete
    pub fn apply(&mut self, settings: &Settings) {
        for (key, value) in settings {
            match value.as_deref().filter(|value| !value.is_empty()) {
                Some(value) => self.0.insert(key.clone(), value.to_string()),
                None => self.0.remove(key),
            };
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::FakeHost;

    #[test]
    fn changed_compares_against_entry_snapshot() {
        let mut config = UnitConfig::in_memory(BTreeMap::from([
            ("image-tag".to_string(), json!("5.1")),
            ("dpdk".to_string(), json!(false)),
        ]));
        assert!(!config.changed("image-tag"));

        config.set("image-tag", "5.2");
        assert!(config.changed("image-tag"));
        assert_eq!(config.previous("image-tag"), Some(&json!("5.1")));

        config.set("image-tag", "5.1");
        assert!(!config.changed("image-tag"));

        assert!(!config.changed("never-set"));
        config.set("never-set", "x");
        assert!(config.changed("never-set"));
        config.pop("never-set");
        assert!(!config.changed("never-set"));
    }

    #[test]
    fn merged_options_show_up_as_changes() {
        let mut config = UnitConfig::in_memory(BTreeMap::from([
            ("vrouter-provisioned".to_string(), json!(true)),
        ]));
        config.merge_options(BTreeMap::from([
            ("log-level".to_string(), json!("SYS_NOTICE")),
            ("docker-user".to_string(), json!("admin")),
        ]));
        assert!(config.changed("docker-user"));

        config.merge_options(BTreeMap::from([(
            "log-level".to_string(),
            json!("SYS_DEBUG"),
        )]));
        assert!(config.changed("log-level"));
        assert_eq!(config.string("docker-user"), None);
        assert!(config.get_bool("vrouter-provisioned"));
    }

    #[test]
    fn typed_accessors() {
        let config = UnitConfig::in_memory(BTreeMap::from([
            ("empty".to_string(), json!("")),
            ("port".to_string(), json!(8082)),
            ("port-str".to_string(), json!("8443")),
            ("flag".to_string(), json!("True")),
            ("list".to_string(), json!("[\"a\", \"b\"]")),
            ("native-list".to_string(), json!(["c"])),
        ]));
        assert_eq!(config.string("empty"), None);
        assert_eq!(config.string("port").as_deref(), Some("8082"));
        assert_eq!(config.get_u64("port-str"), Some(8443));
        assert!(config.get_bool("flag"));
        assert!(!config.get_bool("missing"));
        assert_eq!(
            config.get_json::<Vec<String>>("list").unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(
            config.get_json::<Vec<String>>("native-list").unwrap(),
            Some(vec!["c".to_string()])
        );
        assert!(config.get_json::<Vec<String>>("port").is_err());
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(UnitConfig::STATE_FILE);

        let mut config = UnitConfig::load(&path).unwrap();
        assert!(config.get("vrouter-provisioned").is_none());
        config.set("vrouter-provisioned", true);
        config.save().unwrap();
        // the snapshot stays at hook entry until the next load
        assert!(config.changed("vrouter-provisioned"));

        let reloaded = UnitConfig::load(&path).unwrap();
        assert!(reloaded.get_bool("vrouter-provisioned"));
        assert!(!reloaded.changed("vrouter-provisioned"));
    }

    #[test]
    fn corrupt_state_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(UnitConfig::STATE_FILE);
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            UnitConfig::load(&path),
            Err(Error::ParseState { .. })
        ));
    }

    #[test]
    fn non_leader_writes_fail_and_change_nothing() {
        let host = FakeHost::new("contrail-controller/1");
        host.set_leader_settings([("metadata_shared_secret", "s3cret")]);
        let mut leader = LeaderSettings::load(&host).unwrap();
        assert!(!leader.is_leader());

        let result = leader.set(
            &host,
            Settings::from([("metadata_shared_secret".to_string(), Some("other".to_string()))]),
        );
        assert!(matches!(result, Err(Error::NotLeader { .. })));
        assert_eq!(leader.get("metadata_shared_secret"), Some("s3cret"));
        assert_eq!(
            host.leader_settings().get("metadata_shared_secret").map(String::as_str),
            Some("s3cret")
        );
    }

    #[test]
    fn leader_writes_reach_the_host() {
        let host = FakeHost::new("contrail-controller/0");
        host.set_leader(true);
        host.set_leader_settings([("stale", "x")]);
        let mut leader = LeaderSettings::load(&host).unwrap();
        leader
            .set(
                &host,
                Settings::from([
                    ("kube_manager_token".to_string(), Some("token".to_string())),
                    ("stale".to_string(), None),
                ]),
            )
            .unwrap();
        assert_eq!(leader.get("kube_manager_token"), Some("token"));
        assert_eq!(leader.get("stale"), None);
        let stored = host.leader_settings();
        assert_eq!(stored.get("kube_manager_token").map(String::as_str), Some("token"));
        assert!(!stored.contains_key("stale"));
    }

    #[test]
    fn relation_bag_accessors() {
        let mut bag = RelationBag::from([
            ("analytics-server", "[\"10.0.0.2\"]"),
            ("services", "- service_name: contrail-api\n"),
            ("ssl-enabled", "True"),
            ("empty", ""),
        ]);
        assert_eq!(bag.get("empty"), None);
        assert_eq!(
            bag.json::<Vec<String>>("analytics-server").unwrap(),
            Some(vec!["10.0.0.2".to_string()])
        );
        let services: Vec<BTreeMap<String, String>> = bag.yaml("services").unwrap().unwrap();
        assert_eq!(services[0]["service_name"], "contrail-api");
        assert!(bag.flag("ssl-enabled"));

        bag.apply(&Settings::from([
            ("ssl-enabled".to_string(), Some(String::new())),
            ("port".to_string(), Some("8082".to_string())),
        ]));
        assert!(!bag.flag("ssl-enabled"));
        assert_eq!(bag.get("port"), Some("8082"));
    }
}
