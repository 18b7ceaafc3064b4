//! Typed docker-compose manifests.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const COMPOSE_VERSION: &str = "2.4";

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ComposeFile {
    pub version: String,
    pub services: BTreeMap<String, ComposeService>,
}

impl ComposeFile {
    pub fn new() -> Self {
        ComposeFile {
            version: COMPOSE_VERSION.to_string(),
            services: BTreeMap::new(),
        }
    }

    pub fn service(mut self, name: impl Into<String>, service: ComposeService) -> Self {
        self.services.insert(name.into(), service);
        self
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ComposeService {
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub privileged: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_file: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes_from: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<ComposeLogging>,
}

impl ComposeService {
    /// A long-running host-networked service, the shape of nearly every Contrail container
    pub fn host_network(image: impl Into<String>) -> Self {
        ComposeService {
            image: image.into(),
            network_mode: Some("host".to_string()),
            restart: Some("always".to_string()),
            ..ComposeService::default()
        }
    }

    /// A one-shot init container
    pub fn init(image: impl Into<String>) -> Self {
        ComposeService {
            image: image.into(),
            network_mode: Some("host".to_string()),
            restart: Some("on-failure".to_string()),
            ..ComposeService::default()
        }
    }

    pub fn env_file(mut self, path: impl Into<String>) -> Self {
        self.env_file.push(path.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn volume(mut self, volume: impl Into<String>) -> Self {
        self.volumes.push(volume.into());
        self
    }

    pub fn volumes<I, S>(mut self, volumes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.volumes.extend(volumes.into_iter().map(Into::into));
        self
    }

    pub fn depends_on(mut self, service: impl Into<String>) -> Self {
        self.depends_on.push(service.into());
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn pid_host(mut self) -> Self {
        self.pid = Some("host".to_string());
        self
    }

    pub fn cap_add(mut self, capability: impl Into<String>) -> Self {
        self.cap_add.push(capability.into());
        self
    }

    pub fn logging(mut self, logging: Option<ComposeLogging>) -> Self {
        self.logging = logging;
        self
    }
}

/// The `logging:` block of a compose service
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ComposeLogging {
    pub driver: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_only_set_fields() {
        let compose = ComposeFile::new().service(
            "agent",
            ComposeService::host_network("contrail-vrouter-agent")
                .env_file("/etc/contrail/common_vrouter.env")
                .volume("/dev:/dev")
                .privileged()
                .depends_on("node-init"),
        );
        let yaml = compose.to_yaml().unwrap();
        assert!(yaml.contains("network_mode: host\n"));
        assert!(yaml.contains("privileged: true\n"));
        assert!(yaml.contains("- /etc/contrail/common_vrouter.env\n"));
        assert!(!yaml.contains("pid"));
        assert!(!yaml.contains("logging"));
        assert!(!yaml.contains("environment"));

        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed["version"].as_str(), Some(COMPOSE_VERSION));
        assert_eq!(
            parsed["services"]["agent"]["depends_on"][0].as_str(),
            Some("node-init")
        );
    }
}
