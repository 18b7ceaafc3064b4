//! Structured values exchanged through relation bags as JSON strings.
use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Accepts strings, numbers and booleans, since producers disagree on how ports are typed
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) if s.is_empty() => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Identity service credentials, published as `auth-info`
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AuthInfo {
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub cloud_orchestrator: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub keystone_protocol: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub keystone_ip: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub keystone_public_port: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub keystone_admin_port: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub keystone_api_version: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub keystone_admin_user: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub keystone_admin_password: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub keystone_admin_tenant: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub keystone_region: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub keystone_user_domain_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub keystone_project_domain_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub keystone_project_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub keystone_ssl_ca: Option<String>,
}

/// Fields a client needs to locate the identity service
pub const KEYSTONE_ENDPOINT: &[&str] = &["keystone_ip"];

/// Fields a client needs to log in as the admin tenant
pub const KEYSTONE_ADMIN: &[&str] = &["keystone_ip", "keystone_admin_user", "keystone_admin_tenant"];

impl AuthInfo {
    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "keystone_ip" => self.keystone_ip.as_deref(),
            "keystone_admin_user" => self.keystone_admin_user.as_deref(),
            "keystone_admin_tenant" => self.keystone_admin_tenant.as_deref(),
            _ => None,
        }
    }

    /// The first of `fields` the identity service left empty
    pub fn missing(&self, fields: &[&'static str]) -> Option<&'static str> {
        fields.iter().copied().find(|name| self.field(name).is_none())
    }

    pub fn auth_url(&self) -> Option<String> {
        let ip = self.keystone_ip.as_deref()?;
        let protocol = self.keystone_protocol.as_deref().unwrap_or("http");
        let port = self.keystone_public_port.as_deref().unwrap_or("5000");
        let version = match self.keystone_api_version.as_deref() {
            Some("3") => "v3",
            _ => "v2.0",
        };
        Some(format!("{protocol}://{ip}:{port}/{version}"))
    }
}

/// Orchestrator facts, published as `orchestrator-info`
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct OrchestratorInfo {
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub cloud_orchestrator: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub kube_manager_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub kubernetes_api_server: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub kubernetes_api_port: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub kubernetes_api_secure_port: Option<String>,
}

/// Per agent unit facts the controller aggregates and republishes as `agents-info`
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AgentsInfo {
    #[serde(default)]
    pub dpdk: BTreeMap<String, bool>,
}

pub const ORCHESTRATOR_OPENSTACK: &str = "openstack";
pub const ORCHESTRATOR_KUBERNETES: &str = "kubernetes";
