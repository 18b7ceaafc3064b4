//! Registers vrouters and link-local services with the Contrail API.
//!
//! Both calls go through the provisioning CLIs shipped in the Contrail images. The API server
//! treats repeated `add`s and `del`s as no-ops, and the unit additionally remembers what it
//! registered so that a changed registration is deleted before the new one is added.
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use strum::{Display, IntoStaticStr};

use crate::{
    executor::{self, BoxedExecutor, Invocation},
    kv::{self, UnitConfig},
    payloads::AuthInfo,
    retry::RetryPolicy,
};

type Result<T, E = Error> = std::result::Result<T, E>;

pub const PROVISION_VROUTER: &str = "contrail-provision-vrouter";
pub const PROVISION_LINKLOCAL: &str = "contrail-provision-linklocal";

/// Unit config key recording the current vrouter registration
pub const VROUTER_PROVISIONED: &str = "vrouter-provisioned";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to {operation} {target} in the Contrail API"))]
    Provision {
        source: executor::Error,
        operation: Operation,
        target: String,
    },

    #[snafu(display("failed to record the registration of {target}"))]
    Record { source: kv::Error, target: String },
}

#[derive(Clone, Copy, Debug, Display, Eq, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Add,
    Del,
}

/// Where the API lives and how to authenticate against it
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ApiCredentials {
    pub api_ip: String,
    pub api_port: u16,
    pub admin_user: String,
    pub admin_password: String,
    pub admin_tenant: String,
}

impl ApiCredentials {
    pub fn new(api_ip: &str, api_port: u16, auth: Option<&AuthInfo>) -> Self {
        let field = |value: Option<&String>, default: &str| {
            value.cloned().unwrap_or_else(|| default.to_string())
        };
        ApiCredentials {
            api_ip: api_ip.to_string(),
            api_port,
            admin_user: field(auth.and_then(|a| a.keystone_admin_user.as_ref()), "admin"),
            admin_password: field(auth.and_then(|a| a.keystone_admin_password.as_ref()), ""),
            admin_tenant: field(auth.and_then(|a| a.keystone_admin_tenant.as_ref()), "admin"),
        }
    }
}

/// A vrouter registration
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VrouterRegistration {
    pub hostname: String,
    pub ip: String,
}

/// A link-local service registration
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LinklocalRegistration {
    pub name: String,
    pub service_ip: String,
    pub service_port: u16,
    pub backend_ip: String,
    pub backend_port: u16,
}

pub struct Provisioner {
    executor: BoxedExecutor,
    credentials: ApiCredentials,
    retry: RetryPolicy,
}

impl Provisioner {
    pub fn new(executor: BoxedExecutor, credentials: ApiCredentials, retry: RetryPolicy) -> Self {
        Provisioner {
            executor,
            credentials,
            retry,
        }
    }

    fn api_args(&self, operation: Operation) -> Vec<String> {
        let credentials = &self.credentials;
        [
            ("--api_server_ip", credentials.api_ip.clone()),
            ("--api_server_port", credentials.api_port.to_string()),
            ("--oper", operation.to_string()),
            ("--admin_user", credentials.admin_user.clone()),
            ("--admin_password", credentials.admin_password.clone()),
            ("--admin_tenant_name", credentials.admin_tenant.clone()),
        ]
        .into_iter()
        .flat_map(|(flag, value)| [flag.to_string(), value])
        .collect()
    }

    fn call(&self, operation: Operation, target: &str, invocation: Invocation) -> Result<()> {
        tracing::info!(%operation, target, "provisioning");
        self.retry
            .with_retry(&format!("{operation} {target}"), || {
                self.executor.execute(&invocation)
            })
            .context(ProvisionSnafu { operation, target })
            .map(drop)
    }

    pub fn vrouter(&self, operation: Operation, hostname: &str, ip: &str) -> Result<()> {
        let invocation = Invocation::new(PROVISION_VROUTER)
            .args(["--host_name", hostname, "--host_ip", ip])
            .args(self.api_args(operation));
        self.call(operation, &format!("vrouter {hostname}"), invocation)
    }

    pub fn linklocal_service(
        &self,
        operation: Operation,
        registration: &LinklocalRegistration,
    ) -> Result<()> {
        let invocation = Invocation::new(PROVISION_LINKLOCAL)
            .args([
                "--linklocal_service_name".to_string(),
                registration.name.clone(),
                "--linklocal_service_ip".to_string(),
                registration.service_ip.clone(),
                "--linklocal_service_port".to_string(),
                registration.service_port.to_string(),
                "--ipfabric_service_ip".to_string(),
                registration.backend_ip.clone(),
                "--ipfabric_service_port".to_string(),
                registration.backend_port.to_string(),
            ])
            .args(self.api_args(operation));
        self.call(
            operation,
            &format!("link-local service {}", registration.name),
            invocation,
        )
    }

    /// Makes sure exactly `registration` is registered, returning whether anything was called.
    ///
    /// The registration is only recorded once the API accepted it, so a failure is retried by
    /// the next hook.
    pub fn ensure_vrouter(
        &self,
        config: &mut UnitConfig,
        registration: &VrouterRegistration,
    ) -> Result<bool> {
        let target = format!("vrouter {}", registration.hostname);
        let current: Option<VrouterRegistration> = config
            .get_json(VROUTER_PROVISIONED)
            .context(RecordSnafu { target: &target })?;
        if current.as_ref() == Some(registration) {
            return Ok(false);
        }
        if let Some(current) = current {
            self.vrouter(Operation::Del, &current.hostname, &current.ip)?;
            config.pop(VROUTER_PROVISIONED);
        }
        self.vrouter(Operation::Add, &registration.hostname, &registration.ip)?;
        config
            .set_json(VROUTER_PROVISIONED, registration)
            .context(RecordSnafu { target })?;
        Ok(true)
    }

    /// Deletes the recorded vrouter registration, if any
    pub fn remove_vrouter(&self, config: &mut UnitConfig) -> Result<bool> {
        let current: Option<VrouterRegistration> = config
            .get_json(VROUTER_PROVISIONED)
            .context(RecordSnafu { target: "vrouter" })?;
        let Some(current) = current else {
            return Ok(false);
        };
        self.vrouter(Operation::Del, &current.hostname, &current.ip)?;
        config.pop(VROUTER_PROVISIONED);
        Ok(true)
    }

    /// Link-local counterpart of [`Provisioner::ensure_vrouter`]
    pub fn ensure_linklocal(
        &self,
        config: &mut UnitConfig,
        registration: &LinklocalRegistration,
    ) -> Result<bool> {
        let key = linklocal_key(&registration.name);
        let target = format!("link-local service {}", registration.name);
        let current: Option<LinklocalRegistration> =
            config.get_json(&key).context(RecordSnafu { target: &target })?;
        if current.as_ref() == Some(registration) {
            return Ok(false);
        }
        if let Some(current) = current {
            self.linklocal_service(Operation::Del, &current)?;
            config.pop(&key);
        }
        self.linklocal_service(Operation::Add, registration)?;
        config
            .set_json(&key, registration)
            .context(RecordSnafu { target })?;
        Ok(true)
    }

    pub fn remove_linklocal(&self, config: &mut UnitConfig, name: &str) -> Result<bool> {
        let key = linklocal_key(name);
        let current: Option<LinklocalRegistration> = config
            .get_json(&key)
            .context(RecordSnafu { target: name })?;
        let Some(current) = current else {
            return Ok(false);
        };
        self.linklocal_service(Operation::Del, &current)?;
        config.pop(&key);
        Ok(true)
    }
}

pub fn linklocal_key(name: &str) -> String {
    format!("linklocal-provisioned-{name}")
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, rc::Rc};

    use super::*;
    use crate::testing::FakeExecutor;

    fn provisioner(executor: &Rc<FakeExecutor>) -> Provisioner {
        Provisioner::new(
            executor.clone(),
            ApiCredentials {
                api_ip: "10.0.0.1".to_string(),
                api_port: 8082,
                admin_user: "admin".to_string(),
                admin_password: "secret".to_string(),
                admin_tenant: "admin".to_string(),
            },
            RetryPolicy::ONCE,
        )
    }

    fn metadata() -> LinklocalRegistration {
        LinklocalRegistration {
            name: "metadata".to_string(),
            service_ip: "169.254.169.254".to_string(),
            service_port: 80,
            backend_ip: "10.0.0.7".to_string(),
            backend_port: 8775,
        }
    }

    #[test]
    fn vrouter_command_line() {
        let executor = Rc::new(FakeExecutor::new());
        provisioner(&executor)
            .vrouter(Operation::Add, "compute-1", "10.0.0.20")
            .unwrap();
        assert_eq!(
            executor.calls()[0].to_string(),
            "contrail-provision-vrouter --host_name compute-1 --host_ip 10.0.0.20 \
             --api_server_ip 10.0.0.1 --api_server_port 8082 --oper add --admin_user admin \
             --admin_password secret --admin_tenant_name admin"
        );
    }

    #[test]
    fn repeated_ensure_is_a_single_add() {
        let executor = Rc::new(FakeExecutor::new());
        let provisioner = provisioner(&executor);
        let mut config = UnitConfig::in_memory(BTreeMap::new());
        let registration = VrouterRegistration {
            hostname: "compute-1".to_string(),
            ip: "10.0.0.20".to_string(),
        };

        assert!(provisioner.ensure_vrouter(&mut config, &registration).unwrap());
        assert!(!provisioner.ensure_vrouter(&mut config, &registration).unwrap());
        assert_eq!(executor.count(&[PROVISION_VROUTER]), 1);

        assert!(provisioner.remove_vrouter(&mut config).unwrap());
        assert!(!provisioner.remove_vrouter(&mut config).unwrap());
        let calls = executor.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].args.windows(2).any(|w| w == ["--oper", "del"]));
        assert!(calls[1].args.windows(2).any(|w| w == ["--host_ip", "10.0.0.20"]));
    }

    #[test]
    fn changed_linklocal_replaces_the_old_registration() {
        let executor = Rc::new(FakeExecutor::new());
        let provisioner = provisioner(&executor);
        let mut config = UnitConfig::in_memory(BTreeMap::new());

        provisioner.ensure_linklocal(&mut config, &metadata()).unwrap();
        let moved = LinklocalRegistration {
            backend_ip: "10.0.0.8".to_string(),
            ..metadata()
        };
        provisioner.ensure_linklocal(&mut config, &moved).unwrap();

        let calls = executor.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].args.windows(2).any(|w| w == ["--oper", "del"]));
        assert!(calls[1].args.windows(2).any(|w| w == ["--ipfabric_service_ip", "10.0.0.7"]));
        assert!(calls[2].args.windows(2).any(|w| w == ["--ipfabric_service_ip", "10.0.0.8"]));
        assert_eq!(
            config.get_json::<LinklocalRegistration>(&linklocal_key("metadata")).unwrap(),
            Some(moved)
        );
    }

    #[test]
    fn failed_add_is_not_recorded() {
        let executor = Rc::new(FakeExecutor::new());
        executor.fail(&[PROVISION_LINKLOCAL], "connection refused");
        let provisioner = provisioner(&executor);
        let mut config = UnitConfig::in_memory(BTreeMap::new());

        let result = provisioner.ensure_linklocal(&mut config, &metadata());
        assert!(matches!(
            result,
            Err(Error::Provision {
                operation: Operation::Add,
                ..
            })
        ));
        assert!(config.get(&linklocal_key("metadata")).is_none());
    }
}
