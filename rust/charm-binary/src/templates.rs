//! The configuration files the charms render, as plain functions over a [`Context`].
use indoc::formatdoc;
use serde_json::json;

use snafu::ResultExt;

use contrail_charm_core::templating::{
    Context, RenderError, SerializeDocumentSnafu, SerializeJsonSnafu, TemplateSet,
};

pub const ENV_FILE: &str = "common.env";
pub const VROUTER_AGENT_CONF: &str = "contrail-vrouter-agent.conf";
pub const VROUTER_NODEMGR_CONF: &str = "contrail-vrouter-nodemgr.conf";
pub const VNC_API_LIB_INI: &str = "vnc_api_lib.ini";
pub const CONTRAIL_PLUGIN_INI: &str = "ContrailPlugin.ini";
pub const CNI_CONF: &str = "10-contrail.conf";
pub const SERVICE_ACCOUNT: &str = "contrail-manager-sa.yaml";

const HEADER: &str = "# Managed by contrail-charm, local changes will be overwritten";

pub fn template_set() -> TemplateSet {
    TemplateSet::new()
        .with(ENV_FILE, env_file)
        .with(VROUTER_AGENT_CONF, vrouter_agent_conf)
        .with(VROUTER_NODEMGR_CONF, vrouter_nodemgr_conf)
        .with(VNC_API_LIB_INI, vnc_api_lib_ini)
        .with(CONTRAIL_PLUGIN_INI, contrail_plugin_ini)
        .with(CNI_CONF, cni_conf)
        .with(SERVICE_ACCOUNT, service_account)
}

fn with_port(servers: &[String], port: u16) -> String {
    servers
        .iter()
        .map(|server| format!("{server}:{port}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `KEY=value` lines from the `env` object of the context
fn env_file(context: &Context) -> Result<String, RenderError> {
    let mut out = format!("{HEADER}\n");
    if let Some(serde_json::Value::Object(env)) = context.get("env") {
        for (key, value) in env {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => continue,
                other => other.to_string(),
            };
            out.push_str(&format!("{key}={value}\n"));
        }
    }
    Ok(out)
}

fn vrouter_agent_conf(context: &Context) -> Result<String, RenderError> {
    let controllers = context.list("controller_servers");
    let collectors = with_port(&context.list("analytics_servers"), 8086);
    let ssl = if context.flag("ssl_enabled") { "True" } else { "False" };
    let mut conf = formatdoc! {"
        {HEADER}

        [CONTROL-NODE]
        servers = {control}

        [DEFAULT]
        collectors = {collectors}
        log_file = /var/log/contrail/contrail-vrouter-agent.log
        log_level = {log_level}
        log_local = 1
        xmpp_auth_enable = {ssl}
        xmpp_dns_auth_enable = {ssl}

        [DNS]
        servers = {dns}

        [METADATA]
        metadata_proxy_secret = {secret}

        [VIRTUAL-HOST-INTERFACE]
        name = vhost0
        ip = {vhost_ip}
        physical_interface = {physical_interface}
        ",
        control = with_port(&controllers, 5269),
        dns = with_port(&controllers, 53),
        log_level = context.require("log_level")?,
        secret = context.str("metadata_secret"),
        vhost_ip = context.require("vhost_ip")?,
        physical_interface = context.require("physical_interface")?,
    };
    if let Some(gateway) = Some(context.str("vhost_gateway")).filter(|g| !g.is_empty()) {
        conf.push_str(&format!("gateway = {gateway}\n"));
    }
    if context.flag("ssl_enabled") {
        conf.push_str(&formatdoc! {"

            [SANDESH]
            sandesh_ssl_enable = True
            sandesh_keyfile = {key}
            sandesh_certfile = {cert}
            sandesh_ca_cert = {ca}
            ",
            key = context.require("ssl_key")?,
            cert = context.require("ssl_cert")?,
            ca = context.require("ssl_ca")?,
        });
    }
    Ok(conf)
}

fn vrouter_nodemgr_conf(context: &Context) -> Result<String, RenderError> {
    Ok(formatdoc! {"
        {HEADER}

        [COLLECTOR]
        server_list = {collectors}
        ",
        collectors = with_port(&context.list("analytics_servers"), 8086),
    })
}

fn vnc_api_lib_ini(context: &Context) -> Result<String, RenderError> {
    let mut ini = formatdoc! {"
        {HEADER}

        [global]
        WEB_SERVER = {api_ip}
        WEB_PORT = {api_port}
        BASE_URL = /

        [auth]
        ",
        api_ip = context.require("api_server")?,
        api_port = context.require("api_port")?,
    };
    match context.get("keystone_ip") {
        Some(_) => {
            let url = match context.str("keystone_api_version").as_str() {
                "3" => "/v3/auth/tokens",
                _ => "/v2.0/tokens",
            };
            ini.push_str(&formatdoc! {"
                AUTHN_TYPE = keystone
                AUTHN_PROTOCOL = {protocol}
                AUTHN_SERVER = {server}
                AUTHN_PORT = {port}
                AUTHN_URL = {url}
                ",
                protocol = context.require("keystone_protocol")?,
                server = context.require("keystone_ip")?,
                port = context.require("keystone_public_port")?,
            });
        }
        None => ini.push_str("AUTHN_TYPE = noauth\n"),
    }
    Ok(ini)
}

fn contrail_plugin_ini(context: &Context) -> Result<String, RenderError> {
    Ok(formatdoc! {"
        {HEADER}

        [APISERVER]
        api_server_ip = {api_ip}
        api_server_port = {api_port}
        multi_tenancy = True
        contrail_extensions = ipam:neutron_plugin_contrail.plugins.opencontrail.contrail_plugin_ipam.NeutronPluginContrailIpam,policy:neutron_plugin_contrail.plugins.opencontrail.contrail_plugin_policy.NeutronPluginContrailPolicy,route-table:neutron_plugin_contrail.plugins.opencontrail.contrail_plugin_vpc.NeutronPluginContrailVpc,contrail:None,service-interface:None,vf-binding:None

        [KEYSTONE]
        auth_url = {auth_url}
        admin_user = {user}
        admin_password = {password}
        admin_tenant_name = {tenant}
        ",
        api_ip = context.require("api_server")?,
        api_port = context.require("api_port")?,
        auth_url = context.require("auth_url")?,
        user = context.require("keystone_admin_user")?,
        password = context.str("keystone_admin_password"),
        tenant = context.require("keystone_admin_tenant")?,
    })
}

fn cni_conf(context: &Context) -> Result<String, RenderError> {
    let conf = json!({
        "cniVersion": "0.3.1",
        "contrail": {
            "vrouter-ip": context.require("vrouter_ip")?,
            "vrouter-port": 9091,
            "config-dir": "/var/lib/contrail/ports/vm",
            "poll-timeout": 5,
            "poll-retries": 15,
            "log-file": "/var/log/contrail/cni/opencontrail.log",
            "log-level": "4",
        },
        "name": "contrail-k8s-cni",
        "type": "contrail-k8s-cni",
    });
    let mut out = serde_json::to_string_pretty(&conf).context(SerializeJsonSnafu)?;
    out.push('\n');
    Ok(out)
}

fn service_account(context: &Context) -> Result<String, RenderError> {
    let namespace = context.require("namespace")?;
    let account = context.require("account")?;
    let documents = [
        json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": {"name": account, "namespace": namespace},
        }),
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "type": "kubernetes.io/service-account-token",
            "metadata": {
                "name": format!("{account}-token"),
                "namespace": namespace,
                "annotations": {"kubernetes.io/service-account.name": account},
            },
        }),
        json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": {"name": account},
            "roleRef": {
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "ClusterRole",
                "name": "cluster-admin",
            },
            "subjects": [{"kind": "ServiceAccount", "name": account, "namespace": namespace}],
        }),
    ];
    let mut out = String::new();
    for document in documents {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&document).context(SerializeDocumentSnafu)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn env_file_lists_sorted_keys() {
        let context = Context::new().with(
            "env",
            json!({"CONTROLLER_NODES": "10.0.0.1", "SSL_ENABLE": false, "SKIPPED": null}),
        );
        assert_eq!(
            env_file(&context).unwrap(),
            indoc! {"
                # Managed by contrail-charm, local changes will be overwritten
                CONTROLLER_NODES=10.0.0.1
                SSL_ENABLE=false
            "}
        );
    }

    #[test]
    fn vnc_api_lib_without_keystone_is_noauth() {
        let context = Context::new()
            .with("api_server", "10.0.0.1")
            .with("api_port", "8082");
        let ini = vnc_api_lib_ini(&context).unwrap();
        assert!(ini.contains("WEB_SERVER = 10.0.0.1\n"));
        assert!(ini.ends_with("AUTHN_TYPE = noauth\n"));

        let ini = vnc_api_lib_ini(
            &context
                .with("keystone_ip", "10.0.0.3")
                .with("keystone_protocol", "http")
                .with("keystone_public_port", "5000")
                .with("keystone_api_version", "3"),
        )
        .unwrap();
        assert!(ini.contains("AUTHN_SERVER = 10.0.0.3\n"));
        assert!(ini.contains("AUTHN_URL = /v3/auth/tokens\n"));
    }

    #[test]
    fn agent_conf_requires_its_interface() {
        let context = Context::new()
            .with("controller_servers", json!(["10.0.0.1", "10.0.0.11"]))
            .with("analytics_servers", json!(["10.0.0.2"]))
            .with("log_level", "SYS_NOTICE")
            .with("vhost_ip", "10.0.0.5");
        assert!(matches!(
            vrouter_agent_conf(&context),
            Err(RenderError::MissingKey { .. })
        ));

        let conf = vrouter_agent_conf(&context.with("physical_interface", "ens3")).unwrap();
        assert!(conf.contains("servers = 10.0.0.1:5269 10.0.0.11:5269\n"));
        assert!(conf.contains("collectors = 10.0.0.2:8086\n"));
        assert!(!conf.contains("gateway"));
    }

    #[test]
    fn cni_conf_is_json() {
        let conf = cni_conf(&Context::new().with("vrouter_ip", "127.0.0.1")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&conf).unwrap();
        assert_eq!(parsed["contrail"]["vrouter-ip"], "127.0.0.1");
        assert_eq!(parsed["type"], "contrail-k8s-cni");
    }

    #[test]
    fn service_account_manifest_has_three_documents() {
        let manifest = service_account(
            &Context::new()
                .with("namespace", "contrail")
                .with("account", "contrail-manager"),
        )
        .unwrap();
        assert_eq!(manifest.matches("---\n").count(), 3);
        assert!(manifest.contains("name: contrail-manager-token"));
        assert!(manifest.contains("kubernetes.io/service-account.name: contrail-manager"));
    }
}
