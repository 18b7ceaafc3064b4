//! Describes the API endpoints of a role to an HAProxy peer, and keeps the unit's own ports
//! in line with whether a VIP fronts them.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use strum::{Display, EnumString};

use crate::hookenv::{self, HookEnvironment};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to serialize HAProxy services"))]
    Serialize { source: serde_yaml::Error },

    #[snafu(display("failed to update opened ports"))]
    Ports { source: hookenv::Error },
}

pub const SERVER_CHECK: &str = "check inter 2000 rise 2 fall 3";

/// How HTTP APIs are balanced; `https` passes TLS through untouched
#[derive(Clone, Copy, Debug, Default, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum HttpMode {
    #[default]
    Http,
    Https,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointKind {
    /// A REST API, balanced in HTTP mode when possible
    Api,
    /// Always TCP, pinned to a backend by source address
    Tcp,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub name: &'static str,
    pub port: u16,
    pub kind: EndpointKind,
}

pub const CONTRAIL_API: Endpoint = Endpoint {
    name: "contrail-api",
    port: 8082,
    kind: EndpointKind::Api,
};
pub const CONTRAIL_ANALYTICS_API: Endpoint = Endpoint {
    name: "contrail-analytics-api",
    port: 8081,
    kind: EndpointKind::Api,
};
pub const CONTRAIL_WEBUI_HTTP: Endpoint = Endpoint {
    name: "contrail-webui-http",
    port: 8080,
    kind: EndpointKind::Tcp,
};
pub const CONTRAIL_WEBUI_HTTPS: Endpoint = Endpoint {
    name: "contrail-webui-https",
    port: 8143,
    kind: EndpointKind::Tcp,
};

/// A backend entry: name, address, port and check options
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Server(pub String, pub String, pub u16, pub String);

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HaproxyService {
    pub service_name: String,
    pub service_host: String,
    pub service_port: u16,
    pub service_options: Vec<String>,
    pub servers: Vec<Server>,
}

fn service_options(endpoint: &Endpoint, vip: &str, mode: HttpMode) -> Vec<String> {
    match (endpoint.kind, mode) {
        (EndpointKind::Api, HttpMode::Http) => vec![
            "mode http".to_string(),
            "option forwardfor".to_string(),
            "http-request set-header X-Forwarded-Port %[dst_port]".to_string(),
            "http-request add-header X-Forwarded-Proto https if { ssl_fc }".to_string(),
            "http-request add-header X-Forwarded-Proto http if !{ ssl_fc }".to_string(),
            "hash-type consistent".to_string(),
            "balance source".to_string(),
            "option httpchk GET /".to_string(),
            format!("redirect scheme https code 301 if {{ hdr(host) -i {vip} }} !{{ ssl_fc }}"),
        ],
        (EndpointKind::Api, HttpMode::Https) => vec![
            "mode tcp".to_string(),
            "option tcplog".to_string(),
            "balance roundrobin".to_string(),
        ],
        (EndpointKind::Tcp, _) => vec![
            "mode tcp".to_string(),
            "option tcplog".to_string(),
            "balance source".to_string(),
        ],
    }
}

/// Service descriptors for `endpoints`, all served by this unit at `local_ip`
pub fn services(
    endpoints: &[Endpoint],
    vip: &str,
    unit_name: &str,
    local_ip: &str,
    mode: HttpMode,
) -> Vec<HaproxyService> {
    let server_name = unit_name.replace('/', "-");
    endpoints
        .iter()
        .map(|endpoint| HaproxyService {
            service_name: endpoint.name.to_string(),
            service_host: vip.to_string(),
            service_port: endpoint.port,
            service_options: service_options(endpoint, vip, mode),
            servers: vec![Server(
                server_name.clone(),
                local_ip.to_string(),
                endpoint.port,
                SERVER_CHECK.to_string(),
            )],
        })
        .collect()
}

pub fn services_yaml(services: &[HaproxyService]) -> Result<String> {
    serde_yaml::to_string(services).context(SerializeSnafu)
}

/// Opens `ports` when no VIP fronts them and closes every opened port otherwise
pub fn apply_port_policy(
    env: &dyn HookEnvironment,
    ports: &[u16],
    vip: Option<&str>,
) -> Result<()> {
    let target: BTreeSet<u16> = match vip.filter(|vip| !vip.is_empty()) {
        Some(_) => BTreeSet::new(),
        None => ports.iter().copied().collect(),
    };
    let opened = env.opened_ports().context(PortsSnafu)?;
    for port in target.difference(&opened) {
        tracing::info!(port, "opening port");
        env.open_port(*port).context(PortsSnafu)?;
    }
    for port in opened.difference(&target) {
        tracing::info!(port, "closing port");
        env.close_port(*port).context(PortsSnafu)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;

    #[test]
    fn http_mode_api_service() {
        let services = services(
            &[CONTRAIL_API],
            "10.0.0.99",
            "contrail-lb/0",
            "10.0.0.5",
            HttpMode::Http,
        );
        let api = &services[0];
        assert_eq!(api.service_host, "10.0.0.99");
        assert_eq!(api.service_port, 8082);
        assert_eq!(
            api.servers,
            vec![Server(
                "contrail-lb-0".to_string(),
                "10.0.0.5".to_string(),
                8082,
                SERVER_CHECK.to_string()
            )]
        );
        assert!(api.service_options.contains(&"option httpchk GET /".to_string()));
        assert!(api.service_options.contains(
            &"redirect scheme https code 301 if { hdr(host) -i 10.0.0.99 } !{ ssl_fc }".to_string()
        ));

        let yaml = services_yaml(&services).unwrap();
        let parsed: Vec<HaproxyService> = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, services);
    }

    #[test]
    fn https_mode_passes_tls_through() {
        let services = services(
            &[CONTRAIL_API, CONTRAIL_WEBUI_HTTPS],
            "10.0.0.99",
            "u/0",
            "10.0.0.5",
            "https".parse().unwrap(),
        );
        for service in services {
            assert!(service.service_options.contains(&"mode tcp".to_string()));
            assert!(!service
                .service_options
                .iter()
                .any(|option| option.starts_with("redirect")));
        }
    }

    #[test]
    fn ports_follow_the_vip() {
        let host = FakeHost::new("contrail-controller/0");
        host.open_port(22).unwrap();
        let ports = [8082, 8080, 8143];

        apply_port_policy(&host, &ports, None).unwrap();
        // anything outside the role's port set is closed as well
        assert_eq!(host.opened_ports().unwrap(), BTreeSet::from([8080, 8082, 8143]));

        apply_port_policy(&host, &ports, Some("10.0.0.99")).unwrap();
        assert!(host.opened_ports().unwrap().is_empty());

        apply_port_policy(&host, &ports, Some("")).unwrap();
        assert_eq!(host.opened_ports().unwrap(), BTreeSet::from([8080, 8082, 8143]));
    }
}
