//! Picks the address a unit should use on a given network.
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use snafu::{ResultExt, Snafu};

use crate::{
    executor::{self, BoxedExecutor, Invocation},
    hookenv::{self, HookEnvironment},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("{value:?} is not a valid network"))]
    InvalidNetwork {
        source: ipnetwork::IpNetworkError,
        value: String,
    },

    #[snafu(display("failed to list local addresses"))]
    ListAddresses { source: executor::Error },

    #[snafu(display("no local address in {network}"))]
    NoAddressInNetwork { network: IpNetwork },

    #[snafu(display("failed to ask the host for the unit address"))]
    HostAddress { source: hookenv::Error },
}

/// Local addresses from `ip -o addr show` output
pub fn parse_local_addresses(output: &str) -> Vec<IpAddr> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace().skip(2);
            match fields.next()? {
                "inet" | "inet6" => {}
                _ => return None,
            }
            let address = fields.next()?;
            let address = address.split_once('/').map_or(address, |(ip, _)| ip);
            address.parse().ok()
        })
        .collect()
}

/// Resolves the address of this unit.
///
/// `network` is the value of an option such as `control-network`: when it is a CIDR the first
/// local address inside it wins. Otherwise the host is asked for the primary address of
/// `binding`, and finally for the unit's private address.
pub fn get_ip(
    executor: &BoxedExecutor,
    env: &dyn HookEnvironment,
    network: Option<&str>,
    binding: &str,
) -> Result<String> {
    if let Some(network) = network.map(str::trim).filter(|n| n.contains('/')) {
        let network: IpNetwork = network
            .parse()
            .context(InvalidNetworkSnafu { value: network })?;
        let output = executor
            .execute(&Invocation::new("ip").args(["-o", "addr", "show"]))
            .context(ListAddressesSnafu)?;
        return parse_local_addresses(&output)
            .into_iter()
            .find(|address| network.contains(*address))
            .map(|address| address.to_string())
            .ok_or(Error::NoAddressInNetwork { network });
    }

    if let Some(address) = env.network_address(binding).context(HostAddressSnafu)? {
        return Ok(address);
    }
    env.unit_private_address().context(HostAddressSnafu)
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use indoc::indoc;

    use super::*;
    use crate::testing::{FakeExecutor, FakeHost};

    const IP_ADDR: &str = indoc! {r"
        1: lo    inet 127.0.0.1/8 scope host lo\       valid_lft forever preferred_lft forever
        2: ens3    inet 10.0.0.5/24 brd 10.0.0.255 scope global ens3\       valid_lft forever
        2: ens3    inet6 fe80::f816:3eff:fe5d:1/64 scope link \       valid_lft forever
        3: ens4    inet 192.168.10.7/24 brd 192.168.10.255 scope global ens4\       valid_lft forever
    "};

    #[test]
    fn parses_addresses() {
        let addresses = parse_local_addresses(IP_ADDR);
        assert_eq!(addresses.len(), 4);
        assert_eq!(addresses[1], "10.0.0.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn cidr_selects_local_address() {
        let executor = Rc::new(FakeExecutor::new());
        executor.succeed(&["ip", "-o", "addr", "show"], IP_ADDR);
        let executor: BoxedExecutor = executor;
        let host = FakeHost::new("contrail-agent/0");

        assert_eq!(
            get_ip(&executor, &host, Some("192.168.10.0/24"), "data").unwrap(),
            "192.168.10.7"
        );
        assert!(matches!(
            get_ip(&executor, &host, Some("172.16.0.0/16"), "data"),
            Err(Error::NoAddressInNetwork { .. })
        ));
        assert!(matches!(
            get_ip(&executor, &host, Some("nonsense/99"), "data"),
            Err(Error::InvalidNetwork { .. })
        ));
    }

    #[test]
    fn falls_back_to_binding_then_private_address() {
        let executor: BoxedExecutor = Rc::new(FakeExecutor::new());
        let host = FakeHost::new("contrail-agent/0");
        host.set_private_address("10.0.0.5");
        assert_eq!(get_ip(&executor, &host, None, "data").unwrap(), "10.0.0.5");
        assert_eq!(get_ip(&executor, &host, Some("eth1"), "data").unwrap(), "10.0.0.5");

        host.set_network_address("data", "192.168.10.7");
        assert_eq!(get_ip(&executor, &host, None, "data").unwrap(), "192.168.10.7");
    }
}
