//! Leader-maintained cluster membership of the controller units.
//!
//! For each address family the leader keeps an ordered address list and a unit to address map
//! in its settings. Consumers index into the list, so a unit whose address changes keeps its
//! slot, and a departing unit's slot is removed without reordering the others.
use std::collections::{BTreeMap, BTreeSet};

use snafu::{ResultExt, Snafu};
use strum::{EnumIter, IntoEnumIterator};

use crate::{hookenv::Settings, kv::LeaderSettings};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("leader settings hold an invalid {family:?} membership"))]
    Decode {
        source: crate::kv::Error,
        family: AddressFamily,
    },

    #[snafu(display("failed to encode the {family:?} membership"))]
    Encode {
        source: serde_json::Error,
        family: AddressFamily,
    },
}

#[derive(Clone, Copy, Debug, EnumIter, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum AddressFamily {
    /// Control plane addresses
    Ip,
    /// Data plane addresses
    DataIp,
}

impl AddressFamily {
    pub fn list_key(self) -> &'static str {
        match self {
            AddressFamily::Ip => "controller_ip_list",
            AddressFamily::DataIp => "controller_data_ip_list",
        }
    }

    pub fn map_key(self) -> &'static str {
        match self {
            AddressFamily::Ip => "controller_ips",
            AddressFamily::DataIp => "controller_data_ips",
        }
    }

    pub fn all() -> impl Iterator<Item = AddressFamily> {
        AddressFamily::iter()
    }
}

/// What an observation did to the membership
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Change {
    Unchanged,
    Added,
    Replaced { old: String },
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Membership {
    list: Vec<String>,
    units: BTreeMap<String, String>,
}

impl Membership {
    pub fn load(leader: &LeaderSettings, family: AddressFamily) -> Result<Self> {
        Ok(Membership {
            list: leader
                .get_json(family.list_key())
                .context(DecodeSnafu { family })?
                .unwrap_or_default(),
            units: leader
                .get_json(family.map_key())
                .context(DecodeSnafu { family })?
                .unwrap_or_default(),
        })
    }

    pub fn to_settings(&self, family: AddressFamily) -> Result<Settings> {
        Ok(Settings::from([
            (
                family.list_key().to_string(),
                Some(serde_json::to_string(&self.list).context(EncodeSnafu { family })?),
            ),
            (
                family.map_key().to_string(),
                Some(serde_json::to_string(&self.units).context(EncodeSnafu { family })?),
            ),
        ]))
    }

    pub fn list(&self) -> &[String] {
        &self.list
    }

    pub fn units(&self) -> &BTreeMap<String, String> {
        &self.units
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn address_of(&self, unit: &str) -> Option<&str> {
        self.units.get(unit).map(String::as_str)
    }

    /// Records that `unit` currently has `address`
    pub fn observe(&mut self, unit: &str, address: &str) -> Change {
        let old = self.units.get(unit).cloned();
        if old.as_deref() == Some(address) {
            return Change::Unchanged;
        }

        // An address can only belong to one unit; whoever held it before has gone away
        let previous_owner = self
            .units
            .iter()
            .find(|(other, other_address)| other.as_str() != unit && *other_address == address)
            .map(|(other, _)| other.clone());
        if let Some(previous_owner) = previous_owner {
            self.depart(&previous_owner);
        }

        self.units.insert(unit.to_string(), address.to_string());
        match old {
            None => {
                self.list.push(address.to_string());
                Change::Added
            }
            Some(old) => {
                match self.list.iter().position(|entry| *entry == old) {
                    Some(slot) => self.list[slot] = address.to_string(),
                    // the old slot vanished under us, treat it as a fresh join
                    None => self.list.push(address.to_string()),
                }
                Change::Replaced { old }
            }
        }
    }

    /// Forgets `unit`, returning the address it had
    pub fn depart(&mut self, unit: &str) -> Option<String> {
        let old = self.units.remove(unit)?;
        self.list.retain(|entry| *entry != old);
        Some(old)
    }

    /// Fills an empty membership from the current observations in one batch
    pub fn seed<'a>(&mut self, observations: impl IntoIterator<Item = (&'a str, &'a str)>) -> bool {
        if !self.is_empty() {
            return false;
        }
        for (unit, address) in observations {
            self.observe(unit, address);
        }
        true
    }

    /// Every mapped address is listed exactly once and nothing else is listed
    pub fn is_consistent(&self) -> bool {
        let listed: BTreeSet<&String> = self.list.iter().collect();
        let mapped: BTreeSet<&String> = self.units.values().collect();
        listed.len() == self.list.len() && listed == mapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(members: &[(&str, &str)]) -> Membership {
        let mut membership = Membership::default();
        assert!(membership.seed(members.iter().copied()));
        membership
    }

    #[test]
    fn address_change_keeps_the_slot() {
        let mut membership = membership(&[
            ("ctrl/0", "10.0.0.10"),
            ("ctrl/1", "10.0.0.11"),
            ("ctrl/2", "10.0.0.12"),
        ]);
        assert_eq!(
            membership.observe("ctrl/1", "10.0.0.21"),
            Change::Replaced {
                old: "10.0.0.11".to_string()
            }
        );
        assert_eq!(membership.list(), ["10.0.0.10", "10.0.0.21", "10.0.0.12"]);
        assert_eq!(membership.address_of("ctrl/1"), Some("10.0.0.21"));
        assert!(membership.is_consistent());
    }

    #[test]
    fn join_appends_and_departure_preserves_order() {
        let mut membership = membership(&[("ctrl/0", "10.0.0.10"), ("ctrl/1", "10.0.0.11")]);
        assert_eq!(membership.observe("ctrl/2", "10.0.0.12"), Change::Added);
        assert_eq!(membership.observe("ctrl/2", "10.0.0.12"), Change::Unchanged);
        assert_eq!(membership.depart("ctrl/1").as_deref(), Some("10.0.0.11"));
        assert_eq!(membership.depart("ctrl/1"), None);
        assert_eq!(membership.list(), ["10.0.0.10", "10.0.0.12"]);
        assert!(membership.is_consistent());
    }

    #[test]
    fn missing_old_slot_appends() {
        let mut membership = Membership {
            list: vec!["10.0.0.10".to_string()],
            units: BTreeMap::from([
                ("ctrl/0".to_string(), "10.0.0.10".to_string()),
                ("ctrl/1".to_string(), "10.0.0.11".to_string()),
            ]),
        };
        membership.observe("ctrl/1", "10.0.0.21");
        assert_eq!(membership.list(), ["10.0.0.10", "10.0.0.21"]);
        assert!(membership.is_consistent());
    }

    #[test]
    fn reused_address_moves_to_the_new_unit() {
        let mut membership = membership(&[("ctrl/0", "10.0.0.10"), ("ctrl/1", "10.0.0.11")]);
        membership.observe("ctrl/3", "10.0.0.11");
        assert_eq!(membership.list(), ["10.0.0.10", "10.0.0.11"]);
        assert_eq!(membership.address_of("ctrl/1"), None);
        assert_eq!(membership.address_of("ctrl/3"), Some("10.0.0.11"));
        assert!(membership.is_consistent());
    }

    #[test]
    fn seeding_only_happens_once() {
        let mut membership = membership(&[("ctrl/0", "10.0.0.10")]);
        assert!(!membership.seed([("ctrl/1", "10.0.0.11")]));
        assert_eq!(membership.list(), ["10.0.0.10"]);
    }

    #[test]
    fn arbitrary_event_sequences_stay_consistent() {
        let events: &[(&str, Option<&str>)] = &[
            ("u/0", Some("a")),
            ("u/1", Some("b")),
            ("u/2", Some("c")),
            ("u/1", Some("d")),
            ("u/0", None),
            ("u/3", Some("c")),
            ("u/2", Some("e")),
            ("u/1", Some("d")),
            ("u/4", Some("a")),
            ("u/3", None),
        ];
        let mut membership = Membership::default();
        for (unit, address) in events {
            match address {
                Some(address) => {
                    membership.observe(unit, address);
                }
                None => {
                    membership.depart(unit);
                }
            }
            assert!(membership.is_consistent(), "inconsistent after {unit} {address:?}");
        }
        assert_eq!(membership.list(), ["d", "e", "a"]);
    }

    #[test]
    fn round_trips_through_leader_settings() {
        let membership = membership(&[("ctrl/0", "10.0.0.10"), ("ctrl/1", "10.0.0.11")]);
        let settings = membership.to_settings(AddressFamily::DataIp).unwrap();
        let leader = LeaderSettings::new(
            true,
            settings
                .into_iter()
                .map(|(key, value)| (key, value.unwrap_or_default()))
                .collect(),
        );
        assert_eq!(
            leader.get("controller_data_ip_list"),
            Some(r#"["10.0.0.10","10.0.0.11"]"#)
        );
        assert_eq!(
            Membership::load(&leader, AddressFamily::DataIp).unwrap(),
            membership
        );
        assert!(Membership::load(&leader, AddressFamily::Ip).unwrap().is_empty());
    }
}
