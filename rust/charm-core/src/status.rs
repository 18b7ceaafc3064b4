//! Maps the output of the workload's `contrail-status` tool onto a single unit status.
//!
//! The tool prints one block per service group:
//!
//! ```text
//! == Contrail control ==
//! control: active
//! nodemgr: initializing (Collector connection down)
//!
//! == Contrail config-database ==
//! cassandra: active
//! ```
//!
//! Every role declares which groups and services it expects ([`ServiceMap`]); the unit is only
//! `active` if all of them report `active` or `backup`.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{Display, EnumString};

use crate::{
    executor::{self, BoxedExecutor, Invocation},
    READY_MESSAGE,
};

pub const CONTRAIL_STATUS: &str = "contrail-status";

/// Message used whenever the status tool cannot be run or understood
pub const WAITING_FOR_CONTAINERS: &str = "Waiting services to run in container";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to run {CONTRAIL_STATUS} for {module}"))]
    StatusUnavailable {
        source: executor::Error,
        module: String,
    },

    #[snafu(display("unparseable {CONTRAIL_STATUS} output at line {line_number}: {line:?}"))]
    Unparseable { line_number: usize, line: String },
}

/// The workload state the host framework shows for a unit
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumString,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WorkloadState {
    Maintenance,
    Waiting,
    Blocked,
    Active,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Status {
    pub state: WorkloadState,
    pub message: String,
}

impl Status {
    pub fn new(state: WorkloadState, message: impl Into<String>) -> Self {
        Status {
            state,
            message: message.into(),
        }
    }

    pub fn active(message: impl Into<String>) -> Self {
        Self::new(WorkloadState::Active, message)
    }

    pub fn ready() -> Self {
        Self::active(READY_MESSAGE)
    }

    pub fn waiting(message: impl Into<String>) -> Self {
        Self::new(WorkloadState::Waiting, message)
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::new(WorkloadState::Blocked, message)
    }

    pub fn maintenance(message: impl Into<String>) -> Self {
        Self::new(WorkloadState::Maintenance, message)
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkloadState::Active
    }
}

/// Expected service groups of a role, each with the services that must be present in it
pub type ServiceMap = &'static [(&'static str, &'static [&'static str])];

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceState {
    pub state: String,
    pub description: Option<String>,
}

/// Parsed status output: group name to service name to state
pub type StatusReport = BTreeMap<String, BTreeMap<String, ServiceState>>;

/// Parses the text output of `contrail-status`.
///
/// Group headers look like `== Contrail <group> ==`; the first word of the header is a product
/// prefix and is not part of the group name. A blank line closes the current group. Anything
/// outside a group, such as the container table or kernel module notes, is ignored, as are
/// lines inside a group that do not read `<service>: <state>`.
pub fn parse_status_output(output: &str) -> Result<StatusReport, Error> {
    let mut report = StatusReport::new();
    let mut current_group: Option<String> = None;

    for (index, raw_line) in output.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            current_group = None;
            continue;
        }

        if line.starts_with("==") {
            let header = line.trim_matches('=').trim();
            let group = header
                .split_once(char::is_whitespace)
                .map(|(_, name)| name.trim())
                .filter(|name| !name.is_empty())
                .context(UnparseableSnafu {
                    line_number: index + 1,
                    line,
                })?;
            report.entry(group.to_string()).or_default();
            current_group = Some(group.to_string());
            continue;
        }

        let Some(group) = &current_group else {
            continue;
        };
        let Some((service, rest)) = line.split_once(':') else {
            tracing::debug!(%group, line, "skipping status line without a service state");
            continue;
        };
        let rest = rest.trim();
        let (state, description) = match rest.split_once(char::is_whitespace) {
            Some((state, description)) => (state, Some(description.trim().to_string())),
            None => (rest, None),
        };
        if state.is_empty() {
            tracing::debug!(%group, line, "skipping status line without a service state");
            continue;
        }
        report.entry(group.clone()).or_default().insert(
            service.trim().to_string(),
            ServiceState {
                state: state.to_string(),
                description: description.filter(|d| !d.is_empty()),
            },
        );
    }

    if report.is_empty() {
        return UnparseableSnafu {
            line_number: 0_usize,
            line: output.trim(),
        }
        .fail();
    }
    Ok(report)
}

/// Reduces a status report to a single unit status for the expected services
pub fn evaluate(report: &StatusReport, services: ServiceMap) -> Status {
    for (group, expected) in services {
        let Some(actual) = report.get(*group) else {
            return Status::waiting(format!(
                "POD {group} is absent in the {CONTRAIL_STATUS}"
            ));
        };
        for service in expected.iter() {
            let Some(service_state) = actual.get(*service) else {
                return Status::waiting(format!(
                    "{service} of POD {group} is absent in the {CONTRAIL_STATUS}"
                ));
            };
            match service_state.state.as_str() {
                "active" | "backup" => {}
                state => {
                    let reason = service_state.description.as_deref().unwrap_or(state);
                    let message = format!("{service} is not ready. Reason: {reason}");
                    return if state == "initializing" {
                        Status::waiting(message)
                    } else {
                        Status::blocked(message)
                    };
                }
            }
        }
    }
    Status::ready()
}

/// Runs the status tool for a module and returns its raw output
pub fn collect_status_output(executor: &BoxedExecutor, module: &str) -> Result<String, Error> {
    executor
        .execute(
            &Invocation::new(CONTRAIL_STATUS)
                .env("CONTRAIL_STATUS_CONTAINER_NAME", format!("contrail-status-{module}")),
        )
        .context(StatusUnavailableSnafu { module })
}

/// Runs the status tool and evaluates it; an unavailable or unreadable tool means the
/// containers are still coming up.
pub fn services_status(executor: &BoxedExecutor, module: &str, services: ServiceMap) -> Status {
    match collect_status_output(executor, module).and_then(|output| parse_status_output(&output)) {
        Ok(report) => evaluate(&report, services),
        Err(error) => {
            tracing::info!(module, %error, "container is not ready to report status");
            Status::waiting(WAITING_FOR_CONTAINERS)
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::{formatdoc, indoc};
    use rstest::rstest;

    use super::*;

    const CONTROLLER_SERVICES: ServiceMap = &[
        ("control", &["control", "nodemgr", "named", "dns"]),
        ("config-database", &["nodemgr", "zookeeper", "rabbitmq", "cassandra"]),
    ];

    fn report(control_state: &str) -> StatusReport {
        parse_status_output(&formatdoc! {"
                == Contrail control ==
                control: {control_state}
                nodemgr: active
                named: active
                dns: backup

                == Contrail config-database ==
                nodemgr: active
                zookeeper: active
                rabbitmq: active
                cassandra: active
            "})
        .unwrap()
    }

    #[test]
    fn parses_groups_and_descriptions() {
        let report = parse_status_output(indoc! {"
            == Contrail vrouter ==
            nodemgr: initializing (Collector connection down)
            agent: active
        "})
        .unwrap();
        let vrouter = &report["vrouter"];
        assert_eq!(vrouter.len(), 2);
        assert_eq!(vrouter["agent"].state, "active");
        assert_eq!(vrouter["agent"].description, None);
        assert_eq!(vrouter["nodemgr"].state, "initializing");
        assert_eq!(
            vrouter["nodemgr"].description.as_deref(),
            Some("(Collector connection down)")
        );
    }

    #[rstest]
    #[case::service_before_group("agent: active\n")]
    #[case::table_only("Pod Service Original Name State Id Status\nvrouter agent contrail-vrouter-agent running 1a2b Up 2 hours\n")]
    #[case::empty("")]
    #[case::nameless_group("== Contrail ==\n")]
    fn rejects_garbage(#[case] output: &str) {
        assert!(parse_status_output(output).is_err());
    }

    #[test]
    fn skips_the_container_table_and_free_text() {
        let report = parse_status_output(indoc! {"
            Pod      Service      Original Name           Original Version  State    Id            Status
                     rsyslogd                             2011.138          running  5d0c7d4a9b1e  Up 2 hours
            vrouter  agent        contrail-vrouter-agent  2011.138          running  0e3f3f1c2a77  Up 2 hours
            vrouter  nodemgr      contrail-nodemgr        2011.138          running  9b1c4e6d8f00  Up 2 hours

            vrouter kernel module is PRESENT
            == Contrail vrouter ==
            nodemgr: active
            agent: active
            vrouter agent is connected to 2 control nodes

            == Contrail control ==
            control: initializing (Number of connections:3, Expected:4)

            note: trailing notes after a blank line belong to no group
        "})
        .unwrap();

        assert_eq!(report.keys().collect::<Vec<_>>(), ["control", "vrouter"]);
        let vrouter = &report["vrouter"];
        assert_eq!(vrouter.keys().collect::<Vec<_>>(), ["agent", "nodemgr"]);
        assert_eq!(report["control"]["control"].state, "initializing");
        assert_eq!(
            report["control"]["control"].description.as_deref(),
            Some("(Number of connections:3, Expected:4)")
        );
        assert!(evaluate(&report, &[("vrouter", &["agent", "nodemgr"])]).is_active());
    }

    #[rstest]
    #[case::active("active", WorkloadState::Active)]
    #[case::backup("backup", WorkloadState::Active)]
    #[case::initializing("initializing", WorkloadState::Waiting)]
    #[case::inactive("inactive", WorkloadState::Blocked)]
    #[case::timeout("timeout", WorkloadState::Blocked)]
    fn maps_service_states(#[case] state: &str, #[case] expected: WorkloadState) {
        let status = evaluate(&report(state), CONTROLLER_SERVICES);
        assert_eq!(status.state, expected);
        if expected == WorkloadState::Active {
            assert_eq!(status.message, READY_MESSAGE);
        } else {
            assert_eq!(status.message, format!("control is not ready. Reason: {state}"));
        }
    }

    #[test]
    fn missing_group_or_service_waits() {
        let report = parse_status_output(indoc! {"
            == Contrail control ==
            control: active
        "})
        .unwrap();
        let status = evaluate(&report, CONTROLLER_SERVICES);
        assert_eq!(
            status,
            Status::waiting("nodemgr of POD control is absent in the contrail-status")
        );

        let status = evaluate(&report, &[("webui", &["web"])]);
        assert_eq!(
            status,
            Status::waiting("POD webui is absent in the contrail-status")
        );
    }

    #[test]
    fn workload_state_names() {
        assert_eq!(WorkloadState::Maintenance.to_string(), "maintenance");
        assert_eq!("blocked".parse::<WorkloadState>().unwrap(), WorkloadState::Blocked);
    }
}
