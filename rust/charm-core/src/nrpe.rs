//! Nagios checks over the workload's status tool.
use std::collections::BTreeMap;

use indoc::formatdoc;
use serde::Serialize;
use snafu::{ResultExt, Snafu};
use strum::Display;

use crate::{
    executor::BoxedExecutor,
    hookenv::Settings,
    status::{self, ServiceMap, WorkloadState, CONTRAIL_STATUS},
    templating::{self, Perms, Renderer},
};

type Result<T, E = Error> = std::result::Result<T, E>;

pub const PLUGINS_DIR: &str = "/usr/local/lib/nagios/plugins";
pub const NRPE_CONFIG_DIR: &str = "/etc/nagios/nrpe.d";
pub const SUDOERS_FILE: &str = "/etc/sudoers.d/nagios";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to install the check for {module}"))]
    InstallCheck {
        source: templating::Error,
        module: String,
    },

    #[snafu(display("failed to encode monitors"))]
    EncodeMonitors { source: serde_yaml::Error },
}

/// Plugin result, mapped onto the exit codes Nagios expects
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "UPPERCASE")]
pub enum NagiosState {
    Ok,
    Warning,
    Critical,
}

impl NagiosState {
    pub fn exit_code(self) -> i32 {
        match self {
            NagiosState::Ok => 0,
            NagiosState::Warning => 1,
            NagiosState::Critical => 2,
        }
    }
}

pub fn check_name(module: &str) -> String {
    format!("check_contrail_status_{module}")
}

/// Evaluates the status tool output for `module` as a Nagios plugin would
pub fn check_status(
    executor: &BoxedExecutor,
    module: &str,
    services: ServiceMap,
) -> (NagiosState, String) {
    let status = match status::collect_status_output(executor, module)
        .and_then(|output| status::parse_status_output(&output))
    {
        Ok(report) => status::evaluate(&report, services),
        Err(error) => return (NagiosState::Critical, error.to_string()),
    };
    let state = match status.state {
        WorkloadState::Active => NagiosState::Ok,
        WorkloadState::Waiting | WorkloadState::Maintenance => NagiosState::Warning,
        WorkloadState::Blocked => NagiosState::Critical,
    };
    (state, status.message)
}

fn plugin_script(module: &str) -> String {
    formatdoc! {"
        #!/bin/bash
        # Managed by contrail-charm, changes will be overwritten
        exec sudo -n contrail-charm check-status --module {module}
        "}
}

fn nrpe_config(module: &str) -> String {
    let name = check_name(module);
    formatdoc! {"
        # Managed by contrail-charm, changes will be overwritten
        command[{name}]={PLUGINS_DIR}/{name}.sh
        "}
}

fn sudoers() -> String {
    formatdoc! {"
        nagios ALL=(root) NOPASSWD: /usr/bin/{CONTRAIL_STATUS}, /usr/local/bin/contrail-charm
        "}
}

/// Installs plugin, sudoers entry and NRPE command for `module`; returns whether any changed
pub fn install_checks(renderer: &Renderer, module: &str) -> Result<bool> {
    let name = check_name(module);
    let files = [
        (format!("{PLUGINS_DIR}/{name}.sh"), plugin_script(module), 0o755),
        (SUDOERS_FILE.to_string(), sudoers(), 0o440),
        (format!("{NRPE_CONFIG_DIR}/{name}.cfg"), nrpe_config(module), 0o644),
    ];
    let mut changed = false;
    for (path, contents, mode) in files {
        changed |= renderer
            .write(&path, &contents, Perms::mode(mode))
            .context(InstallCheckSnafu { module })?;
    }
    Ok(changed)
}

#[derive(Serialize)]
struct Monitors {
    monitors: RemoteMonitors,
}

#[derive(Serialize)]
struct RemoteMonitors {
    remote: NrpeMonitors,
}

#[derive(Serialize)]
struct NrpeMonitors {
    nrpe: BTreeMap<String, NrpeCommand>,
}

#[derive(Serialize)]
struct NrpeCommand {
    command: String,
}

/// The `monitors` setting announcing the check to the monitoring peer
pub fn monitors_settings(module: &str) -> Result<Settings> {
    let name = check_name(module);
    let monitors = Monitors {
        monitors: RemoteMonitors {
            remote: NrpeMonitors {
                nrpe: BTreeMap::from([(name.clone(), NrpeCommand { command: name })]),
            },
        },
    };
    Ok(Settings::from([(
        "monitors".to_string(),
        Some(serde_yaml::to_string(&monitors).context(EncodeMonitorsSnafu)?),
    )]))
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use indoc::indoc;
    use rstest::rstest;

    use super::*;
    use crate::{templating::TemplateSet, testing::FakeExecutor};

    const VROUTER: ServiceMap = &[("vrouter", &["agent", "nodemgr"])];

    #[rstest]
    #[case::healthy("active", NagiosState::Ok)]
    #[case::starting("initializing", NagiosState::Warning)]
    #[case::broken("inactive", NagiosState::Critical)]
    fn maps_status_to_nagios(#[case] agent: &str, #[case] expected: NagiosState) {
        let executor = Rc::new(FakeExecutor::new());
        executor.succeed(
            &[CONTRAIL_STATUS],
            &format!("== Contrail vrouter ==\nagent: {agent}\nnodemgr: active\n"),
        );
        let executor: BoxedExecutor = executor;
        let (state, _) = check_status(&executor, "vrouter", VROUTER);
        assert_eq!(state, expected);
    }

    #[test]
    fn unavailable_tool_is_critical() {
        let executor = Rc::new(FakeExecutor::new());
        executor.fail(&[CONTRAIL_STATUS], "no such container");
        let executor: BoxedExecutor = executor;
        let (state, _) = check_status(&executor, "vrouter", VROUTER);
        assert_eq!(state, NagiosState::Critical);
        assert_eq!(state.exit_code(), 2);
        assert_eq!(state.to_string(), "CRITICAL");
    }

    #[test]
    fn installs_files_once() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Renderer::new(dir.path(), TemplateSet::new()).without_ownership();
        assert!(install_checks(&renderer, "vrouter").unwrap());
        assert!(!install_checks(&renderer, "vrouter").unwrap());
        assert_eq!(
            renderer
                .read("/etc/nagios/nrpe.d/check_contrail_status_vrouter.cfg")
                .unwrap()
                .unwrap(),
            indoc! {"
                # Managed by contrail-charm, changes will be overwritten
                command[check_contrail_status_vrouter]=/usr/local/lib/nagios/plugins/check_contrail_status_vrouter.sh
            "}
        );
    }

    #[test]
    fn monitors_yaml() {
        let settings = monitors_settings("analytics").unwrap();
        let monitors: serde_yaml::Value =
            serde_yaml::from_str(settings["monitors"].as_deref().unwrap()).unwrap();
        assert_eq!(
            monitors["monitors"]["remote"]["nrpe"]["check_contrail_status_analytics"]["command"]
                .as_str(),
            Some("check_contrail_status_analytics")
        );
    }
}
