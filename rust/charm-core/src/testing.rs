//! In-memory stand-ins for the host framework, the container runtime and external programs.
//!
//! All fakes use interior mutability so that tests can keep a handle on them while the code
//! under test holds shared references.
use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use serde_json::Value;

use crate::{
    docker::{self, ContainerRuntime, ImageRef, PullOutcome, RunSpec, RuntimeSettings},
    executor::{self, Executor, Invocation},
    hookenv::{self, relation_endpoint, HookEnvironment, Settings},
    kv::RelationBag,
    status::Status,
};

fn failure(command: impl Into<String>, stderr: impl Into<String>) -> executor::Error {
    executor::Error::Failed {
        command: command.into(),
        status: "exit status: 1".to_string(),
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// Replays canned output for invocations matching a prefix; the latest matching rule wins and
/// anything unmatched succeeds with empty output
#[derive(Default)]
pub struct FakeExecutor {
    rules: RefCell<Vec<(Vec<String>, Result<String, String>)>>,
    calls: RefCell<Vec<Invocation>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeed(&self, prefix: &[&str], stdout: &str) {
        self.rules.borrow_mut().push((
            prefix.iter().map(|word| word.to_string()).collect(),
            Ok(stdout.to_string()),
        ));
    }

    pub fn fail(&self, prefix: &[&str], stderr: &str) {
        self.rules.borrow_mut().push((
            prefix.iter().map(|word| word.to_string()).collect(),
            Err(stderr.to_string()),
        ));
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, prefix: &[&str]) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }
}

impl Executor for FakeExecutor {
    fn execute(&self, invocation: &Invocation) -> Result<String, executor::Error> {
        self.calls.borrow_mut().push(invocation.clone());
        let rules = self.rules.borrow();
        let rule = rules.iter().rev().find(|(prefix, _)| {
            let prefix: Vec<&str> = prefix.iter().map(String::as_str).collect();
            invocation.starts_with(&prefix)
        });
        match rule {
            Some((_, Ok(stdout))) => Ok(stdout.clone()),
            Some((_, Err(stderr))) => Err(failure(invocation.to_string(), stderr.clone())),
            None => Ok(String::new()),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct FakeRelation {
    remote: BTreeMap<String, RelationBag>,
    local: RelationBag,
}

#[derive(Debug, Default)]
struct HostState {
    remote_unit: Option<String>,
    relation_id: Option<String>,
    config: BTreeMap<String, Value>,
    is_leader: bool,
    leader_settings: BTreeMap<String, String>,
    relations: BTreeMap<String, FakeRelation>,
    statuses: Vec<Status>,
    application_version: Option<String>,
    opened_ports: BTreeSet<u16>,
    private_address: String,
    network_addresses: BTreeMap<String, String>,
}

/// An in-memory host framework for one unit
pub struct FakeHost {
    unit: String,
    state: RefCell<HostState>,
}

impl FakeHost {
    pub fn new(unit: &str) -> Self {
        FakeHost {
            unit: unit.to_string(),
            state: RefCell::new(HostState {
                private_address: "10.0.0.5".to_string(),
                ..HostState::default()
            }),
        }
    }

    pub fn set_config(&self, key: &str, value: impl Into<Value>) {
        self.state
            .borrow_mut()
            .config
            .insert(key.to_string(), value.into());
    }

    pub fn unset_config(&self, key: &str) {
        self.state.borrow_mut().config.remove(key);
    }

    pub fn set_leader(&self, is_leader: bool) {
        self.state.borrow_mut().is_leader = is_leader;
    }

    pub fn set_leader_settings<'a>(&self, values: impl IntoIterator<Item = (&'a str, &'a str)>) {
        self.state.borrow_mut().leader_settings.extend(
            values
                .into_iter()
                .map(|(key, value)| (key.to_string(), value.to_string())),
        );
    }

    pub fn leader_settings(&self) -> BTreeMap<String, String> {
        self.state.borrow().leader_settings.clone()
    }

    /// Adds (or updates) a remote unit and its bag on a relation
    pub fn set_remote<'a>(
        &self,
        relation_id: &str,
        unit: &str,
        values: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) {
        let mut state = self.state.borrow_mut();
        let bag = state
            .relations
            .entry(relation_id.to_string())
            .or_default()
            .remote
            .entry(unit.to_string())
            .or_default();
        for (key, value) in values {
            bag.insert(key, value);
        }
    }

    /// Registers a relation without any remote units yet
    pub fn add_relation(&self, relation_id: &str) {
        self.state
            .borrow_mut()
            .relations
            .entry(relation_id.to_string())
            .or_default();
    }

    pub fn remove_remote(&self, relation_id: &str, unit: &str) {
        if let Some(relation) = self.state.borrow_mut().relations.get_mut(relation_id) {
            relation.remote.remove(unit);
        }
    }

    pub fn remove_relation(&self, relation_id: &str) {
        self.state.borrow_mut().relations.remove(relation_id);
    }

    /// What this unit published on a relation
    pub fn local_bag(&self, relation_id: &str) -> RelationBag {
        self.state
            .borrow()
            .relations
            .get(relation_id)
            .map(|relation| relation.local.clone())
            .unwrap_or_default()
    }

    /// Sets the relation event the next hook runs for
    pub fn set_event(&self, relation_id: Option<&str>, remote_unit: Option<&str>) {
        let mut state = self.state.borrow_mut();
        state.relation_id = relation_id.map(str::to_string);
        state.remote_unit = remote_unit.map(str::to_string);
    }

    pub fn status(&self) -> Option<Status> {
        self.state.borrow().statuses.last().cloned()
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.state.borrow().statuses.clone()
    }

    pub fn application_version(&self) -> Option<String> {
        self.state.borrow().application_version.clone()
    }

    pub fn set_private_address(&self, address: &str) {
        self.state.borrow_mut().private_address = address.to_string();
    }

    pub fn set_network_address(&self, binding: &str, address: &str) {
        self.state
            .borrow_mut()
            .network_addresses
            .insert(binding.to_string(), address.to_string());
    }
}

impl HookEnvironment for FakeHost {
    fn local_unit(&self) -> String {
        self.unit.clone()
    }

    fn remote_unit(&self) -> Option<String> {
        self.state.borrow().remote_unit.clone()
    }

    fn relation_id(&self) -> Option<String> {
        self.state.borrow().relation_id.clone()
    }

    fn config_get(&self) -> Result<BTreeMap<String, Value>, hookenv::Error> {
        Ok(self.state.borrow().config.clone())
    }

    fn is_leader(&self) -> Result<bool, hookenv::Error> {
        Ok(self.state.borrow().is_leader)
    }

    fn leader_get(&self) -> Result<BTreeMap<String, String>, hookenv::Error> {
        Ok(self.state.borrow().leader_settings.clone())
    }

    fn leader_set(&self, settings: &Settings) -> Result<(), hookenv::Error> {
        let mut state = self.state.borrow_mut();
        if !state.is_leader {
            return Err(hookenv::Error::HookTool {
                source: failure("leader-set", "cannot write leader settings: not the leader"),
                tool: "leader-set",
            });
        }
        for (key, value) in settings {
            match value.as_deref().filter(|value| !value.is_empty()) {
                Some(value) => state.leader_settings.insert(key.clone(), value.to_string()),
                None => state.leader_settings.remove(key),
            };
        }
        Ok(())
    }

    fn relation_ids(&self, endpoint: &str) -> Result<Vec<String>, hookenv::Error> {
        Ok(self
            .state
            .borrow()
            .relations
            .keys()
            .filter(|relation_id| relation_endpoint(relation_id) == endpoint)
            .cloned()
            .collect())
    }

    fn related_units(&self, relation_id: &str) -> Result<Vec<String>, hookenv::Error> {
        Ok(self
            .state
            .borrow()
            .relations
            .get(relation_id)
            .map(|relation| relation.remote.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn relation_get(&self, relation_id: &str, unit: &str) -> Result<RelationBag, hookenv::Error> {
        let state = self.state.borrow();
        let Some(relation) = state.relations.get(relation_id) else {
            return Ok(RelationBag::default());
        };
        if unit == self.unit {
            return Ok(relation.local.clone());
        }
        Ok(relation.remote.get(unit).cloned().unwrap_or_default())
    }

    fn relation_set(&self, relation_id: &str, settings: &Settings) -> Result<(), hookenv::Error> {
        self.state
            .borrow_mut()
            .relations
            .entry(relation_id.to_string())
            .or_default()
            .local
            .apply(settings);
        Ok(())
    }

    fn status_set(&self, status: &Status) -> Result<(), hookenv::Error> {
        self.state.borrow_mut().statuses.push(status.clone());
        Ok(())
    }

    fn application_version_set(&self, version: &str) -> Result<(), hookenv::Error> {
        self.state.borrow_mut().application_version = Some(version.to_string());
        Ok(())
    }

    fn open_port(&self, port: u16) -> Result<(), hookenv::Error> {
        self.state.borrow_mut().opened_ports.insert(port);
        Ok(())
    }

    fn close_port(&self, port: u16) -> Result<(), hookenv::Error> {
        self.state.borrow_mut().opened_ports.remove(&port);
        Ok(())
    }

    fn opened_ports(&self) -> Result<BTreeSet<u16>, hookenv::Error> {
        Ok(self.state.borrow().opened_ports.clone())
    }

    fn unit_private_address(&self) -> Result<String, hookenv::Error> {
        Ok(self.state.borrow().private_address.clone())
    }

    fn network_address(&self, binding: &str) -> Result<Option<String>, hookenv::Error> {
        Ok(self.state.borrow().network_addresses.get(binding).cloned())
    }
}

#[derive(Debug, Default)]
struct RuntimeState {
    installs: Vec<RuntimeSettings>,
    logins: Vec<(String, String)>,
    present: BTreeSet<ImageRef>,
    pulls: Vec<ImageRef>,
    failing: BTreeSet<String>,
    compose_ups: Vec<(PathBuf, bool)>,
    compose_downs: Vec<PathBuf>,
    runs: Vec<RunSpec>,
    execs: Vec<(String, Vec<String>)>,
    copies: Vec<(String, String, String)>,
    launched: BTreeSet<String>,
    removed: Vec<String>,
    version: String,
}

/// A container runtime that only records what it was asked to do
pub struct FakeRuntime {
    state: RefCell<RuntimeState>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        FakeRuntime {
            state: RefCell::new(RuntimeState {
                version: "5.1.0-0.38".to_string(),
                ..RuntimeState::default()
            }),
        }
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes pulls of images with this name fail
    pub fn fail_pulls_of(&self, name: &str) {
        self.state.borrow_mut().failing.insert(name.to_string());
    }

    pub fn set_version(&self, version: &str) {
        self.state.borrow_mut().version = version.to_string();
    }

    pub fn set_launched(&self, container: &str) {
        self.state
            .borrow_mut()
            .launched
            .insert(container.to_string());
    }

    pub fn pulls(&self) -> Vec<ImageRef> {
        self.state.borrow().pulls.clone()
    }

    pub fn compose_ups(&self) -> Vec<(PathBuf, bool)> {
        self.state.borrow().compose_ups.clone()
    }

    pub fn compose_downs(&self) -> Vec<PathBuf> {
        self.state.borrow().compose_downs.clone()
    }

    pub fn installs(&self) -> Vec<RuntimeSettings> {
        self.state.borrow().installs.clone()
    }

    pub fn logins(&self) -> Vec<(String, String)> {
        self.state.borrow().logins.clone()
    }

    pub fn runs(&self) -> Vec<RunSpec> {
        self.state.borrow().runs.clone()
    }

    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.state.borrow().execs.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.borrow().removed.clone()
    }
}

impl ContainerRuntime for FakeRuntime {
    fn install(&self, settings: &RuntimeSettings) -> Result<(), docker::Error> {
        self.state.borrow_mut().installs.push(settings.clone());
        Ok(())
    }

    fn login(&self, registry: &str, user: &str, _password: &str) -> Result<(), docker::Error> {
        self.state
            .borrow_mut()
            .logins
            .push((registry.to_string(), user.to_string()));
        Ok(())
    }

    fn pull(&self, image: &ImageRef) -> Result<PullOutcome, docker::Error> {
        let mut state = self.state.borrow_mut();
        if state.present.contains(image) {
            return Ok(PullOutcome::AlreadyPresent);
        }
        if state.failing.contains(&image.name) {
            return Err(docker::Error::ImagePull {
                source: failure(format!("docker pull {image}"), "manifest unknown"),
                image: image.clone(),
            });
        }
        state.pulls.push(image.clone());
        state.present.insert(image.clone());
        Ok(PullOutcome::Pulled)
    }

    fn compose_up(&self, manifest: &Path, recreate: bool) -> Result<(), docker::Error> {
        self.state
            .borrow_mut()
            .compose_ups
            .push((manifest.to_path_buf(), recreate));
        Ok(())
    }

    fn compose_down(&self, manifest: &Path) -> Result<(), docker::Error> {
        self.state
            .borrow_mut()
            .compose_downs
            .push(manifest.to_path_buf());
        Ok(())
    }

    fn run(&self, spec: &RunSpec) -> Result<String, docker::Error> {
        self.state.borrow_mut().runs.push(spec.clone());
        Ok(String::new())
    }

    fn exec(&self, container: &str, command: &[&str], _shell: bool) -> Result<String, docker::Error> {
        self.state.borrow_mut().execs.push((
            container.to_string(),
            command.iter().map(|word| word.to_string()).collect(),
        ));
        Ok(String::new())
    }

    fn cp(&self, container: &str, src: &str, dst: &str) -> Result<(), docker::Error> {
        self.state.borrow_mut().copies.push((
            container.to_string(),
            src.to_string(),
            dst.to_string(),
        ));
        Ok(())
    }

    fn is_launched(&self, container: &str) -> bool {
        self.state.borrow().launched.contains(container)
    }

    fn is_present(&self, container: &str) -> bool {
        self.is_launched(container)
    }

    fn remove_by_image(&self, image_name: &str) -> Result<usize, docker::Error> {
        self.state.borrow_mut().removed.push(image_name.to_string());
        Ok(0)
    }

    fn get_version(&self, _image: &ImageRef, _package: &str) -> Result<String, docker::Error> {
        Ok(self.state.borrow().version.clone())
    }
}
