//! Runs whole hooks against in-memory fakes and a temporary filesystem root.
use std::{path::PathBuf, rc::Rc};

use contrail_charm_core::{
    executor::BoxedExecutor,
    retry::RetryPolicy,
    status::{Status, CONTRAIL_STATUS},
    testing::{FakeExecutor, FakeHost, FakeRuntime},
};
use tempfile::TempDir;

use crate::{
    context::Ctx,
    roles::{self, Result, Role},
};

pub struct Harness {
    pub role: Role,
    pub host: Rc<FakeHost>,
    pub runtime: Rc<FakeRuntime>,
    pub executor: Rc<FakeExecutor>,
    dir: TempDir,
}

impl Harness {
    pub fn new(role: Role, unit: &str) -> Self {
        Harness {
            role,
            host: Rc::new(FakeHost::new(unit)),
            runtime: Rc::new(FakeRuntime::new()),
            executor: Rc::new(FakeExecutor::new()),
            dir: tempfile::tempdir().expect("temporary directory"),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("root")
    }

    pub fn context(&self) -> Result<Ctx> {
        let executor: BoxedExecutor = self.executor.clone();
        let mut ctx = Ctx::load(
            self.role,
            self.host.clone(),
            executor,
            self.runtime.clone(),
            Ctx::renderer_for(self.root()).without_ownership(),
            &self.dir.path().join("charm"),
        )?;
        ctx.retry = RetryPolicy::ONCE;
        Ok(ctx)
    }

    /// Runs `hook` like the host would, in a fresh process
    pub fn run(&self, hook: &str) -> Result<bool> {
        let mut ctx = self.context()?;
        roles::run_hook(&mut ctx, hook)
    }

    /// Runs a relation hook on behalf of `remote` on `relation_id`
    pub fn run_relation(&self, hook: &str, relation_id: &str, remote: Option<&str>) -> Result<bool> {
        self.host.set_event(Some(relation_id), remote);
        let result = self.run(hook);
        self.host.set_event(None, None);
        result
    }

    pub fn file(&self, path: &str) -> Option<String> {
        std::fs::read_to_string(self.root().join(path.trim_start_matches('/'))).ok()
    }

    pub fn status(&self) -> Status {
        self.host.status().expect("a status was set")
    }

    /// Makes the status tool report every service of `groups` as active
    pub fn services_active(&self, groups: &[(&str, &[&str])]) {
        let mut output = String::new();
        for (group, services) in groups {
            output.push_str(&format!("== Contrail {group} ==\n"));
            for service in services.iter() {
                output.push_str(&format!("{service}: active\n"));
            }
            output.push('\n');
        }
        self.executor.succeed(&[CONTRAIL_STATUS], &output);
    }
}
