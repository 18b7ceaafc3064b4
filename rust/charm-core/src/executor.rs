//! Runs external programs on behalf of the hooks.
//!
//! Everything the charms do to the host goes through a program: the host framework's hook
//! tools, the docker CLI, the provisioning CLI and so on. Routing all of them through
//! [`Executor`] keeps the reconcilers testable with a fake.
use std::{
    collections::BTreeMap,
    fmt,
    io::Write,
    process::{Command, Stdio},
    rc::Rc,
};

use snafu::{ResultExt, Snafu};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to start [{command}]"))]
    Start {
        source: std::io::Error,
        command: String,
    },

    #[snafu(display("failed to pass input to [{command}]"))]
    WriteStdin {
        source: std::io::Error,
        command: String,
    },

    #[snafu(display("[{command}] exited with {status}: {stderr}"))]
    Failed {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },
}

/// A single program invocation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Invocation {
            program: program.into(),
            ..Invocation::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Whether this invocation starts with the given program and arguments
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        let mut words =
            std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        prefix.iter().all(|expected| words.next() == Some(*expected))
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Describes an "executor", which runs [`Invocation`]s and returns their standard output.
///
/// - In production, this is a [`HostExecutor`].
/// - Under test, [`crate::testing::FakeExecutor`] records invocations and replays canned output.
pub trait Executor {
    fn execute(&self, invocation: &Invocation) -> Result<String, Error>;
}

pub type BoxedExecutor = Rc<dyn Executor>;

/// Runs programs on the local host, blocking until they exit
#[derive(Clone, Copy, Debug, Default)]
pub struct HostExecutor;

impl HostExecutor {
    pub fn boxed() -> BoxedExecutor {
        Rc::new(HostExecutor)
    }
}

impl Executor for HostExecutor {
    fn execute(&self, invocation: &Invocation) -> Result<String, Error> {
        let command = invocation.to_string();
        tracing::debug!(%command, "running command");

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(&invocation.env)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context(StartSnafu { command: &command })?;

        if let (Some(input), Some(mut stdin)) = (&invocation.stdin, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .context(WriteStdinSnafu { command: &command })?;
        }

        let output = child
            .wait_with_output()
            .context(StartSnafu { command: &command })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return FailedSnafu {
                command,
                status: output.status.to_string(),
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .fail();
        }
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_prefix_matching() {
        let invocation = Invocation::new("docker").args(["pull", "registry/image:tag"]);
        assert!(invocation.starts_with(&["docker"]));
        assert!(invocation.starts_with(&["docker", "pull"]));
        assert!(!invocation.starts_with(&["docker", "push"]));
        assert!(!invocation.starts_with(&["docker", "pull", "registry/image:tag", "extra"]));
        assert_eq!(invocation.to_string(), "docker pull registry/image:tag");
    }

    #[test]
    fn host_executor_reports_failures() {
        let out = HostExecutor
            .execute(&Invocation::new("sh").args(["-c", "echo hello"]))
            .unwrap();
        assert_eq!(out, "hello\n");

        let err = HostExecutor
            .execute(&Invocation::new("sh").args(["-c", "echo oops >&2; exit 3"]))
            .unwrap_err();
        match err {
            Error::Failed { stderr, .. } => assert_eq!(stderr, "oops"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn host_executor_passes_stdin() {
        let out = HostExecutor
            .execute(&Invocation::new("cat").stdin("from stdin"))
            .unwrap();
        assert_eq!(out, "from stdin");
    }
}
