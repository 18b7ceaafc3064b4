use std::{
    path::{Path, PathBuf},
    rc::Rc,
};

use clap::{crate_description, crate_version, Parser, Subcommand};
use contrail_charm_core::{
    docker::Docker,
    executor::HostExecutor,
    hookenv::JujuHookTools,
    logging::{initialize_logging, LOG_ENV},
    nrpe,
};

use crate::{context::Ctx, roles::Role};

mod context;
mod roles;
mod templates;

#[cfg(test)]
mod harness;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET_PLATFORM: Option<&str> = option_env!("TARGET");
}

const BINARY_NAME: &str = "contrail-charm";

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Handles a hook of the unit's role
    Hook {
        #[clap(long, env = "CONTRAIL_CHARM_ROLE")]
        role: Role,

        /// Defaults to the name the binary was invoked as
        #[clap(long, env = "JUJU_HOOK_NAME")]
        hook: Option<String>,

        /// Prefix for every file the role writes
        #[clap(long, env = "CONTRAIL_CHARM_ROOT", default_value = "/")]
        root: PathBuf,

        #[clap(long, env = "JUJU_CHARM_DIR")]
        charm_dir: PathBuf,
    },

    /// Reports the health of a workload module as a Nagios plugin
    CheckStatus {
        #[clap(long)]
        module: String,
    },
}

/// Name of the file the binary was started from; hooks are symlinks named after the hook
fn invoked_as() -> Option<String> {
    let argv0 = std::env::args_os().next()?;
    Some(Path::new(&argv0).file_name()?.to_string_lossy().into_owned())
}

fn main() -> anyhow::Result<()> {
    let opts = match invoked_as() {
        Some(name) if name != BINARY_NAME => {
            Opts::parse_from([BINARY_NAME, "hook", "--hook", name.as_str()])
        }
        _ => Opts::parse(),
    };
    initialize_logging(LOG_ENV);

    match opts.cmd {
        Command::Hook {
            role,
            hook,
            root,
            charm_dir,
        } => {
            tracing::info!(
                description = crate_description!(),
                version = crate_version!(),
                git = built_info::GIT_VERSION.unwrap_or("unknown"),
                target = built_info::TARGET_PLATFORM.unwrap_or("unknown target"),
                built = built_info::BUILT_TIME_UTC,
                rustc = built_info::RUSTC_VERSION,
                "starting"
            );
            let Some(hook) = hook.or_else(invoked_as) else {
                anyhow::bail!("no hook name given");
            };
            let executor = HostExecutor::boxed();
            let env = Rc::new(JujuHookTools::from_env(executor.clone())?);
            let runtime = Rc::new(Docker::new(executor.clone(), &root));
            let mut ctx = Ctx::load(
                role,
                env,
                executor,
                runtime,
                Ctx::renderer_for(&root),
                &charm_dir,
            )?;

            tracing::info!(%role, %hook, "running hook");
            match roles::run_hook(&mut ctx, &hook) {
                Ok(true) => {}
                Ok(false) => tracing::debug!(%role, %hook, "no handler for hook"),
                Err(error) => {
                    tracing::error!(
                        %role,
                        %hook,
                        category = error.category(),
                        error = &error as &dyn std::error::Error,
                        "hook failed"
                    );
                    return Err(error.into());
                }
            }
        }
        Command::CheckStatus { module } => {
            let Some(role) = Role::for_module(&module) else {
                println!("{}: unknown module {module}", nrpe::NagiosState::Critical);
                std::process::exit(nrpe::NagiosState::Critical.exit_code());
            };
            let executor = HostExecutor::boxed();
            let (state, message) =
                nrpe::check_status(&executor, &module, role.profile().services);
            println!("{state}: {message}");
            std::process::exit(state.exit_code());
        }
    }
    Ok(())
}
