//! Diagnostics go to stderr, which the host framework captures into the unit's debug log.
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter, e.g. `contrail_charm=debug`
pub const LOG_ENV: &str = "CONTRAIL_CHARM_LOG";

/// Installs the global subscriber; calling it again is harmless
pub fn initialize_logging(env_var: &str) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(env_var)
        .from_env_lossy();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(true),
        )
        .try_init();
}
