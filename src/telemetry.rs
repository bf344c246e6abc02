// Logging setup
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding the filter directives, e.g. `PIM_LOG=pim_core=debug`.
pub const LOG_ENV: &str = "PIM_LOG";

/// Install a fmt subscriber filtered by `PIM_LOG` (default `info`).
/// Safe to call more than once; only the first call installs anything.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_names(true))
        .try_init();
    if let Err(err) = result {
        tracing::debug!("logging already initialized for this process: {}", err);
    }
}
