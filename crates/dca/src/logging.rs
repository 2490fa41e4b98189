//! Logging bootstrap for binaries embedding the agent.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `debug` or `dca::perf=info,warn`.
pub const LOG_LEVEL_ENV: &str = "DCA_LOG_LEVEL";

const DEFAULT_FILTER: &str = "info";

/// Builds the filter from `DCA_LOG_LEVEL`, falling back to `info`.
pub fn env_filter() -> EnvFilter {
    filter_from(std::env::var(LOG_LEVEL_ENV).ok().as_deref())
}

fn filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a `fmt` subscriber as the global default.
///
/// Returns `false` if a subscriber was already installed; the existing one
/// stays in place.
pub fn init() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .is_ok()
}
