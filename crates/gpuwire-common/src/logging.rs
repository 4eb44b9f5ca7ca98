use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "GPUWIRE_LOG";

/// Initialize structured logging with environment filter.
/// Set GPUWIRE_LOG=debug (or trace, info, warn, error) for verbosity control.
/// Per-target directives work too, e.g. `gpuwire_server=debug,info`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Like [`init_logging`], but leaves an already installed subscriber in
/// place. Safe to call from every test.
pub fn try_init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_test_writer()
        .try_init();
}
