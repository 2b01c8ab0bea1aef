use tracing_subscriber::{fmt, EnvFilter};

/// Initialize structured logging with environment filter.
/// Set DXCAP_LOG=debug (or trace, info, warn, error) for verbosity control.
///
/// The layer runs inside the application's process, so output goes to
/// stderr and leaves the application's stdout alone. Both intercepted API
/// surfaces may initialize the layer; repeated calls are ignored.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("DXCAP_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}
