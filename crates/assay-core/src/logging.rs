use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "ASSAY_LOG";
const DEFAULT_DIRECTIVE: &str = "warn";

/// Installs the process-wide fmt subscriber, filtered by `ASSAY_LOG` and
/// writing to stderr. Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
