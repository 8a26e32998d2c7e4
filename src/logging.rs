use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "RESULTSD_LOG";

/// Logs go to stderr; stdout is reserved for protocol responses.
///
/// Filter comes from `RESULTSD_LOG`, then `RUST_LOG`, default `info`.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .try_init();
}
