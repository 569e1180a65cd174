//! Logging setup

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;

/// Error returned when a global subscriber is already installed
pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(config.thread_ids)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init()
}
