//! Console logging for harness runs.
//!
//! The harness only emits `tracing` events; installing a subscriber is left to
//! the test binary. Node log files are owned by the node itself.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{LoggingError, LoggingResult};

/// Initialize console logging with the given level.
///
/// `None` reads the filter from `RUST_LOG`, falling back to INFO.
pub fn init_console_logging(level: Option<LevelFilter>) -> LoggingResult<()> {
    let env_filter = match level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string())),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_thread_ids(false).with_test_writer())
        .try_init()
        .map_err(|e| LoggingError::SubscriberInit(e.to_string()))
}

/// Logging for tests: honours `RUST_LOG` and may be called from every test.
pub fn init_test_logging() {
    // Only the first call in a process installs the subscriber.
    let _ = init_console_logging(None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialization_is_reported() {
        init_test_logging();
        assert!(matches!(
            init_console_logging(Some(LevelFilter::DEBUG)),
            Err(LoggingError::SubscriberInit(_))
        ));
        init_test_logging();
    }
}
