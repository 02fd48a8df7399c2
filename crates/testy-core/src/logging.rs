//! Tracing bootstrap for test binaries.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install a fmt subscriber that writes through the test harness.
///
/// `RUST_LOG` wins over the configured level. Safe to call from every test:
/// only the first call installs the subscriber.
pub fn init_test_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer();

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if installed.is_ok() {
        tracing::debug!(level = %config.level, "Test logging initialized");
    }
}
