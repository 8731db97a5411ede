//! Tracing setup for embedders and tests.

use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber once: env-filtered fmt output.
///
/// `DRIFTWIRE_LOG` overrides the default level (e.g.
/// `DRIFTWIRE_LOG=connection=debug,session=debug`).
pub fn init(default_level: &str) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("DRIFTWIRE_LOG")
            .unwrap_or_else(|_| EnvFilter::new(default_level));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    });
}

/// Test processes install a quieter subscriber lazily.
pub fn init_for_tests() {
    init("warn");
}
