#![allow(dead_code)]

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Installs a test-output subscriber once per test binary. `RUST_LOG` overrides
/// the default filter.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("tessera=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_test_writer()
            .try_init();
    });
}
