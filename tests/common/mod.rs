//! Shared test setup.

use std::sync::Once;

static INIT: Once = Once::new();

/// Routes `tracing` diagnostics to the test writer so failures come with
/// the framework's own logs. Filter via `RUST_LOG` as usual.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
