use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Default filter applied when `RUST_LOG` is not set.
const DEFAULT_DIRECTIVES: &str = "celoe_etl=info,celoe_runner=info,sqlx=warn";

static TEST_TRACING: Once = Once::new();

/// Initializes the global tracing subscriber for a binary.
///
/// Reads directives from `RUST_LOG`, falling back to [`DEFAULT_DIRECTIVES`].
/// Panics if a global subscriber is already installed, which indicates a
/// double initialization bug in the caller.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Initializes tracing for tests.
///
/// Safe to call from every test; only the first call installs the subscriber.
/// Output is captured by the test harness.
pub fn init_test_tracing() {
    TEST_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("celoe_etl=debug"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
