//! Tracing/logging initialization.
//!
//! Filters come from `RUST_LOG`; job lifecycle events are logged at `debug`,
//! so `RUST_LOG=forgegen_jobs=debug` shows every schedule/start/finish.

use tracing_subscriber::EnvFilter;

/// Default directive when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    // JSON logs + timestamps, configurable via RUST_LOG.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or(DEFAULT_FILTER))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}

/// Test variant: human-readable lines routed through the test harness capture,
/// quiet unless `RUST_LOG` asks for more.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or("warn"))
        .compact()
        .with_test_writer()
        .with_thread_names(true)
        .try_init();
}
