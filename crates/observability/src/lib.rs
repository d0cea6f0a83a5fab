//! Tracing setup shared by binaries and tests of the generation engine.

/// Initialize process-wide tracing with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize compact, test-captured tracing output. Idempotent.
pub fn init_for_tests() {
    tracing::init_for_tests();
}

/// Tracing configuration (filters, formatters).
pub mod tracing;
