//! Tracing and logging (shared setup).

pub mod logging;

pub use logging::{LogFormat, LogFormatError};

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    logging::init();
}
