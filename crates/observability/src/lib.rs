//! Tracing/logging setup shared by every postline service.

/// Initialize process-wide tracing for `service`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(service: &'static str) {
    tracing::init(service);
}

/// Tracing configuration (filters, output format).
pub mod tracing;
