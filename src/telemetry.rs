//! Tracing bootstrap for binaries and tests embedding the crate.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a global `tracing` subscriber honoring `RUST_LOG`.
///
/// Idempotent; later calls are no-ops, so library consumers and tests can
/// both call it without coordination. Falls back to `info` level when
/// `RUST_LOG` is unset.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .ok();
    });
}
