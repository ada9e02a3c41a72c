// Tracing set-up for hosts that do not install their own subscriber.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Directives used when `RUST_LOG` is unset. HTTP internals stay quiet.
pub const DEFAULT_LOG_FILTER: &str = "info,hyper=warn,reqwest=warn";

static TRACING_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the fmt subscriber with [`DEFAULT_LOG_FILTER`].
pub fn init_tracing() -> bool {
    init_tracing_with(DEFAULT_LOG_FILTER)
}

/// Install the fmt subscriber, `RUST_LOG` taking precedence over `default_filter`.
///
/// Returns `true` only for the call that installed it. Later calls, and calls
/// made after the host set its own global subscriber, are no-ops.
pub fn init_tracing_with(default_filter: &str) -> bool {
    if TRACING_INSTALLED.swap(true, Ordering::AcqRel) {
        return false;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed {
        info!(filter = default_filter, "update engine tracing initialized");
    }
    installed
}
