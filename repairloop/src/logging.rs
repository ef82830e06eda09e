//! Diagnostic tracing for `repairloop`.
//!
//! Tracing goes to stderr and is filtered by `REPAIRLOOP_LOG` (or `RUST_LOG`).
//! It is separate from both the progress lines the CLI prints and the per-run
//! JSON log written by [`crate::io::run_log`], which is always produced.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "REPAIRLOOP_LOG";
const DEFAULT_DIRECTIVE: &str = "warn";

/// Install the global subscriber. Calling it twice is harmless.
///
/// ```bash
/// REPAIRLOOP_LOG=repairloop::io::process=debug repairloop run
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}
