//! Development-time tracing for debugging pipeline runs.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the run's product output.
//!
//! - **Run artifacts (`io/artifacts`)**: code, tests, README, run report and
//!   usage report in the workspace. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset, or to
/// `conductor=info` when `verbose` is set.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=conductor=debug conductor run --task "double a number"
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "conductor=info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
