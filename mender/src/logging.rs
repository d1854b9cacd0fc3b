//! Diagnostics via `tracing`.
//!
//! Logs go to stderr and are never persisted. Cycle reports under
//! `.mender/cycles/` and the state record are written regardless of the
//! filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset, by number of `-v` flags.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "mender=debug,info",
        _ => "mender=trace,debug",
    }
}

/// Install the stderr subscriber. `RUST_LOG` wins over `verbosity`.
///
/// ```bash
/// RUST_LOG=mender::repair=debug mender run
/// mender -vv run --mode continuous
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
