//! Log subscriber for the `redline` binary.
//!
//! Logs always go to stderr; stdout carries command output only.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Filter used when `RUST_LOG` is unset: Redline crates at info (debug when
/// verbose), everything else at warn.
pub fn default_filter(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!("warn,redline_core={level},redline={level}")
}

/// Install the global subscriber. Only the first call in a process wins.
pub fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));
    let base = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let layer = if json { base.json().boxed() } else { base.boxed() };
    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .ok();
}
