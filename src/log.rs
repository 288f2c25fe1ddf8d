//! Structured logging for strata.
//!
//! Log levels:
//! - ERROR: A task failed permanently or the pool ran out of workers
//! - WARN: Recoverable conditions (retries, timeouts, unschedulable tasks)
//! - INFO: Run, layer and task lifecycle
//! - DEBUG: Planning decisions and control-loop detail
//!
//! Debug mode can be enabled with `--debug` flag or `STRATA_DEBUG=1` env var.
//! `RUST_LOG` overrides the level filter when set.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Env var that switches on debug logging.
pub const DEBUG_ENV: &str = "STRATA_DEBUG";

/// Initialize logging to stderr at the default level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(debug_enabled)
        .try_init();
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "strata=debug,info"
    } else {
        "info"
    }
}
