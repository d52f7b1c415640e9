//! Logging setup for the conductor binary.
//!
//! Library code only emits `tracing` events; this module installs the
//! subscriber that writes them to `~/.conductor/conductor.log`.
//!
//! Debug mode can be enabled with `--debug` flag or `CONDUCTOR_DEBUG=1` env var.
//! `RUST_LOG` overrides the level filter entirely.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

/// Environment variable that turns on debug logging.
pub const DEBUG_ENV: &str = "CONDUCTOR_DEBUG";

/// Initialize logging with explicit debug mode setting.
///
/// Calling this more than once is harmless; only the first subscriber wins.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false);

    // Truncate file on startup; fall back to stderr when there is no home dir.
    match log_path().and_then(|path| File::create(path).ok()) {
        Some(file) => {
            let _ = builder.with_writer(Mutex::new(file)).try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "conductor=debug,info"
    } else {
        "conductor=info,warn"
    }
}

fn log_path() -> Option<PathBuf> {
    let dir = crate::config::Config::conductor_dir().ok()?;
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir.join("conductor.log"))
}
