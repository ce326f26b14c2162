//! Tracing setup for the harness binary.
//!
//! Lane, service and run identifiers are attached as structured fields, so
//! the JSON output can be filtered per lane in CI log viewers.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Pick the default verbosity from CLI flags.
pub fn level_for(verbose: bool, quiet: bool) -> Level {
    match (verbose, quiet) {
        (true, _) => Level::DEBUG,
        (false, true) => Level::WARN,
        (false, false) => Level::INFO,
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level` when set. Logs go to stderr so that
/// `partition --json` and `scan` output on stdout stays machine-readable.
/// Only the first call in a process has any effect.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    if json {
        registry.with(layer.json()).try_init().ok();
    } else {
        registry.with(layer).try_init().ok();
    }
}
