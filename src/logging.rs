//! Tracing subscriber setup.
//!
//! Logs always go to stderr: stdout of the fixture server carries protocol
//! frames, and the CLI prints results on stdout.

use std::sync::Once;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Parses a configured level name, falling back to `WARN` for unknown names.
#[must_use]
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    }
}

/// Picks the effective level from CLI verbosity flags and the configured level.
#[must_use]
pub fn level_from_flags(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => parse_level(config_level),
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the global tracing subscriber for a binary.
///
/// `RUST_LOG` directives are honoured on top of `level`.
pub fn init(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Installs a test-friendly subscriber once per process.
///
/// Output goes through the test writer so it is captured per test. Later
/// calls are no-ops, as is a call made after another subscriber was set.
pub fn init_for_tests(level: &str) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::from_default_env().add_directive(parse_level(level).into());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
