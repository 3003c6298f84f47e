//! Thin wrapper around slog/sloggers so the rest of the stack only imports
//! this module. Long-lived objects take a `Logger` at construction and bind
//! their identifying key/values with `log.new(o!(...))`.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Terminal logger writing to stderr at the given severity.
pub fn term_logger(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);
    builder
        .build()
        .unwrap_or_else(|_| Logger::root(Discard, o!()))
}

/// Logger that swallows everything. Used by tests and as the fallback when
/// no logger is supplied.
pub fn null_logger() -> Logger {
    Logger::root(Discard, o!())
}

/// Builds a logger from a sloggers TOML snippet, e.g.
/// `type = "terminal"\nlevel = "debug"`.
pub fn from_toml(config: &str) -> Result<Logger, crate::status::StatusCode> {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(config)
        .map_err(|_| crate::status::StatusCode::BAD_CONFIGURATION_ERROR)?;
    config
        .build_logger()
        .map_err(|_| crate::status::StatusCode::BAD_CONFIGURATION_ERROR)
}
