//! Structured logging plumbing shared by all crates in the workspace.
//!
//! Everything funnels through `slog`. Library structs hold a `Logger` handle
//! and never decide themselves where records end up; binaries build the root
//! logger once (from a TOML snippet or file) and hand children down.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Fallback configuration used when no logging config is supplied.
const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Build a root logger from a TOML configuration string.
///
/// The accepted schema is the `sloggers` `LoggerConfig` format, so output
/// type, level and destination can all be changed without a recompile.
pub fn from_toml_str(toml: &str) -> Result<Logger, String> {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).map_err(|err| err.to_string())?;

    config.build_logger().map_err(|err| err.to_string())
}

/// Build a root logger from a TOML configuration file on disk.
pub fn from_toml_file(path: &str) -> Result<Logger, String> {
    let config: LoggerConfig =
        serdeconv::from_toml_file(path).map_err(|err| err.to_string())?;

    config.build_logger().map_err(|err| err.to_string())
}

/// Build the default terminal logger (debug level, stderr).
pub fn init() -> Logger {
    from_toml_str(DEFAULT_CONFIG).expect("Default logging config must be valid")
}

/// A logger that swallows everything. Handy default for library structs.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
