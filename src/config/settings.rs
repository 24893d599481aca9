//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// How to launch the server under test.
    #[serde(default)]
    pub server: ServerConfig,

    /// Deadlines and polling intervals.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Snapshot settings.
    #[serde(default)]
    pub snapshots: SnapshotConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Creates a configuration for the given server command with default settings.
    #[must_use]
    pub fn for_server(server: ServerConfig) -> Self {
        Self {
            server,
            ..Self::default()
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.command.trim().is_empty() {
            return Err(ConfigError::ValidationError {
                message: "server.command must not be empty".to_string(),
            });
        }

        let timeouts = [
            ("request_ms", self.timeouts.request_ms),
            ("startup_ms", self.timeouts.startup_ms),
            ("ready_poll_interval_ms", self.timeouts.ready_poll_interval_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::ValidationError {
                    message: format!("timeouts.{name} must be greater than zero"),
                });
            }
        }

        let level = self.logging.level.to_lowercase();
        if !["trace", "debug", "info", "warn", "error"].contains(&level.as_str()) {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                ),
            });
        }
        Ok(())
    }

    /// Applies environment overrides.
    ///
    /// `lookup` resolves a variable name; pass `|k| std::env::var(k).ok()` for
    /// the process environment. Recognised variables:
    ///
    /// - `MCP_HARNESS_TIMEOUT`: request timeout in seconds (float)
    /// - `MCP_HARNESS_LOG_LEVEL`: log level
    /// - `MCP_UPDATE_SNAPSHOTS`: `1`, `true` or `yes` enables update mode
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an unusable value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_TIMEOUT) {
            let seconds: f64 = raw.trim().parse().map_err(|_| ConfigError::ValidationError {
                message: format!("{ENV_TIMEOUT} must be a number of seconds, got '{raw}'"),
            })?;
            if !seconds.is_finite() || seconds <= 0.0 {
                return Err(ConfigError::ValidationError {
                    message: format!("{ENV_TIMEOUT} must be positive, got '{raw}'"),
                });
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let millis = (seconds * 1000.0).round().max(1.0) as u64;
            self.timeouts.request_ms = millis;
        }

        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level.trim().to_string();
        }

        if let Some(flag) = lookup(ENV_UPDATE_SNAPSHOTS) {
            self.snapshots.update = is_truthy(&flag);
        }
        Ok(())
    }
}

/// Request timeout override, in seconds.
pub const ENV_TIMEOUT: &str = "MCP_HARNESS_TIMEOUT";

/// Log level override.
pub const ENV_LOG_LEVEL: &str = "MCP_HARNESS_LOG_LEVEL";

/// Snapshot update-mode switch.
pub const ENV_UPDATE_SNAPSHOTS: &str = "MCP_UPDATE_SNAPSHOTS";

/// Interprets `1`, `true` and `yes` (any case) as enabled.
#[must_use]
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// How to launch the server under test.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Executable to run.
    #[serde(default)]
    pub command: String,

    /// Arguments, in order.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables for the child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Overlay `env` onto the inherited environment (`true`) or replace it (`false`).
    #[serde(default = "default_true")]
    pub inherit_env: bool,

    /// Working directory of the child.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            inherit_env: default_true(),
            cwd: None,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration for `command` with no arguments.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Chooses between overlaying and replacing the inherited environment.
    #[must_use]
    pub const fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    /// Command line for logs and error messages.
    #[must_use]
    pub fn display_command(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

const fn default_true() -> bool {
    true
}

/// Deadlines and polling intervals, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Per-request timeout.
    #[serde(default = "default_request_ms")]
    pub request_ms: u64,

    /// Deadline for spawn plus handshake.
    #[serde(default = "default_startup_ms")]
    pub startup_ms: u64,

    /// Readiness polling interval.
    #[serde(default = "default_ready_poll_interval_ms")]
    pub ready_poll_interval_ms: u64,

    /// Grace period between closing stdin and killing the process.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: default_request_ms(),
            startup_ms: default_startup_ms(),
            ready_poll_interval_ms: default_ready_poll_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Per-request timeout.
    #[must_use]
    pub const fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    /// Startup (spawn plus handshake) deadline.
    #[must_use]
    pub const fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }

    /// Readiness polling interval.
    #[must_use]
    pub const fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    /// Shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

const fn default_request_ms() -> u64 {
    30_000
}

const fn default_startup_ms() -> u64 {
    30_000
}

const fn default_ready_poll_interval_ms() -> u64 {
    50
}

const fn default_shutdown_grace_ms() -> u64 {
    5_000
}

/// Snapshot store settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotConfig {
    /// Root directory for snapshot artefacts.
    #[serde(default = "default_snapshot_dir")]
    pub dir: PathBuf,

    /// Record instead of compare.
    #[serde(default)]
    pub update: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: default_snapshot_dir(),
            update: false,
        }
    }
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("tests/snapshots")
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        }
    }

    #[test]
    fn parse_minimal_config() {
        let json = r#"{"server": {"command": "my-server"}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.server.inherit_env);
        assert_eq!(config.timeouts, TimeoutConfig::default());
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "_comment": "Test config",
            "server": {
                "command": "python",
                "args": ["-m", "my_server"],
                "env": {"DEBUG": "1"},
                "inherit_env": false,
                "cwd": "/srv"
            },
            "timeouts": {
                "request_ms": 1500,
                "startup_ms": 10000,
                "ready_poll_interval_ms": 20,
                "shutdown_grace_ms": 250
            },
            "snapshots": {
                "dir": "snaps",
                "update": true
            },
            "logging": {
                "level": "debug"
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.display_command(), "python -m my_server");
        assert_eq!(config.server.env["DEBUG"], "1");
        assert!(!config.server.inherit_env);
        assert_eq!(config.server.cwd, Some(PathBuf::from("/srv")));
        assert_eq!(config.timeouts.request(), Duration::from_millis(1500));
        assert_eq!(config.timeouts.shutdown_grace(), Duration::from_millis(250));
        assert_eq!(config.snapshots.dir, PathBuf::from("snaps"));
        assert!(config.snapshots.update);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn timeout_defaults() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.request(), Duration::from_secs(30));
        assert_eq!(timeouts.startup(), Duration::from_secs(30));
        assert_eq!(timeouts.ready_poll_interval(), Duration::from_millis(50));
        assert_eq!(timeouts.shutdown_grace(), Duration::from_secs(5));
    }

    #[test]
    fn snapshot_and_logging_defaults() {
        assert_eq!(SnapshotConfig::default().dir, PathBuf::from("tests/snapshots"));
        assert!(!SnapshotConfig::default().update);
        assert_eq!(LoggingConfig::default().level, "warn");
    }

    #[test]
    fn reject_empty_command() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_zero_timeout() {
        let json = r#"{"server": {"command": "x"}, "timeouts": {"request_ms": 0}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("request_ms"));
    }

    #[test]
    fn reject_invalid_log_level() {
        let json = r#"{"server": {"command": "x"}, "logging": {"level": "loud"}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_unknown_fields() {
        let json = r#"{
            "unknown_field": "value"
        }"#;

        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::for_server(ServerConfig::new("srv"));
        config
            .apply_overrides(env(&[
                (ENV_TIMEOUT, "2.5"),
                (ENV_LOG_LEVEL, "DEBUG"),
                (ENV_UPDATE_SNAPSHOTS, "yes"),
            ]))
            .unwrap();

        assert_eq!(config.timeouts.request_ms, 2500);
        assert_eq!(config.logging.level, "DEBUG");
        assert!(config.snapshots.update);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_override_rejects_bad_timeout() {
        let mut config = Config::default();
        assert!(config.apply_overrides(env(&[(ENV_TIMEOUT, "soon")])).is_err());
        assert!(config.apply_overrides(env(&[(ENV_TIMEOUT, "-1")])).is_err());
    }

    #[test]
    fn truthy_values() {
        for value in ["1", "true", "TRUE", "yes", " Yes "] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["0", "false", "no", ""] {
            assert!(!is_truthy(value), "{value}");
        }
    }

    #[test]
    fn server_builder() {
        let server = ServerConfig::new("srv")
            .arg("--flag")
            .env("KEY", "value")
            .inherit_env(false);
        assert_eq!(server.display_command(), "srv --flag");
        assert_eq!(server.env["KEY"], "value");
        assert!(!server.inherit_env);
    }
}
