//! Harness configuration.
//!
//! A run is described by one JSON file with four optional sections:
//! `server` (what to launch), `timeouts`, `snapshots` and `logging`.
//! Unknown keys are rejected so typos surface early.
//!
//! # Resolution
//!
//! The file named on the command line wins. Without one the harness reads
//! `config.json` in the per-user directory returned by [`default_config_dir`]
//! (`~/.mcp-harness` on Linux and macOS, `%USERPROFILE%\.mcp-harness` on
//! Windows).
//!
//! After parsing, `MCP_HARNESS_TIMEOUT`, `MCP_HARNESS_LOG_LEVEL` and
//! `MCP_UPDATE_SNAPSHOTS` override the file, then the result is validated.

mod settings;

pub use settings::{
    is_truthy, Config, LoggingConfig, ServerConfig, SnapshotConfig, TimeoutConfig, ENV_LOG_LEVEL,
    ENV_TIMEOUT, ENV_UPDATE_SNAPSHOTS,
};

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

const CONFIG_DIR_NAME: &str = ".mcp-harness";
const CONFIG_FILE_NAME: &str = "config.json";

/// Per-user configuration directory, if a home directory is known.
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR_NAME))
}

/// Per-user configuration file, if a home directory is known.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Parses configuration text, applies environment overrides and validates.
///
/// `path` is only used in error messages.
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] for malformed JSON or unknown keys, and
/// [`ConfigError::ValidationError`] for a bad override or an invalid value.
pub fn parse_config(contents: &str, path: &Path) -> Result<Config, ConfigError> {
    let mut config: Config =
        serde_json::from_str(contents).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Reads the configuration file at `path`, or at [`default_config_path`].
///
/// # Errors
///
/// Returns [`ConfigError::NotFound`] if there is no file, [`ConfigError::ReadError`]
/// if it cannot be read, and the errors of [`parse_config`].
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path().ok_or_else(|| ConfigError::NotFound {
            path: PathBuf::from(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME),
        })?,
    };

    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(ConfigError::NotFound { path }),
        Err(source) => return Err(ConfigError::ReadError { path, source }),
    };

    let config = parse_config(&contents, &path)?;
    tracing::debug!(
        path = %path.display(),
        server = %config.server.display_command(),
        "loaded configuration"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_paths_live_under_home() {
        let dir = default_config_dir().unwrap();
        assert!(dir.ends_with(CONFIG_DIR_NAME));
        assert_eq!(default_config_path().unwrap(), dir.join("config.json"));
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { ref path, .. } if path == file.path()));
    }

    #[test]
    fn load_valid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"server": {"command": "srv", "args": ["--stdio"]}}"#).unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.server.args, vec!["--stdio".to_string()]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = parse_config(
            r#"{"server": {"command": "srv", "argz": []}}"#,
            Path::new("inline.json"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn empty_command_fails_validation() {
        let err = parse_config(r#"{"server": {"command": "  "}}"#, Path::new("inline.json"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }
}
