//! Error types for mcp-harness.
//!
//! Two families live here:
//!
//! - [`ConfigError`] for loading and validating the configuration file.
//! - [`HarnessError`] for everything that can go wrong while driving a server
//!   under test: process spawn, transport, protocol, lifecycle and snapshots.
//!
//! Every failure kind is a distinct variant so tests can assert on transport
//! health and on application-level failures independently.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::lifecycle::ProcessState;

/// Result type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// What kind of server-side object a [`HarnessError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingKind {
    /// A tool name.
    Tool,
    /// A resource URI.
    Resource,
}

impl std::fmt::Display for MissingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tool => write!(f, "tool"),
            Self::Resource => write!(f, "resource"),
        }
    }
}

/// Errors raised while driving a server under test.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// The server executable could not be started.
    #[error("failed to spawn server '{command}'")]
    Spawn {
        /// Command that was executed.
        command: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A request did not receive its response before the deadline.
    #[error("request '{method}' (id {id}) timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// Method of the timed-out request.
        method: String,
        /// Correlation id of the timed-out request.
        id: i64,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The transport closed while a request was outstanding or before it was sent.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Why the connection closed.
        reason: String,
    },

    /// The server broke the wire protocol (malformed frame, unmatched id, bad reply shape).
    #[error("protocol error: {detail}")]
    Protocol {
        /// Description of the violation.
        detail: String,
    },

    /// A referenced tool or resource does not exist on the server.
    #[error("{kind} not found: '{name}'")]
    NotFound {
        /// Whether a tool or a resource was missing.
        kind: MissingKind,
        /// Tool name or resource URI.
        name: String,
    },

    /// The server ran the tool and reported an application-level failure.
    #[error("tool '{tool}' reported an error: {message}")]
    ToolExecution {
        /// Tool that failed.
        tool: String,
        /// Text reported by the server.
        message: String,
    },

    /// The server answered with a JSON-RPC error not covered by a more specific variant.
    #[error("server error [{code}] for '{method}': {message}")]
    Server {
        /// Method that was rejected.
        method: String,
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
        /// Optional error payload.
        data: Option<Value>,
    },

    /// The server did not become ready before the deadline.
    #[error("server not ready after {}ms (state: {state})", timeout.as_millis())]
    ReadinessTimeout {
        /// The deadline that elapsed.
        timeout: Duration,
        /// State observed when the deadline passed.
        state: ProcessState,
    },

    /// A client was requested while the server was not ready.
    #[error("server is not ready (state: {state})")]
    NotReady {
        /// Current lifecycle state.
        state: ProcessState,
    },

    /// A lifecycle operation is not valid in the current state.
    #[error("cannot {operation} while server is {state}")]
    InvalidState {
        /// Attempted operation.
        operation: &'static str,
        /// Current lifecycle state.
        state: ProcessState,
    },

    /// A protocol operation was issued before the handshake completed.
    #[error("handshake has not been performed on this connection")]
    HandshakeRequired,

    /// The handshake failed; the connection is unusable until reopened.
    #[error("handshake failed: {reason}")]
    HandshakeFailed {
        /// Why the handshake failed.
        reason: String,
    },

    /// Tool arguments do not satisfy the declared input schema.
    #[error("invalid arguments for '{tool}': {}", errors.join("; "))]
    InvalidArguments {
        /// Tool whose schema was checked.
        tool: String,
        /// Every validation message.
        errors: Vec<String>,
    },

    /// No snapshot is stored and update mode is off.
    #[error(
        "snapshot '{name}' does not exist at {}; rerun with MCP_UPDATE_SNAPSHOTS=1 to record it",
        path.display()
    )]
    SnapshotMissing {
        /// Qualified snapshot name.
        name: String,
        /// Where the artefact was expected.
        path: PathBuf,
    },

    /// The stored snapshot differs from the given value.
    #[error(
        "snapshot '{name}' does not match {}\n--- stored\n{expected}\n+++ actual\n{actual}",
        path.display()
    )]
    SnapshotMismatch {
        /// Qualified snapshot name.
        name: String,
        /// Artefact path.
        path: PathBuf,
        /// Stored value, rendered.
        expected: String,
        /// Given value, rendered.
        actual: String,
    },

    /// A snapshot label or test identity cannot be mapped to a file name.
    #[error("invalid snapshot name '{name}': {reason}")]
    InvalidSnapshotName {
        /// The offending name.
        name: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// Reading or writing a snapshot artefact failed.
    #[error("snapshot I/O failed for {}", path.display())]
    SnapshotIo {
        /// Artefact path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A value could not be converted to or from JSON.
    #[error("serialisation failed: {context}")]
    Serialization {
        /// What was being converted.
        context: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

impl HarnessError {
    /// Returns `true` for failures of the process or pipe rather than of the application.
    #[must_use]
    pub const fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. }
                | Self::Timeout { .. }
                | Self::ConnectionClosed { .. }
                | Self::Protocol { .. }
        )
    }

    /// Returns `true` for failures the server reported deliberately.
    #[must_use]
    pub const fn is_application_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::ToolExecution { .. } | Self::Server { .. }
        )
    }

    pub(crate) fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol {
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let error = ConfigError::NotFound {
            path: PathBuf::from("/path/to/config.json"),
        };
        let msg = error.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("config.json"));
    }

    #[test]
    fn validation_error_display() {
        let error = ConfigError::ValidationError {
            message: "invalid setting".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("invalid setting"));
    }

    #[test]
    fn timeout_display_includes_method_and_deadline() {
        let error = HarnessError::Timeout {
            method: "tools/call".to_string(),
            id: 7,
            timeout: Duration::from_millis(250),
        };
        let msg = error.to_string();
        assert!(msg.contains("tools/call"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn not_found_display_names_kind() {
        let error = HarnessError::NotFound {
            kind: MissingKind::Tool,
            name: "missing_tool".to_string(),
        };
        assert_eq!(error.to_string(), "tool not found: 'missing_tool'");
    }

    #[test]
    fn transport_and_application_failures_are_disjoint() {
        let transport = HarnessError::closed("server exited");
        let application = HarnessError::ToolExecution {
            tool: "fail".to_string(),
            message: "boom".to_string(),
        };

        assert!(transport.is_transport_failure());
        assert!(!transport.is_application_error());
        assert!(application.is_application_error());
        assert!(!application.is_transport_failure());
    }

    #[test]
    fn mismatch_display_shows_both_values() {
        let error = HarnessError::SnapshotMismatch {
            name: "suite::test/tools".to_string(),
            path: PathBuf::from("snapshots/suite/test/tools.json"),
            expected: "[\"add\"]".to_string(),
            actual: "[\"add\", \"echo\"]".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("--- stored\n[\"add\"]"));
        assert!(msg.contains("+++ actual\n[\"add\", \"echo\"]"));
    }
}
