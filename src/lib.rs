//! mcp-harness: test harness for MCP servers spoken to over stdio.
//!
//! The harness launches a server process, speaks JSON-RPC to it and lets
//! tests assert on its behaviour and on recorded outputs.
//!
//! # Architecture
//!
//! - **Frame codec**: newline-delimited JSON-RPC framing
//! - **Process transport**: child process, request correlation, timeouts
//! - **Protocol client**: handshake, tools, resources
//! - **Lifecycle manager**: start/stop/restart and crash detection
//! - **Snapshot store**: recorded values compared across runs
//!
//! # Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Error types
//! - [`lifecycle`]: Server process state machine
//! - [`logging`]: Tracing subscriber setup
//! - [`mcp`]: Protocol, transport, client and the fixture server
//! - [`snapshot`]: Snapshot store
//!
//! # Example
//!
//! ```no_run
//! use mcp_harness::config::{Config, ServerConfig};
//! use mcp_harness::lifecycle::LifecycleManager;
//!
//! # async fn demo() -> mcp_harness::error::HarnessResult<()> {
//! let config = Config::for_server(ServerConfig::new("my-mcp-server"));
//! let manager = LifecycleManager::from_config(&config);
//! manager.start().await?;
//!
//! let client = manager.client()?;
//! let result = client.call_tool("add", serde_json::json!({"a": 2, "b": 3})).await?;
//! assert_eq!(result.text(), "5");
//!
//! manager.stop(config.timeouts.shutdown_grace()).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod mcp;
pub mod snapshot;

pub use error::{HarnessError, HarnessResult};
pub use lifecycle::{LifecycleManager, ProcessState};
pub use mcp::McpClient;
pub use snapshot::{SnapshotMode, SnapshotStore};
