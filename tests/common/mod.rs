//! Shared helpers for integration tests that drive the fixture server.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mcp_harness::config::{ServerConfig, TimeoutConfig};
use mcp_harness::lifecycle::LifecycleManager;
use mcp_harness::mcp::{McpClient, ProcessTransport};

/// Request timeout used by tests unless a test overrides it.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period used when closing fixtures.
pub const GRACE: Duration = Duration::from_secs(2);

/// Launch configuration for the fixture server binary built with this crate.
pub fn fixture() -> ServerConfig {
    ServerConfig::new(env!("CARGO_BIN_EXE_mcp-fixture-server"))
}

/// Timeouts short enough for tests.
pub fn test_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        request_ms: 10_000,
        startup_ms: 10_000,
        ready_poll_interval_ms: 10,
        shutdown_grace_ms: 2_000,
    }
}

/// A lifecycle manager for the given fixture configuration.
pub fn manager(server: ServerConfig) -> LifecycleManager {
    mcp_harness::logging::init_for_tests("debug");
    LifecycleManager::new(server, test_timeouts())
}

/// Opens a transport to the fixture without performing the handshake.
pub fn open(server: &ServerConfig) -> McpClient {
    mcp_harness::logging::init_for_tests("debug");
    let transport = ProcessTransport::open(server).expect("fixture should spawn");
    McpClient::new(Arc::new(transport), REQUEST_TIMEOUT)
}

/// Opens a transport to the fixture and completes the handshake.
pub async fn connect(server: &ServerConfig) -> McpClient {
    let client = open(server);
    client.handshake().await.expect("handshake should succeed");
    client
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
