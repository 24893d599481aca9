//! Integration tests for the lifecycle manager against the fixture server.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{eventually, fixture, manager, test_timeouts, GRACE};
use mcp_harness::config::{Config, TimeoutConfig};
use mcp_harness::error::HarnessError;
use mcp_harness::lifecycle::{LifecycleManager, ProcessState};

#[tokio::test]
async fn test_start_and_stop() {
    let manager = manager(fixture());
    assert_eq!(manager.state(), ProcessState::NotStarted);

    manager.start().await.unwrap();
    assert_eq!(manager.state(), ProcessState::Ready);

    let client = manager.client().unwrap();
    assert_eq!(
        client.server_info().map(|info| info.name).as_deref(),
        Some("mcp-fixture-server")
    );
    client.ping().await.unwrap();

    let exit = manager.stop(GRACE).await.unwrap();
    assert!(exit.requested);
    assert_eq!(manager.state(), ProcessState::Stopped);
    assert!(matches!(
        manager.client(),
        Err(HarnessError::NotReady {
            state: ProcessState::Stopped
        })
    ));

    // Idempotent.
    assert!(manager.stop(GRACE).await.is_none());
    assert_eq!(manager.state(), ProcessState::Stopped);
}

#[tokio::test]
async fn test_start_from_config() {
    let mut config = Config::for_server(fixture());
    config.timeouts = test_timeouts();
    let manager = LifecycleManager::from_config(&config);

    manager.start().await.unwrap();
    assert_eq!(manager.timeouts(), &test_timeouts());
    assert_eq!(manager.server_config(), &config.server);
    manager.stop(config.timeouts.shutdown_grace()).await;
}

#[tokio::test]
async fn test_start_twice_is_invalid() {
    let manager = manager(fixture());
    manager.start().await.unwrap();

    let err = manager.start().await.unwrap_err();
    assert!(matches!(
        err,
        HarnessError::InvalidState {
            operation: "start",
            state: ProcessState::Ready
        }
    ));
    // The running server is untouched.
    manager.client().unwrap().ping().await.unwrap();
    manager.stop(GRACE).await;
}

#[tokio::test]
async fn test_stop_fails_pending_calls() {
    let manager = manager(fixture());
    manager.start().await.unwrap();
    let client = manager.client().unwrap();

    let (call, exit) = tokio::join!(client.call_tool("sleep", json!({"ms": 10_000})), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.stop(GRACE).await
    });

    assert!(matches!(
        call.unwrap_err(),
        HarnessError::ConnectionClosed { .. }
    ));
    assert!(exit.is_some_and(|exit| exit.requested));
    assert_eq!(manager.state(), ProcessState::Stopped);
}

#[tokio::test]
async fn test_restart() {
    let manager = manager(fixture());
    manager.start().await.unwrap();
    let before = manager.client().unwrap();
    let tools_before = before.list_tools().await.unwrap();
    let pid_before = before.transport().pid();

    let (pending, restarted) =
        tokio::join!(before.call_tool("sleep", json!({"ms": 10_000})), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            manager.restart().await
        });
    restarted.unwrap();
    assert!(matches!(
        pending.unwrap_err(),
        HarnessError::ConnectionClosed { .. }
    ));

    assert_eq!(manager.state(), ProcessState::Ready);
    assert_eq!(manager.restart_count(), 1);

    let after = manager.client().unwrap();
    assert_ne!(after.transport().pid(), pid_before);
    assert_eq!(after.list_tools().await.unwrap(), tools_before);

    // The old client is bound to the closed transport.
    assert!(matches!(
        before.ping().await.unwrap_err(),
        HarnessError::ConnectionClosed { .. }
    ));
    manager.stop(GRACE).await;
}

#[tokio::test]
async fn test_restart_from_stopped() {
    let manager = manager(fixture());
    manager.start().await.unwrap();
    manager.stop(GRACE).await;

    manager.restart().await.unwrap();
    assert_eq!(manager.state(), ProcessState::Ready);
    assert_eq!(manager.restart_count(), 1);
    manager.stop(GRACE).await;
}

#[tokio::test]
async fn test_crash_is_detected() {
    let manager = manager(fixture());
    manager.start().await.unwrap();
    let client = manager.client().unwrap();

    let err = client
        .call_tool("crash", json!({"code": 7}))
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::ConnectionClosed { .. }));

    let crashed = eventually(Duration::from_secs(5), || {
        manager.state() == ProcessState::Crashed
    })
    .await;
    assert!(crashed, "state: {}", manager.state());

    // Fails fast instead of waiting for a timeout.
    let err = client.ping().await.unwrap_err();
    assert!(matches!(
        err,
        HarnessError::ConnectionClosed { ref reason } if reason.contains("crashed")
    ));
    assert!(matches!(
        manager.client(),
        Err(HarnessError::NotReady {
            state: ProcessState::Crashed
        })
    ));

    // A crashed server can be started again.
    manager.start().await.unwrap();
    manager.client().unwrap().ping().await.unwrap();
    manager.stop(GRACE).await;
}

#[tokio::test]
async fn test_startup_timeout_crashes() {
    let manager = LifecycleManager::new(
        fixture().arg("--startup-delay-ms").arg("2000"),
        TimeoutConfig {
            startup_ms: 100,
            ..test_timeouts()
        },
    );

    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, HarnessError::Timeout { ref method, .. } if method == "initialize"));
    assert_eq!(manager.state(), ProcessState::Crashed);
    assert!(manager.client().is_err());
}

#[tokio::test]
async fn test_wait_for_ready_during_slow_startup() {
    let manager = manager(fixture().arg("--startup-delay-ms").arg("300"));

    let (started, ready) = tokio::join!(
        manager.start(),
        manager.wait_for_ready(Duration::from_secs(10))
    );
    started.unwrap();
    ready.unwrap();
    assert_eq!(manager.state(), ProcessState::Ready);

    // Already ready: returns on the first poll.
    manager.wait_for_ready(Duration::ZERO).await.unwrap();
    manager.stop(GRACE).await;
}

#[tokio::test]
async fn test_wait_for_ready_without_deadline() {
    let manager = manager(fixture().arg("--startup-delay-ms").arg("200"));

    let (started, ready) = tokio::join!(manager.start(), manager.wait_for_ready(Duration::MAX));
    started.unwrap();
    ready.unwrap();
    assert_eq!(manager.state(), ProcessState::Ready);
    manager.stop(GRACE).await;
}

#[tokio::test]
async fn test_readiness_timeout_leaves_process_running() {
    let manager = manager(fixture().arg("--startup-delay-ms").arg("500"));

    let (started, ready) = tokio::join!(manager.start(), async {
        // Let start() move the state to Starting first.
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.wait_for_ready(Duration::from_millis(100)).await
    });

    assert!(matches!(
        ready.unwrap_err(),
        HarnessError::ReadinessTimeout {
            state: ProcessState::Starting,
            ..
        }
    ));
    started.unwrap();
    assert_eq!(manager.state(), ProcessState::Ready);
    manager.stop(GRACE).await;
}

#[tokio::test]
async fn test_state_transitions_are_observable() {
    let manager = manager(fixture());
    let mut states = manager.subscribe();

    let observer = async {
        let mut seen = vec![*states.borrow_and_update()];
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            seen.push(state);
            if state == ProcessState::Stopped {
                break;
            }
        }
        seen
    };
    let driver = async {
        manager.start().await.unwrap();
        manager.client().unwrap().ping().await.unwrap();
        manager.stop(GRACE).await;
    };

    let (seen, ()) = tokio::join!(observer, driver);
    assert_eq!(seen.first(), Some(&ProcessState::NotStarted));
    assert_eq!(seen.last(), Some(&ProcessState::Stopped));
    assert!(seen.contains(&ProcessState::Ready));
}
