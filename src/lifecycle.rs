//! Lifecycle management for a server under test.
//!
//! ```text
//! NotStarted ──start──▶ Starting ──handshake ok──▶ Ready ──stop──▶ Stopping ──▶ Stopped
//!                          │                         │
//!                          └──── failure / exit ─────┴──────────▶ Crashed
//! ```
//!
//! The [`ProcessState`] lives in a `watch` channel owned by the manager.
//! Transitions are its only writes; clients and observers hold receivers.
//! A monitor task per session watches the process exit and moves the state to
//! `Crashed` as soon as an unrequested exit is published, so client calls fail
//! fast instead of hanging on a dead pipe.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{Config, ServerConfig, TimeoutConfig};
use crate::error::{HarnessError, HarnessResult};
use crate::mcp::client::McpClient;
use crate::mcp::transport::{ProcessExit, ProcessTransport};

/// Health of the managed server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    /// `start()` has not been called.
    NotStarted,
    /// Process spawned, handshake in progress.
    Starting,
    /// Handshake complete; requests may be issued.
    Ready,
    /// Shutdown in progress.
    Stopping,
    /// Process has exited after a requested stop.
    Stopped,
    /// Startup failed or the process exited unexpectedly.
    Crashed,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// One launched process and the client bound to it.
#[derive(Debug)]
struct Session {
    transport: Arc<ProcessTransport>,
    monitor: JoinHandle<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

/// Owns the server process, its transport and its client.
///
/// Exactly one transport exists per manager at a time. `start`, `stop` and
/// `restart` are serialised; `state`, `client` and `wait_for_ready` never
/// wait on them.
#[derive(Debug)]
pub struct LifecycleManager {
    server: ServerConfig,
    timeouts: TimeoutConfig,
    state: Arc<watch::Sender<ProcessState>>,
    session: Mutex<Option<Session>>,
    client: RwLock<Option<McpClient>>,
    restarts: AtomicU32,
}

impl LifecycleManager {
    /// Creates a manager in the `NotStarted` state.
    #[must_use]
    pub fn new(server: ServerConfig, timeouts: TimeoutConfig) -> Self {
        let (state, _) = watch::channel(ProcessState::NotStarted);
        Self {
            server,
            timeouts,
            state: Arc::new(state),
            session: Mutex::new(None),
            client: RwLock::new(None),
            restarts: AtomicU32::new(0),
        }
    }

    /// Creates a manager from the `server` and `timeouts` sections.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.server.clone(), config.timeouts)
    }

    /// The launch configuration.
    #[must_use]
    pub const fn server_config(&self) -> &ServerConfig {
        &self.server
    }

    /// The configured timeouts.
    #[must_use]
    pub const fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// A receiver that observes every state transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// Number of successful restarts.
    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    fn transition(&self, to: ProcessState) {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::debug!(server = %self.server.command, %from, %to, "state transition");
        }
    }

    fn set_client(&self, client: Option<McpClient>) {
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = client;
    }

    /// Spawns the server and performs the handshake.
    ///
    /// Valid from `NotStarted` and `Crashed`. On success the state is `Ready`;
    /// on any failure it is `Crashed` and the failure is returned.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::InvalidState`] from any other state.
    /// - [`HarnessError::Spawn`] if the executable cannot be started.
    /// - [`HarnessError::Timeout`] if the handshake exceeds the startup timeout.
    /// - Any other handshake failure.
    pub async fn start(&self) -> HarnessResult<()> {
        let mut session = self.session.lock().await;
        let state = self.state();
        if !matches!(state, ProcessState::NotStarted | ProcessState::Crashed) {
            return Err(HarnessError::InvalidState {
                operation: "start",
                state,
            });
        }
        self.launch(&mut session).await
    }

    async fn launch(&self, session: &mut Option<Session>) -> HarnessResult<()> {
        if let Some(stale) = session.take() {
            stale.transport.close(Duration::ZERO).await;
        }
        self.set_client(None);
        self.transition(ProcessState::Starting);

        let transport = match ProcessTransport::open(&self.server) {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                tracing::error!(error = %e, "failed to start server");
                self.transition(ProcessState::Crashed);
                return Err(e);
            }
        };

        let client = McpClient::gated(
            Arc::clone(&transport),
            self.timeouts.request(),
            self.state.subscribe(),
        );
        let monitor = tokio::spawn(watch_exit(
            transport.exit_watch(),
            Arc::clone(&self.state),
            transport.label().to_string(),
        ));
        let launched = Session { transport, monitor };

        if let Err(e) = client.handshake_with_timeout(self.timeouts.startup()).await {
            tracing::error!(
                error = %e,
                stderr = %launched.transport.stderr_tail().join("\n"),
                "server failed to initialise"
            );
            launched.monitor.abort();
            launched.transport.close(Duration::ZERO).await;
            self.transition(ProcessState::Crashed);
            return Err(e);
        }

        let promoted = self.state.send_if_modified(|state| {
            if *state == ProcessState::Starting {
                *state = ProcessState::Ready;
                true
            } else {
                false
            }
        });
        if !promoted {
            let state = self.state();
            *session = Some(launched);
            return Err(HarnessError::closed(format!(
                "server exited during startup (state: {state})"
            )));
        }

        tracing::info!(
            server = %self.server.display_command(),
            pid = launched.transport.pid(),
            "server ready"
        );
        self.set_client(Some(client));
        *session = Some(launched);
        Ok(())
    }

    /// Polls until the state is `Ready`.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::NotReady`] at once if the state is `Crashed` or
    ///   `Stopped`, since waiting cannot succeed.
    /// - [`HarnessError::ReadinessTimeout`] when `timeout` elapses. The process
    ///   is left running.
    pub async fn wait_for_ready(&self, timeout: Duration) -> HarnessResult<()> {
        // `None` when the timeout is too large to represent: wait without a deadline.
        let deadline = Instant::now().checked_add(timeout);
        // interval() panics on a zero period.
        let period = self.timeouts.ready_poll_interval().max(Duration::from_millis(1));
        let mut ticks = tokio::time::interval(period);
        loop {
            ticks.tick().await;
            match self.state() {
                ProcessState::Ready => return Ok(()),
                state @ (ProcessState::Crashed | ProcessState::Stopped) => {
                    return Err(HarnessError::NotReady { state });
                }
                _ => {}
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(HarnessError::ReadinessTimeout {
                    timeout,
                    state: self.state(),
                });
            }
        }
    }

    /// The client for the current session.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::NotReady`] unless the state is `Ready`.
    pub fn client(&self) -> HarnessResult<McpClient> {
        let state = self.state();
        if state != ProcessState::Ready {
            return Err(HarnessError::NotReady { state });
        }
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(HarnessError::NotReady { state })
    }

    /// Stops the server.
    ///
    /// Pending requests fail with [`HarnessError::ConnectionClosed`] as the
    /// transport closes. The process gets `grace` to exit after its stdin is
    /// closed and is then killed. Ends in `Stopped` once the process has
    /// exited. A no-op from `NotStarted` or `Stopped`.
    ///
    /// Returns the process exit, if a process was running.
    pub async fn stop(&self, grace: Duration) -> Option<ProcessExit> {
        let mut session = self.session.lock().await;
        self.shutdown(&mut session, grace).await
    }

    async fn shutdown(
        &self,
        session: &mut Option<Session>,
        grace: Duration,
    ) -> Option<ProcessExit> {
        if matches!(
            self.state(),
            ProcessState::NotStarted | ProcessState::Stopped
        ) {
            return None;
        }

        self.transition(ProcessState::Stopping);
        self.set_client(None);

        let exit = match session.take() {
            Some(stopping) => Some(stopping.transport.close(grace).await),
            None => None,
        };

        if let Some(exit) = &exit {
            tracing::info!(server = %self.server.command, %exit, "server stopped");
        }
        self.transition(ProcessState::Stopped);
        exit
    }

    /// Stops the server with the configured grace period and starts it again.
    ///
    /// # Errors
    ///
    /// Same as [`LifecycleManager::start`], except that `InvalidState` is
    /// never returned.
    pub async fn restart(&self) -> HarnessResult<()> {
        let mut session = self.session.lock().await;
        tracing::info!(server = %self.server.command, "restarting server");
        self.shutdown(&mut session, self.timeouts.shutdown_grace())
            .await;
        self.launch(&mut session).await?;
        self.restarts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

async fn watch_exit(
    mut exit: watch::Receiver<Option<ProcessExit>>,
    state: Arc<watch::Sender<ProcessState>>,
    label: String,
) {
    let observed = exit.wait_for(Option::is_some).await.map(|outcome| *outcome);
    let Ok(Some(outcome)) = observed else {
        return;
    };
    if outcome.requested {
        return;
    }

    let crashed = state.send_if_modified(|current| {
        if matches!(*current, ProcessState::Starting | ProcessState::Ready) {
            *current = ProcessState::Crashed;
            true
        } else {
            false
        }
    });
    if crashed {
        tracing::error!(server = %label, exit = %outcome, "server process exited unexpectedly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_server() -> LifecycleManager {
        LifecycleManager::new(
            ServerConfig::new("/definitely/not/a/real/mcp-server"),
            TimeoutConfig {
                ready_poll_interval_ms: 5,
                ..TimeoutConfig::default()
            },
        )
    }

    #[test]
    fn state_display() {
        assert_eq!(ProcessState::NotStarted.to_string(), "not started");
        assert_eq!(ProcessState::Crashed.to_string(), "crashed");
    }

    #[test]
    fn new_manager_is_not_started() {
        let manager = missing_server();
        assert_eq!(manager.state(), ProcessState::NotStarted);
        assert_eq!(manager.restart_count(), 0);
        assert!(matches!(
            manager.client(),
            Err(HarnessError::NotReady {
                state: ProcessState::NotStarted
            })
        ));
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let manager = missing_server();
        assert!(manager.stop(Duration::from_millis(10)).await.is_none());
        assert_eq!(manager.state(), ProcessState::NotStarted);
    }

    #[tokio::test]
    async fn spawn_failure_crashes() {
        let manager = missing_server();
        let mut states = manager.subscribe();

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, HarnessError::Spawn { .. }));
        assert!(err.is_transport_failure());
        assert_eq!(manager.state(), ProcessState::Crashed);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ProcessState::Crashed);
    }

    #[tokio::test]
    async fn wait_for_ready_fails_fast_when_crashed() {
        let manager = missing_server();
        let _ = manager.start().await;

        let err = manager
            .wait_for_ready(Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::NotReady {
                state: ProcessState::Crashed
            }
        ));
    }

    #[tokio::test]
    async fn unbounded_wait_for_ready_does_not_overflow() {
        let manager = missing_server();
        let _ = manager.start().await;

        let err = manager.wait_for_ready(Duration::MAX).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::NotReady {
                state: ProcessState::Crashed
            }
        ));
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_when_never_started() {
        let manager = missing_server();
        let err = manager
            .wait_for_ready(Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::ReadinessTimeout {
                state: ProcessState::NotStarted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn crashed_manager_may_stop_and_not_restart_via_start() {
        let manager = missing_server();
        let _ = manager.start().await;

        assert!(manager.stop(Duration::from_millis(10)).await.is_none());
        assert_eq!(manager.state(), ProcessState::Stopped);

        let err = manager.start().await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::InvalidState {
                operation: "start",
                state: ProcessState::Stopped
            }
        ));
    }
}
