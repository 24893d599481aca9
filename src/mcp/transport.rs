//! stdio transport to an MCP server child process.
//!
//! The child is spawned with piped stdin/stdout/stderr:
//!
//! - stdin: receives JSON-RPC messages from the harness
//! - stdout: carries JSON-RPC messages back to the harness
//! - stderr: diagnostic channel, logged and retained, never parsed as frames
//!
//! # Concurrency
//!
//! Four tasks run per transport:
//!
//! - a **writer** draining an unbounded outbound queue into stdin, so
//!   [`ProcessTransport::send`] never suspends;
//! - a **reader** decoding stdout frames and resolving in-flight slots by id;
//! - a **stderr** collector;
//! - a **supervisor** owning the [`Child`], publishing its exit and applying
//!   the termination policy.
//!
//! The in-flight table is private to this module. Entries are added by
//! `send`, removed by the reader on delivery, by [`PendingRequest`] on
//! timeout or drop, and drained atomically when the transport closes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::config::ServerConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::mcp::codec::{Frame, FrameCodec, MalformedFrame};
use crate::mcp::protocol::{
    methods, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message, RequestId,
};

/// Number of stderr lines retained for diagnostics.
const STDERR_TAIL_LINES: usize = 200;

/// Abandoned request ids remembered for late-reply detection. Beyond this the
/// oldest are forgotten and a reply to them counts as unmatched.
const ABANDONED_IDS: usize = 1024;

type Reply = HarnessResult<JsonRpcResponse>;
type Slot = oneshot::Sender<Reply>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the reader did with an incoming response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Handed to the waiting caller.
    Delivered,
    /// The caller gave up (timeout or cancellation) before it arrived.
    Late,
    /// No request with this id was ever outstanding.
    Unmatched,
}

#[derive(Debug, Default)]
struct InFlightState {
    closed: Option<String>,
    slots: HashMap<i64, Slot>,
    abandoned: HashSet<i64>,
    abandoned_order: VecDeque<i64>,
}

/// Pending-response slots keyed by request id.
#[derive(Debug, Default)]
struct InFlightTable {
    state: Mutex<InFlightState>,
}

impl InFlightTable {
    fn register(&self, id: i64) -> HarnessResult<oneshot::Receiver<Reply>> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.closed {
            return Err(HarnessError::closed(reason.clone()));
        }
        let (tx, rx) = oneshot::channel();
        state.slots.insert(id, tx);
        Ok(rx)
    }

    fn deliver(&self, id: i64, response: JsonRpcResponse) -> Delivery {
        let mut state = lock(&self.state);
        if let Some(slot) = state.slots.remove(&id) {
            // The receiver may have been dropped a moment ago; that is a late reply.
            return if slot.send(Ok(response)).is_ok() {
                Delivery::Delivered
            } else {
                Delivery::Late
            };
        }
        if state.abandoned.remove(&id) {
            Delivery::Late
        } else {
            Delivery::Unmatched
        }
    }

    fn abandon(&self, id: i64) {
        let mut state = lock(&self.state);
        if state.slots.remove(&id).is_some() && state.closed.is_none() {
            state.abandoned.insert(id);
            state.abandoned_order.push_back(id);
            while state.abandoned_order.len() > ABANDONED_IDS {
                if let Some(oldest) = state.abandoned_order.pop_front() {
                    state.abandoned.remove(&oldest);
                }
            }
        }
    }

    /// Closes the table and fails every pending slot. Returns how many were failed.
    fn close(&self, reason: &str) -> usize {
        let mut state = lock(&self.state);
        if state.closed.is_none() {
            state.closed = Some(reason.to_string());
        }
        let reason = state.closed.clone().unwrap_or_default();
        state.abandoned.clear();
        state.abandoned_order.clear();
        let slots: Vec<Slot> = state.slots.drain().map(|(_, slot)| slot).collect();
        drop(state);

        let failed = slots.len();
        for slot in slots {
            let _ = slot.send(Err(HarnessError::closed(reason.clone())));
        }
        failed
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed.is_some()
    }

    fn len(&self) -> usize {
        lock(&self.state).slots.len()
    }
}

/// Kind of protocol violation observed on the frame stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// A frame that is not a valid JSON-RPC message.
    MalformedFrame,
    /// A response whose id matches no outstanding request.
    UnmatchedResponse,
}

/// A protocol violation recorded by the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolViolation {
    /// What went wrong.
    pub kind: ViolationKind,
    /// Human-readable detail.
    pub detail: String,
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.detail)
    }
}

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit status, if it could be collected.
    pub status: Option<ExitStatus>,
    /// Whether termination was requested through [`ProcessTransport::close`].
    pub requested: bool,
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{status}"),
            None => write!(f, "unknown exit status"),
        }
    }
}

/// A request awaiting its response.
///
/// Dropping the handle before the response arrives cancels the request: its
/// in-flight entry is removed and a later reply is discarded.
#[derive(Debug)]
pub struct PendingRequest {
    id: i64,
    method: String,
    receiver: oneshot::Receiver<Reply>,
    table: Arc<InFlightTable>,
}

impl PendingRequest {
    /// The correlation id of this request.
    #[must_use]
    pub const fn id(&self) -> i64 {
        self.id
    }

    /// The method of this request.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Waits for the matching response.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::Timeout`] if no response arrives within `timeout`;
    ///   the transport stays usable.
    /// - [`HarnessError::ConnectionClosed`] if the transport closes first.
    pub async fn wait(mut self, timeout: Duration) -> HarnessResult<JsonRpcResponse> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(HarnessError::closed("transport dropped the pending request")),
            Err(_) => {
                tracing::debug!(id = self.id, method = %self.method, "request timed out");
                Err(HarnessError::Timeout {
                    method: self.method.clone(),
                    id: self.id,
                    timeout,
                })
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.table.abandon(self.id);
    }
}

/// State shared between the transport handle and its tasks.
#[derive(Debug)]
struct Shared {
    label: String,
    in_flight: Arc<InFlightTable>,
    violations: Mutex<Vec<ProtocolViolation>>,
    stderr_tail: Mutex<VecDeque<String>>,
}

impl Shared {
    fn record_violation(&self, kind: ViolationKind, detail: String) {
        tracing::warn!(server = %self.label, ?kind, %detail, "protocol violation");
        lock(&self.violations).push(ProtocolViolation { kind, detail });
    }
}

/// Request sent to the supervisor task.
#[derive(Debug)]
struct ShutdownRequest {
    grace: Duration,
}

/// A running server process and its JSON-RPC stream.
#[derive(Debug)]
pub struct ProcessTransport {
    shared: Arc<Shared>,
    next_id: AtomicI64,
    pid: Option<u32>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    shutdown: Mutex<Option<oneshot::Sender<ShutdownRequest>>>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessTransport {
    /// Spawns the server process and wires its stdio as the frame stream.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Spawn`] if the executable cannot be started.
    pub fn open(config: &ServerConfig) -> HarnessResult<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        if !config.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(&config.env);

        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let label = config.display_command();
        let mut child = cmd.spawn().map_err(|source| HarnessError::Spawn {
            command: label.clone(),
            source,
        })?;

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
            return Err(HarnessError::Spawn {
                command: label,
                source: std::io::Error::other("failed to capture child stdio"),
            });
        };

        let pid = child.id();
        tracing::info!(server = %label, pid, "spawned server process");

        let shared = Arc::new(Shared {
            label,
            in_flight: Arc::new(InFlightTable::default()),
            violations: Mutex::new(Vec::new()),
            stderr_tail: Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)),
        });

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(write_frames(stdin, outbound_rx, Arc::clone(&shared)));
        tokio::spawn(read_frames(stdout, outbound_tx.downgrade(), Arc::clone(&shared)));
        tokio::spawn(collect_stderr(stderr, Arc::clone(&shared)));
        tokio::spawn(supervise(child, shutdown_rx, exit_tx, Arc::clone(&shared)));

        Ok(Self {
            shared,
            next_id: AtomicI64::new(1),
            pid,
            outbound: Mutex::new(Some(outbound_tx)),
            shutdown: Mutex::new(Some(shutdown_tx)),
            exit: exit_rx,
        })
    }

    /// Human-readable command line of the server.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// OS process id, if the process was running when spawned.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queues a request and registers it in the in-flight table.
    ///
    /// Does not suspend; use [`PendingRequest::wait`] to receive the response.
    /// Any number of requests may be outstanding at once.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::ConnectionClosed`] if the transport is closed.
    pub fn send(&self, method: &str, params: Option<Value>) -> HarnessResult<PendingRequest> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self.shared.in_flight.register(id)?;
        let pending = PendingRequest {
            id,
            method: method.to_string(),
            receiver,
            table: Arc::clone(&self.shared.in_flight),
        };

        tracing::trace!(server = %self.shared.label, id, method, "sending request");
        let request = JsonRpcRequest::new(RequestId::Number(id), method, params);
        self.enqueue(Message::Request(request))?;
        Ok(pending)
    }

    /// Sends a request and waits for its response.
    ///
    /// # Errors
    ///
    /// See [`ProcessTransport::send`] and [`PendingRequest::wait`].
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> HarnessResult<JsonRpcResponse> {
        self.send(method, params)?.wait(timeout).await
    }

    /// Queues a notification (no response expected).
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::ConnectionClosed`] if the transport is closed.
    pub fn notify(&self, method: &str, params: Option<Value>) -> HarnessResult<()> {
        if let Some(reason) = self.closed_reason() {
            return Err(HarnessError::closed(reason));
        }
        self.enqueue(Message::Notification(JsonRpcNotification::new(
            method, params,
        )))
    }

    fn enqueue(&self, message: Message) -> HarnessResult<()> {
        let outbound = lock(&self.outbound);
        let sender = outbound
            .as_ref()
            .ok_or_else(|| HarnessError::closed("transport closed"))?;
        sender
            .send(message)
            .map_err(|_| HarnessError::closed("server stdin writer has stopped"))
    }

    fn closed_reason(&self) -> Option<String> {
        lock(&self.shared.in_flight.state).closed.clone()
    }

    /// Whether the transport no longer accepts requests.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.in_flight.is_closed()
    }

    /// Number of requests currently awaiting a response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.len()
    }

    /// Protocol violations observed so far.
    #[must_use]
    pub fn protocol_violations(&self) -> Vec<ProtocolViolation> {
        lock(&self.shared.violations).clone()
    }

    /// The most recent lines the server wrote to stderr.
    #[must_use]
    pub fn stderr_tail(&self) -> Vec<String> {
        lock(&self.shared.stderr_tail).iter().cloned().collect()
    }

    /// A receiver that observes the process exit.
    #[must_use]
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    /// The process exit, if it has happened.
    #[must_use]
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Closes the transport and terminates the process.
    ///
    /// Every pending request fails with [`HarnessError::ConnectionClosed`]
    /// before anything else happens. Then stdin is closed (the stdio shutdown
    /// signal) and the process gets `grace` to exit before it is killed.
    /// Idempotent: later calls return the same exit.
    pub async fn close(&self, grace: Duration) -> ProcessExit {
        let failed = self.shared.in_flight.close("transport closed");
        if failed > 0 {
            tracing::debug!(
                server = %self.shared.label,
                failed,
                "failed pending requests on close"
            );
        }

        drop(lock(&self.outbound).take());
        if let Some(shutdown) = lock(&self.shutdown).take() {
            let _ = shutdown.send(ShutdownRequest { grace });
        }

        let mut exit = self.exit.clone();
        let observed = exit.wait_for(Option::is_some).await.map(|status| *status);
        observed.ok().flatten().unwrap_or(ProcessExit {
            status: None,
            requested: true,
        })
    }
}

async fn write_frames(
    stdin: ChildStdin,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
) {
    let mut sink = FramedWrite::new(stdin, FrameCodec::new());
    while let Some(message) = outbound.recv().await {
        if let Err(e) = sink.send(message).await {
            tracing::warn!(server = %shared.label, error = %e, "failed to write to server stdin");
            shared
                .in_flight
                .close(&format!("failed to write to server stdin: {e}"));
            return;
        }
    }
    // Queue closed: dropping the sink closes stdin.
    tracing::debug!(server = %shared.label, "closing server stdin");
}

async fn read_frames(
    stdout: ChildStdout,
    replies: mpsc::WeakUnboundedSender<Message>,
    shared: Arc<Shared>,
) {
    let mut frames = FramedRead::new(stdout, FrameCodec::new());
    let reason = loop {
        match frames.next().await {
            Some(Ok(Frame::Message(Message::Response(response)))) => {
                dispatch_response(&shared, response);
            }
            Some(Ok(Frame::Message(Message::Request(request)))) => {
                answer_server_request(&shared, &replies, &request);
            }
            Some(Ok(Frame::Message(Message::Notification(notification)))) => {
                tracing::debug!(
                    server = %shared.label,
                    method = %notification.method,
                    "server notification"
                );
            }
            Some(Ok(Frame::Malformed(MalformedFrame { preview, error }))) => {
                shared.record_violation(
                    ViolationKind::MalformedFrame,
                    format!("{error} (frame: {preview:?})"),
                );
            }
            Some(Err(e)) => break format!("failed to read from server stdout: {e}"),
            None => break "server closed its stdout".to_string(),
        }
    };

    tracing::debug!(server = %shared.label, %reason, "reader finished");
    shared.in_flight.close(&reason);
}

fn dispatch_response(shared: &Shared, response: JsonRpcResponse) {
    match response.id.clone() {
        Some(RequestId::Number(id)) => match shared.in_flight.deliver(id, response) {
            Delivery::Delivered => {}
            Delivery::Late => {
                tracing::debug!(server = %shared.label, id, "discarding late response");
            }
            Delivery::Unmatched => shared.record_violation(
                ViolationKind::UnmatchedResponse,
                format!("response id {id} matches no outstanding request"),
            ),
        },
        Some(RequestId::String(id)) => shared.record_violation(
            ViolationKind::UnmatchedResponse,
            format!("response id {id:?} matches no outstanding request"),
        ),
        None => {
            let detail = match &response.outcome {
                Err(error) => format!(
                    "error response without id: [{}] {}",
                    error.code, error.message
                ),
                Ok(_) => "response without id".to_string(),
            };
            shared.record_violation(ViolationKind::UnmatchedResponse, detail);
        }
    }
}

fn answer_server_request(
    shared: &Shared,
    replies: &mpsc::WeakUnboundedSender<Message>,
    request: &JsonRpcRequest,
) {
    tracing::debug!(server = %shared.label, method = %request.method, "server request");
    let response = if request.method == methods::PING {
        JsonRpcResponse::success(request.id.clone(), serde_json::json!({}))
    } else {
        JsonRpcResponse::method_not_found(request.id.clone(), &request.method)
    };
    if let Some(sender) = replies.upgrade() {
        let _ = sender.send(Message::Response(response));
    }
}

async fn collect_stderr(stderr: ChildStderr, shared: Arc<Shared>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "mcp_harness::server_stderr", server = %shared.label, "{line}");
        let mut tail = lock(&shared.stderr_tail);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

async fn supervise(
    mut child: Child,
    shutdown: oneshot::Receiver<ShutdownRequest>,
    exit: watch::Sender<Option<ProcessExit>>,
    shared: Arc<Shared>,
) {
    let (status, requested) = tokio::select! {
        status = child.wait() => (status.ok(), false),
        request = shutdown => {
            // A dropped transport counts as a request with no grace period.
            let grace = request.map_or(Duration::ZERO, |r| r.grace);
            (terminate(&mut child, grace, &shared.label).await, true)
        }
    };

    let outcome = ProcessExit { status, requested };
    if requested {
        tracing::info!(server = %shared.label, exit = %outcome, "server process stopped");
    } else {
        tracing::warn!(server = %shared.label, exit = %outcome, "server process exited");
    }

    shared
        .in_flight
        .close(&format!("server process exited ({outcome})"));
    exit.send_replace(Some(outcome));
}

async fn terminate(child: &mut Child, grace: Duration, label: &str) -> Option<ExitStatus> {
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status.ok();
    }

    tracing::warn!(
        server = %label,
        grace_ms = grace.as_millis(),
        "server did not exit within grace period, killing"
    );
    if let Err(e) = child.kill().await {
        tracing::warn!(server = %label, error = %e, "failed to kill server process");
    }
    child.wait().await.ok()
}
