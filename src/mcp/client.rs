//! Typed protocol client for a server under test.
//!
//! Every operation is one or more request/response round trips over a
//! [`ProcessTransport`]. Failures keep their kind:
//!
//! - transport health: [`HarnessError::Timeout`], [`HarnessError::ConnectionClosed`],
//!   [`HarnessError::Protocol`]
//! - application level: [`HarnessError::NotFound`], [`HarnessError::Server`],
//!   and a [`CallResult`] with `is_error` set (see [`CallResult::into_success`])

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::error::{HarnessError, HarnessResult, MissingKind};
use crate::lifecycle::ProcessState;
use crate::mcp::protocol::{
    methods, ErrorCode, CLIENT_NAME, MCP_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::mcp::schema;
use crate::mcp::transport::{ProcessExit, ProcessTransport};
use crate::mcp::types::{
    CallResult, Implementation, InitializeResult, ListResourcesPage, ListToolsPage, ReadResult,
    Resource, Tool,
};

#[derive(Debug, Clone)]
enum Handshake {
    Pending,
    Complete(InitializeResult),
    Failed(String),
}

#[derive(Debug)]
struct ClientInner {
    transport: Arc<ProcessTransport>,
    handshake: Mutex<Handshake>,
    /// Serialises concurrent `handshake()` calls.
    handshake_gate: tokio::sync::Mutex<()>,
    state: Option<watch::Receiver<ProcessState>>,
}

/// Protocol client bound to one transport.
///
/// Cheap to clone; clones share the transport and handshake state.
#[derive(Debug, Clone)]
pub struct McpClient {
    inner: Arc<ClientInner>,
    request_timeout: Duration,
}

impl McpClient {
    /// Creates a client over an open transport. No request is sent until
    /// [`McpClient::handshake`].
    #[must_use]
    pub fn new(transport: Arc<ProcessTransport>, request_timeout: Duration) -> Self {
        Self::build(transport, request_timeout, None)
    }

    /// Creates a client whose operations fail fast unless the observed
    /// lifecycle state is `Starting` or `Ready`.
    pub(crate) fn gated(
        transport: Arc<ProcessTransport>,
        request_timeout: Duration,
        state: watch::Receiver<ProcessState>,
    ) -> Self {
        Self::build(transport, request_timeout, Some(state))
    }

    fn build(
        transport: Arc<ProcessTransport>,
        request_timeout: Duration,
        state: Option<watch::Receiver<ProcessState>>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                handshake: Mutex::new(Handshake::Pending),
                handshake_gate: tokio::sync::Mutex::new(()),
                state,
            }),
            request_timeout,
        }
    }

    /// Returns a client sharing this connection with a different request timeout.
    #[must_use]
    pub fn with_timeout(&self, request_timeout: Duration) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            request_timeout,
        }
    }

    /// The per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<ProcessTransport> {
        &self.inner.transport
    }

    fn handshake_state(&self) -> Handshake {
        self.inner
            .handshake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_handshake_state(&self, state: Handshake) {
        *self
            .inner
            .handshake
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn check_state(&self) -> HarnessResult<()> {
        let Some(state) = &self.inner.state else {
            return Ok(());
        };
        let state = *state.borrow();
        match state {
            ProcessState::Starting | ProcessState::Ready => Ok(()),
            other => Err(HarnessError::closed(format!("server is {other}"))),
        }
    }

    fn require_handshake(&self) -> HarnessResult<()> {
        match self.handshake_state() {
            Handshake::Complete(_) => Ok(()),
            Handshake::Pending => Err(HarnessError::HandshakeRequired),
            Handshake::Failed(reason) => Err(HarnessError::HandshakeFailed { reason }),
        }
    }

    async fn round_trip(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> HarnessResult<Value> {
        self.check_state()?;
        let response = self
            .inner
            .transport
            .send(method, params)?
            .wait(timeout)
            .await?;

        response.outcome.map_err(|error| HarnessError::Server {
            method: method.to_string(),
            code: error.code,
            message: error.message,
            data: error.data,
        })
    }

    async fn request(&self, method: &str, params: Option<Value>) -> HarnessResult<Value> {
        self.require_handshake()?;
        self.round_trip(method, params, self.request_timeout).await
    }

    /// Performs the `initialize` handshake using the request timeout.
    ///
    /// # Errors
    ///
    /// See [`McpClient::handshake_with_timeout`].
    pub async fn handshake(&self) -> HarnessResult<InitializeResult> {
        self.handshake_with_timeout(self.request_timeout).await
    }

    /// Performs the `initialize` handshake, then sends `notifications/initialized`.
    ///
    /// Runs once per transport: later calls return the cached result. After a
    /// failure every operation on this connection fails with
    /// [`HarnessError::HandshakeFailed`].
    ///
    /// # Errors
    ///
    /// - Transport failures of the `initialize` request.
    /// - [`HarnessError::Protocol`] if the reply is malformed or names an
    ///   unsupported protocol version.
    /// - [`HarnessError::HandshakeFailed`] if an earlier handshake failed.
    pub async fn handshake_with_timeout(
        &self,
        timeout: Duration,
    ) -> HarnessResult<InitializeResult> {
        let _gate = self.inner.handshake_gate.lock().await;
        match self.handshake_state() {
            Handshake::Complete(result) => return Ok(result),
            Handshake::Failed(reason) => return Err(HarnessError::HandshakeFailed { reason }),
            Handshake::Pending => {}
        }

        match self.initialize(timeout).await {
            Ok(result) => {
                tracing::info!(
                    server = %result.server_info.name,
                    version = %result.server_info.version,
                    protocol = %result.protocol_version,
                    "handshake complete"
                );
                self.set_handshake_state(Handshake::Complete(result.clone()));
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(error = %e, "handshake failed");
                self.set_handshake_state(Handshake::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn initialize(&self, timeout: Duration) -> HarnessResult<InitializeResult> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let raw = self
            .round_trip(methods::INITIALIZE, Some(params), timeout)
            .await?;
        let result: InitializeResult = decode(methods::INITIALIZE, raw)?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(HarnessError::protocol(format!(
                "server selected unsupported protocol version '{}'",
                result.protocol_version
            )));
        }

        self.inner.transport.notify(methods::INITIALIZED, None)?;
        Ok(result)
    }

    /// The cached handshake result.
    #[must_use]
    pub fn initialize_result(&self) -> Option<InitializeResult> {
        match self.handshake_state() {
            Handshake::Complete(result) => Some(result),
            _ => None,
        }
    }

    /// Server identification from the handshake.
    #[must_use]
    pub fn server_info(&self) -> Option<Implementation> {
        self.initialize_result().map(|r| r.server_info)
    }

    /// Protocol version selected by the server.
    #[must_use]
    pub fn protocol_version(&self) -> Option<String> {
        self.initialize_result().map(|r| r.protocol_version)
    }

    /// Round-trips a `ping`.
    ///
    /// # Errors
    ///
    /// Returns transport failures or a [`HarnessError::Server`] reply.
    pub async fn ping(&self) -> HarnessResult<()> {
        self.request(methods::PING, None).await.map(|_| ())
    }

    /// Lists every tool, following pagination, in server order.
    ///
    /// # Errors
    ///
    /// Returns transport failures, a [`HarnessError::Server`] reply, or
    /// [`HarnessError::Protocol`] for a malformed listing.
    pub async fn list_tools(&self) -> HarnessResult<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursors = CursorTracker::default();
        loop {
            let raw = self
                .request(methods::TOOLS_LIST, cursors.params())
                .await?;
            let page: ListToolsPage = decode(methods::TOOLS_LIST, raw)?;
            tools.extend(page.tools);
            if !cursors.advance(methods::TOOLS_LIST, page.next_cursor)? {
                return Ok(tools);
            }
        }
    }

    /// Looks a tool up by name; absence is not an error.
    ///
    /// # Errors
    ///
    /// See [`McpClient::list_tools`].
    pub async fn get_tool(&self, name: &str) -> HarnessResult<Option<Tool>> {
        Ok(self
            .list_tools()
            .await?
            .into_iter()
            .find(|tool| tool.name == name))
    }

    /// Calls a tool.
    ///
    /// A tool-reported failure is returned as `Ok` with `is_error` set.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::NotFound`] if the server rejects the call and the
    ///   tool is not listed.
    /// - [`HarnessError::Server`] for any other error reply.
    /// - Transport failures.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> HarnessResult<CallResult> {
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        let params = json!({"name": name, "arguments": arguments});

        tracing::debug!(tool = name, "calling tool");
        match self.request(methods::TOOLS_CALL, Some(params)).await {
            Ok(raw) => decode(methods::TOOLS_CALL, raw),
            Err(err) if rejects_lookup(&err) => {
                match self.list_tools().await {
                    Ok(tools) if !tools.iter().any(|tool| tool.name == name) => {
                        Err(HarnessError::NotFound {
                            kind: MissingKind::Tool,
                            name: name.to_string(),
                        })
                    }
                    _ => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Lists every resource, following pagination, in server order.
    ///
    /// # Errors
    ///
    /// Returns transport failures, a [`HarnessError::Server`] reply, or
    /// [`HarnessError::Protocol`] for a malformed listing.
    pub async fn list_resources(&self) -> HarnessResult<Vec<Resource>> {
        let mut resources = Vec::new();
        let mut cursors = CursorTracker::default();
        loop {
            let raw = self
                .request(methods::RESOURCES_LIST, cursors.params())
                .await?;
            let page: ListResourcesPage = decode(methods::RESOURCES_LIST, raw)?;
            resources.extend(page.resources);
            if !cursors.advance(methods::RESOURCES_LIST, page.next_cursor)? {
                return Ok(resources);
            }
        }
    }

    /// Reads a resource.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::NotFound`] if the uri is unknown to the server.
    /// - [`HarnessError::Server`] for any other error reply.
    /// - Transport failures.
    pub async fn read_resource(&self, uri: &str) -> HarnessResult<ReadResult> {
        let params = json!({"uri": uri});
        let not_found = || HarnessError::NotFound {
            kind: MissingKind::Resource,
            name: uri.to_string(),
        };

        match self.request(methods::RESOURCES_READ, Some(params)).await {
            Ok(raw) => decode(methods::RESOURCES_READ, raw),
            Err(HarnessError::Server { code, .. })
                if ErrorCode::from_code(code) == ErrorCode::ResourceNotFound =>
            {
                Err(not_found())
            }
            Err(err) if rejects_lookup(&err) => match self.list_resources().await {
                Ok(resources) if !resources.iter().any(|r| r.uri == uri) => Err(not_found()),
                _ => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Validates arguments against the tool's declared input schema.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::NotFound`] if the tool is not listed.
    /// - [`HarnessError::InvalidArguments`] with every validation failure.
    /// - Errors from [`McpClient::list_tools`].
    pub async fn validate_tool_arguments(
        &self,
        name: &str,
        arguments: &Value,
    ) -> HarnessResult<()> {
        let tool = self
            .get_tool(name)
            .await?
            .ok_or_else(|| HarnessError::NotFound {
                kind: MissingKind::Tool,
                name: name.to_string(),
            })?;
        schema::validate_arguments(&tool, arguments)
    }

    /// Fails with the first protocol violation observed on this connection.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Protocol`] if any violation was recorded.
    pub fn check_protocol_health(&self) -> HarnessResult<()> {
        let violations = self.inner.transport.protocol_violations();
        match violations.first() {
            None => Ok(()),
            Some(first) if violations.len() == 1 => Err(HarnessError::protocol(first.to_string())),
            Some(first) => Err(HarnessError::protocol(format!(
                "{first} (and {} more)",
                violations.len() - 1
            ))),
        }
    }

    /// Closes the transport. See [`ProcessTransport::close`].
    pub async fn close(&self, grace: Duration) -> ProcessExit {
        self.inner.transport.close(grace).await
    }
}

/// Whether an error reply may mean "no such tool/resource".
fn rejects_lookup(err: &HarnessError) -> bool {
    matches!(
        err,
        HarnessError::Server { code, .. }
            if matches!(
                ErrorCode::from_code(*code),
                ErrorCode::MethodNotFound | ErrorCode::InvalidParams
            )
    )
}

fn decode<T: DeserializeOwned>(method: &str, raw: Value) -> HarnessResult<T> {
    serde_json::from_value(raw)
        .map_err(|e| HarnessError::protocol(format!("malformed '{method}' result: {e}")))
}

/// Follows `nextCursor` and rejects a server that repeats itself.
#[derive(Debug, Default)]
struct CursorTracker {
    current: Option<String>,
    seen: HashSet<String>,
}

impl CursorTracker {
    fn params(&self) -> Option<Value> {
        self.current.as_ref().map(|cursor| json!({"cursor": cursor}))
    }

    fn advance(&mut self, method: &str, next: Option<String>) -> HarnessResult<bool> {
        let Some(next) = next else {
            return Ok(false);
        };
        if !self.seen.insert(next.clone()) {
            return Err(HarnessError::protocol(format!(
                "'{method}' returned cursor '{next}' twice"
            )));
        }
        self.current = Some(next);
        Ok(true)
    }
}
