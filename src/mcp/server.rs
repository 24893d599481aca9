//! Reference MCP server used as the target of integration tests.
//!
//! This module implements the server side of the stdio protocol:
//!
//! 1. **Initialisation**: `initialize`, then `notifications/initialized`
//! 2. **Operation**: tools and resources, with `tools/call` handled in
//!    concurrent tasks so replies may leave out of request order
//! 3. **Shutdown**: stdin EOF or a termination signal
//!
//! The tools deliberately cover misbehaviour as well as normal answers:
//! stray responses, garbage frames, crashes, slow calls and stderr output.

use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::FramedRead;

use crate::mcp::codec::{encode_frame, Frame, FrameCodec};
use crate::mcp::protocol::{
    methods, ErrorCode, JsonRpcErrorData, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    Message, RequestId, MCP_PROTOCOL_VERSION,
};

/// Name reported in `serverInfo`.
pub const FIXTURE_SERVER_NAME: &str = "mcp-fixture-server";

/// Environment variable overriding the greeting resource text.
pub const GREETING_ENV: &str = "MCP_FIXTURE_GREETING";

const DEFAULT_GREETING: &str = "Hello from the fixture server!";
const GREETING_URI: &str = "fixture://greeting";
const CONFIG_URI: &str = "fixture://config";

/// Server state in the MCP lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for initialize request.
    AwaitingInit,
    /// Initialize received, waiting for initialized notification.
    Initialising,
    /// Ready for normal operation.
    Running,
    /// Shutdown in progress.
    ShuttingDown,
}

/// Fixture behaviour knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FixtureOptions {
    /// Delay before the first frame is read.
    #[serde(rename = "startup_delay_ms", serialize_with = "as_millis")]
    pub startup_delay: Duration,
    /// Page size for listings; `None` returns everything in one page.
    pub page_size: Option<usize>,
}

fn as_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

/// A tool definition for tools/list response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDefinition {
    name: &'static str,
    description: &'static str,
    input_schema: Value,
}

/// Parameters for tools/call request.
#[derive(Debug, Clone, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct ReadParams {
    uri: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    cursor: Option<String>,
}

/// Result of a tool call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallResult {
    content: Vec<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    structured_content: Option<Value>,
}

impl ToolCallResult {
    fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![json!({"type": "text", "text": text.into()})],
            is_error: false,
            structured_content: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(message)
        }
    }
}

/// Output queued for the stdout writer.
#[derive(Debug)]
enum Outbound {
    Message(Message),
    /// A line written verbatim, bypassing the codec.
    Raw(String),
}

type Replies = mpsc::UnboundedSender<Outbound>;

fn reply(out: &Replies, response: JsonRpcResponse) {
    let _ = out.send(Outbound::Message(Message::Response(response)));
}

/// The fixture MCP server.
#[derive(Debug)]
pub struct FixtureServer {
    state: ServerState,
    options: FixtureOptions,
    calls: JoinSet<()>,
}

impl FixtureServer {
    /// Creates a server with the given options.
    #[must_use]
    pub fn new(options: FixtureOptions) -> Self {
        Self {
            state: ServerState::AwaitingInit,
            options,
            calls: JoinSet::new(),
        }
    }

    /// Returns the current server state.
    #[must_use]
    pub const fn state(&self) -> ServerState {
        self.state
    }

    /// Serves stdin/stdout until EOF or a termination signal.
    ///
    /// # Errors
    ///
    /// Returns an error if stdin cannot be read or signal handlers cannot be installed.
    pub async fn run(mut self) -> std::io::Result<()> {
        if !self.options.startup_delay.is_zero() {
            tracing::info!(
                delay_ms = self.options.startup_delay.as_millis(),
                "delaying startup"
            );
            tokio::time::sleep(self.options.startup_delay).await;
        }

        let (out, outbound) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_stdout(outbound));

        let result = self.serve(&out).await;

        self.state = ServerState::ShuttingDown;
        self.calls.shutdown().await;
        drop(out);
        let _ = writer.await;
        result
    }

    #[cfg(unix)]
    async fn serve(&mut self, out: &Replies) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).map_err(std::io::Error::other)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(std::io::Error::other)?;
        let mut frames = FramedRead::new(tokio::io::stdin(), FrameCodec::new());

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                    return Ok(());
                }

                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    return Ok(());
                }

                frame = frames.next() => {
                    let Some(frame) = frame.transpose()? else {
                        tracing::info!("stdin closed, shutting down");
                        return Ok(());
                    };
                    self.handle_frame(frame, out);
                }
            }
        }
    }

    #[cfg(windows)]
    async fn serve(&mut self, out: &Replies) -> std::io::Result<()> {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut frames = FramedRead::new(tokio::io::stdin(), FrameCodec::new());

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                    return Ok(());
                }

                frame = frames.next() => {
                    let Some(frame) = frame.transpose()? else {
                        tracing::info!("stdin closed, shutting down");
                        return Ok(());
                    };
                    self.handle_frame(frame, out);
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame, out: &Replies) {
        match frame {
            Frame::Message(Message::Request(req)) => self.handle_request(req, out),
            Frame::Message(Message::Notification(ref notif)) => self.handle_notification(notif),
            Frame::Message(Message::Response(resp)) => {
                tracing::debug!(id = ?resp.id, "client response");
            }
            Frame::Malformed(bad) => {
                tracing::warn!(error = %bad.error, "malformed frame from client");
                reply(out, bad.error.to_response());
            }
        }
    }

    fn handle_notification(&mut self, notif: &JsonRpcNotification) {
        if notif.method == methods::INITIALIZED && self.state == ServerState::Initialising {
            self.state = ServerState::Running;
        }
    }

    fn handle_request(&mut self, req: JsonRpcRequest, out: &Replies) {
        let response = match req.method.as_str() {
            methods::INITIALIZE => self.handle_initialize(&req),
            methods::PING => JsonRpcResponse::success(req.id.clone(), json!({})),
            methods::TOOLS_LIST => self.handle_tools_list(&req),
            methods::RESOURCES_LIST => self.handle_resources_list(&req),
            methods::RESOURCES_READ => self.handle_resources_read(&req),
            methods::TOOLS_CALL => {
                if let Err(resp) = self.require_running(&req.id) {
                    resp
                } else {
                    let out = out.clone();
                    self.calls.spawn(async move { handle_tools_call(req, &out).await });
                    return;
                }
            }
            _ => JsonRpcResponse::method_not_found(req.id.clone(), &req.method),
        };
        reply(out, response);
    }

    fn handle_initialize(&mut self, req: &JsonRpcRequest) -> JsonRpcResponse {
        if self.state != ServerState::AwaitingInit {
            return JsonRpcResponse::error(
                Some(req.id.clone()),
                JsonRpcErrorData::new(
                    ErrorCode::InvalidRequest,
                    "Server already initialised",
                ),
            );
        }
        if req.params.is_none() {
            return JsonRpcResponse::invalid_params(req.id.clone(), "Missing initialize params");
        }

        self.state = ServerState::Initialising;
        JsonRpcResponse::success(
            req.id.clone(),
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {},
                    "resources": {}
                },
                "serverInfo": {
                    "name": FIXTURE_SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        )
    }

    /// Ensures the server is in the Running state.
    fn require_running(&self, id: &RequestId) -> Result<(), JsonRpcResponse> {
        if self.state != ServerState::Running {
            return Err(JsonRpcResponse::error(
                Some(id.clone()),
                JsonRpcErrorData::new(ErrorCode::InvalidRequest, "Server not initialised"),
            ));
        }
        Ok(())
    }

    fn handle_tools_list(&self, req: &JsonRpcRequest) -> JsonRpcResponse {
        if let Err(resp) = self.require_running(&req.id) {
            return resp;
        }
        self.paginate(req, "tools", tool_definitions())
    }

    fn handle_resources_list(&self, req: &JsonRpcRequest) -> JsonRpcResponse {
        if let Err(resp) = self.require_running(&req.id) {
            return resp;
        }
        let resources = vec![
            json!({
                "uri": GREETING_URI,
                "name": "greeting",
                "description": "A fixed greeting",
                "mimeType": "text/plain"
            }),
            json!({
                "uri": CONFIG_URI,
                "name": "config",
                "description": "The fixture's own options",
                "mimeType": "application/json"
            }),
        ];
        self.paginate(req, "resources", resources)
    }

    fn paginate<T: Serialize>(
        &self,
        req: &JsonRpcRequest,
        key: &str,
        items: Vec<T>,
    ) -> JsonRpcResponse {
        let params: ListParams = match req.params.clone() {
            Some(raw) => match serde_json::from_value(raw) {
                Ok(params) => params,
                Err(e) => {
                    return JsonRpcResponse::invalid_params(
                        req.id.clone(),
                        format!("Invalid list params: {e}"),
                    )
                }
            },
            None => ListParams::default(),
        };

        let start = match params.cursor.as_deref().map(str::parse::<usize>) {
            None => 0,
            Some(Ok(offset)) if offset <= items.len() => offset,
            Some(_) => {
                return JsonRpcResponse::invalid_params(req.id.clone(), "Invalid cursor");
            }
        };
        let page_size = self.options.page_size.unwrap_or(usize::MAX).max(1);
        let end = start.saturating_add(page_size).min(items.len());

        let mut result = serde_json::Map::new();
        let page: Vec<&T> = items[start..end].iter().collect();
        result.insert(key.to_string(), json!(page));
        if end < items.len() {
            result.insert("nextCursor".to_string(), json!(end.to_string()));
        }
        JsonRpcResponse::success(req.id.clone(), Value::Object(result))
    }

    fn handle_resources_read(&self, req: &JsonRpcRequest) -> JsonRpcResponse {
        if let Err(resp) = self.require_running(&req.id) {
            return resp;
        }
        let params: ReadParams = match req.params.clone().map(serde_json::from_value) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::invalid_params(
                    req.id.clone(),
                    format!("Invalid read params: {e}"),
                )
            }
            None => return JsonRpcResponse::invalid_params(req.id.clone(), "Missing read params"),
        };

        let contents = match params.uri.as_str() {
            GREETING_URI => json!({
                "uri": GREETING_URI,
                "mimeType": "text/plain",
                "text": std::env::var(GREETING_ENV).unwrap_or_else(|_| DEFAULT_GREETING.to_string())
            }),
            CONFIG_URI => json!({
                "uri": CONFIG_URI,
                "mimeType": "application/json",
                "text": serde_json::to_string(&self.options).unwrap_or_default()
            }),
            unknown => {
                return JsonRpcResponse::error(
                    Some(req.id.clone()),
                    JsonRpcErrorData::new(
                        ErrorCode::ResourceNotFound,
                        format!("Resource not found: {unknown}"),
                    )
                    .with_data(json!({"uri": unknown})),
                )
            }
        };
        JsonRpcResponse::success(req.id.clone(), json!({"contents": [contents]}))
    }
}

/// Handles one tools/call request; runs in its own task.
async fn handle_tools_call(req: JsonRpcRequest, out: &Replies) {
    let params: ToolCallParams = match req.params.clone().map(serde_json::from_value) {
        Some(Ok(params)) => params,
        Some(Err(e)) => {
            reply(
                out,
                JsonRpcResponse::invalid_params(req.id, format!("Invalid tool call params: {e}")),
            );
            return;
        }
        None => {
            reply(out, JsonRpcResponse::invalid_params(req.id, "Missing tool call params"));
            return;
        }
    };

    let args = &params.arguments;
    let result = match params.name.as_str() {
        "add" => call_add(args),
        "echo" => call_echo(args),
        "sleep" => call_sleep(args).await,
        "fail" => ToolCallResult::error(
            args.get("message")
                .and_then(Value::as_str)
                .unwrap_or("tool failed"),
        ),
        "crash" => {
            let code = args
                .get("code")
                .and_then(Value::as_i64)
                .and_then(|c| i32::try_from(c).ok())
                .unwrap_or(1);
            tracing::warn!(code, "crashing on request");
            std::process::exit(code);
        }
        "garbage" => {
            let _ = out.send(Outbound::Raw("this is not a json-rpc frame".to_string()));
            ToolCallResult::text("sent garbage")
        }
        "stray" => {
            reply(
                out,
                JsonRpcResponse::success(RequestId::Number(999_999), json!({"stray": true})),
            );
            ToolCallResult::text("sent stray response")
        }
        "ping_client" => {
            let _ = out.send(Outbound::Message(Message::Request(JsonRpcRequest::new(
                RequestId::String("fixture-ping".to_string()),
                methods::PING,
                None,
            ))));
            ToolCallResult::text("ping sent")
        }
        "log" => call_log(args, out),
        "env" => call_env(args),
        unknown => {
            reply(
                out,
                JsonRpcResponse::invalid_params(req.id, format!("Unknown tool: {unknown}")),
            );
            return;
        }
    };

    match serde_json::to_value(&result) {
        Ok(value) => reply(out, JsonRpcResponse::success(req.id, value)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialise tool call result");
            let message = "Internal error: failed to serialise result";
            reply(out, JsonRpcResponse::internal_error(req.id, message));
        }
    }
}

fn call_add(args: &Value) -> ToolCallResult {
    let (Some(a), Some(b)) = (args.get("a"), args.get("b")) else {
        return ToolCallResult::error("add requires numeric 'a' and 'b'");
    };
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a.checked_add(b).map_or_else(
            || ToolCallResult::error("integer overflow"),
            |sum| ToolCallResult::text(sum.to_string()),
        );
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => ToolCallResult::text((a + b).to_string()),
        _ => ToolCallResult::error("add requires numeric 'a' and 'b'"),
    }
}

fn call_echo(args: &Value) -> ToolCallResult {
    let Some(text) = args.get("text").and_then(Value::as_str) else {
        return ToolCallResult::error("echo requires a string 'text'");
    };
    ToolCallResult {
        structured_content: Some(json!({"text": text})),
        ..ToolCallResult::text(text)
    }
}

async fn call_sleep(args: &Value) -> ToolCallResult {
    let Some(ms) = args.get("ms").and_then(Value::as_u64) else {
        return ToolCallResult::error("sleep requires a non-negative integer 'ms'");
    };
    tokio::time::sleep(Duration::from_millis(ms)).await;
    ToolCallResult::text(format!("slept {ms}ms"))
}

fn call_log(args: &Value, out: &Replies) -> ToolCallResult {
    let message = args
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("log line");
    // stderr is the diagnostic channel; write it regardless of the log level.
    eprintln!("fixture log: {message}");
    let _ = out.send(Outbound::Message(Message::Notification(
        JsonRpcNotification::new(
            "notifications/message",
            Some(json!({"level": "info", "data": message})),
        ),
    )));
    ToolCallResult::text("logged")
}

fn call_env(args: &Value) -> ToolCallResult {
    let Some(name) = args.get("name").and_then(Value::as_str) else {
        return ToolCallResult::error("env requires a string 'name'");
    };
    std::env::var(name).map_or_else(
        |_| ToolCallResult::error(format!("{name} is not set")),
        ToolCallResult::text,
    )
}

fn tool_definitions() -> Vec<ToolDefinition> {
    let empty = || json!({"type": "object", "properties": {}});
    vec![
        ToolDefinition {
            name: "add",
            description: "Add two numbers and return the sum as text",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "a": {"type": "number"},
                    "b": {"type": "number"}
                },
                "required": ["a", "b"]
            }),
        },
        ToolDefinition {
            name: "echo",
            description: "Return the given text",
            input_schema: json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
        },
        ToolDefinition {
            name: "sleep",
            description: "Wait for the given number of milliseconds, then reply",
            input_schema: json!({
                "type": "object",
                "properties": {"ms": {"type": "integer", "minimum": 0}},
                "required": ["ms"]
            }),
        },
        ToolDefinition {
            name: "fail",
            description: "Report a tool error",
            input_schema: json!({
                "type": "object",
                "properties": {"message": {"type": "string"}}
            }),
        },
        ToolDefinition {
            name: "crash",
            description: "Exit the server process without replying",
            input_schema: json!({
                "type": "object",
                "properties": {"code": {"type": "integer"}}
            }),
        },
        ToolDefinition {
            name: "garbage",
            description: "Write a non-JSON line to stdout, then reply",
            input_schema: empty(),
        },
        ToolDefinition {
            name: "stray",
            description: "Write a response with an unknown id, then reply",
            input_schema: empty(),
        },
        ToolDefinition {
            name: "ping_client",
            description: "Send a ping request to the client, then reply",
            input_schema: empty(),
        },
        ToolDefinition {
            name: "log",
            description: "Write a line to stderr and a log notification to stdout",
            input_schema: json!({
                "type": "object",
                "properties": {"message": {"type": "string"}}
            }),
        },
        ToolDefinition {
            name: "env",
            description: "Return the value of an environment variable",
            input_schema: json!({
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"]
            }),
        },
    ]
}

async fn write_stdout(mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    let mut stdout = tokio::io::stdout();
    while let Some(item) = outbound.recv().await {
        let bytes = match item {
            Outbound::Message(message) => match encode_frame(&message) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialise message");
                    continue;
                }
            },
            Outbound::Raw(mut line) => {
                line.push('\n');
                line.into_bytes()
            }
        };
        if stdout.write_all(&bytes).await.is_err() || stdout.flush().await.is_err() {
            tracing::warn!("stdout closed, dropping output");
            return;
        }
    }
}
