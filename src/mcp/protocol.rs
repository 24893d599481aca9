//! JSON-RPC 2.0 messages as spoken over an MCP stdio channel.
//!
//! Both ends of the harness share this model: the client half that drives a
//! server under test, and the fixture server used by the test suite.
//!
//! A decoded line is one of three shapes:
//!
//! - a request, which carries an `id` and a `method`
//! - a notification, which has a `method` but no `id`
//! - a response, which echoes an `id` and holds a `result` or an `error`
//!
//! IDs are integers or strings. `null` only appears on error replies to input
//! whose ID could not be recovered.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol revision the harness offers in `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Revisions accepted back from a server.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &[MCP_PROTOCOL_VERSION, "2025-03-26", "2025-06-18"];

/// `clientInfo.name` sent in `initialize`.
pub const CLIENT_NAME: &str = "mcp-harness";

/// Method names used by the harness.
pub mod methods {
    /// Handshake request.
    pub const INITIALIZE: &str = "initialize";
    /// Handshake completion notification.
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Liveness probe.
    pub const PING: &str = "ping";
    /// Tool listing.
    pub const TOOLS_LIST: &str = "tools/list";
    /// Tool invocation.
    pub const TOOLS_CALL: &str = "tools/call";
    /// Resource listing.
    pub const RESOURCES_LIST: &str = "resources/list";
    /// Resource read.
    pub const RESOURCES_READ: &str = "resources/read";
}

const VERSION: &str = "2.0";

/// Correlates a response with its request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer ID, as the harness allocates them.
    Number(i64),
    /// Opaque string ID.
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(value) => value.fmt(f),
            Self::String(value) => f.write_str(value),
        }
    }
}

/// A call that expects a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol marker, always `"2.0"` once parsed.
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Builds a request.
    #[must_use]
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: VERSION.to_owned(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A one-way message; nothing is sent back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Protocol marker, always `"2.0"` once parsed.
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Builds a notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: VERSION.to_owned(),
            method: method.into(),
            params,
        }
    }
}

/// Error codes the harness distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// -32700
    ParseError,
    /// -32600
    InvalidRequest,
    /// -32601
    MethodNotFound,
    /// -32602
    InvalidParams,
    /// -32603
    InternalError,
    /// -32002, MCP's "resource not found".
    ResourceNotFound,
    /// Anything else, kept verbatim.
    ServerError(i64),
}

impl ErrorCode {
    const KNOWN: [(Self, i64, &'static str); 6] = [
        (Self::ParseError, -32700, "Parse error"),
        (Self::InvalidRequest, -32600, "Invalid Request"),
        (Self::MethodNotFound, -32601, "Method not found"),
        (Self::InvalidParams, -32602, "Invalid params"),
        (Self::InternalError, -32603, "Internal error"),
        (Self::ResourceNotFound, -32002, "Resource not found"),
    ];

    /// Numeric value on the wire.
    #[must_use]
    pub fn code(self) -> i64 {
        if let Self::ServerError(raw) = self {
            return raw;
        }
        Self::KNOWN
            .iter()
            .find(|(kind, _, _)| *kind == self)
            .map_or(0, |(_, raw, _)| *raw)
    }

    /// Classifies a numeric code.
    #[must_use]
    pub fn from_code(raw: i64) -> Self {
        Self::KNOWN
            .iter()
            .find(|(_, known, _)| *known == raw)
            .map_or(Self::ServerError(raw), |(kind, _, _)| *kind)
    }

    /// Message used when no more specific one is given.
    #[must_use]
    pub fn default_message(self) -> &'static str {
        Self::KNOWN
            .iter()
            .find(|(kind, _, _)| *kind == self)
            .map_or("Server error", |(_, _, text)| text)
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorData {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorData {
    /// Error object with an explicit message.
    #[must_use]
    pub fn new(kind: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: kind.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Attaches a `data` payload.
    #[must_use]
    pub fn with_data(self, data: Value) -> Self {
        Self {
            data: Some(data),
            ..self
        }
    }

    /// Typed view of `code`.
    #[must_use]
    pub fn kind(&self) -> ErrorCode {
        ErrorCode::from_code(self.code)
    }
}

impl From<ErrorCode> for JsonRpcErrorData {
    fn from(kind: ErrorCode) -> Self {
        Self::new(kind, kind.default_message())
    }
}

/// A reply: exactly one of a result or an error.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    /// Echoed request ID; `None` when the request's ID was unreadable.
    pub id: Option<RequestId>,
    pub outcome: Result<Value, JsonRpcErrorData>,
}

impl JsonRpcResponse {
    /// Successful reply.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Ok(result),
        }
    }

    /// Failed reply.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn error(id: Option<RequestId>, error: JsonRpcErrorData) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    /// -32700 with a null ID.
    #[must_use]
    pub fn parse_error() -> Self {
        Self::error(None, ErrorCode::ParseError.into())
    }

    /// -32600 for a message that is JSON but not JSON-RPC.
    #[must_use]
    pub fn invalid_request(id: Option<RequestId>) -> Self {
        Self::error(id, ErrorCode::InvalidRequest.into())
    }

    /// -32601 naming the unknown method.
    #[must_use]
    pub fn method_not_found(id: RequestId, method: &str) -> Self {
        let message = format!("{}: {method}", ErrorCode::MethodNotFound.default_message());
        Self::error(Some(id), JsonRpcErrorData::new(ErrorCode::MethodNotFound, message))
    }

    /// -32602 with a custom message.
    #[must_use]
    pub fn invalid_params(id: RequestId, message: impl Into<String>) -> Self {
        Self::error(Some(id), JsonRpcErrorData::new(ErrorCode::InvalidParams, message))
    }

    /// -32603 with a custom message.
    #[must_use]
    pub fn internal_error(id: RequestId, message: impl Into<String>) -> Self {
        Self::error(Some(id), JsonRpcErrorData::new(ErrorCode::InternalError, message))
    }

    /// Wire form of this reply.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let id = self
            .id
            .as_ref()
            .and_then(|id| serde_json::to_value(id).ok())
            .unwrap_or(Value::Null);
        let (key, body) = match &self.outcome {
            Ok(result) => ("result", result.clone()),
            Err(error) => ("error", serde_json::to_value(error).unwrap_or(Value::Null)),
        };

        let mut fields = Map::with_capacity(3);
        fields.insert("jsonrpc".to_owned(), Value::from(VERSION));
        fields.insert("id".to_owned(), id);
        fields.insert(key.to_owned(), body);
        Value::Object(fields)
    }
}

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl Message {
    /// Method of a request or notification.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(request) => Some(&request.method),
            Self::Notification(notification) => Some(&notification.method),
            Self::Response(_) => None,
        }
    }

    /// ID of a request or response.
    #[must_use]
    pub const fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(request) => Some(&request.id),
            Self::Response(response) => response.id.as_ref(),
            Self::Notification(_) => None,
        }
    }

    /// Wire form of this message.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let encoded = match self {
            Self::Request(request) => serde_json::to_value(request),
            Self::Notification(notification) => serde_json::to_value(notification),
            Self::Response(response) => return response.to_value(),
        };
        encoded.unwrap_or(Value::Null)
    }
}

/// Why a line could not be turned into a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not JSON, or not UTF-8.
    Syntax(String),
    /// JSON, but not a JSON-RPC 2.0 message.
    Invalid {
        /// ID salvaged from the object, so a server can still address its reply.
        id: Option<RequestId>,
        reason: String,
    },
}

impl FrameError {
    fn invalid(id: Option<RequestId>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            id,
            reason: reason.into(),
        }
    }

    /// Code a server replies with.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Syntax(_) => ErrorCode::ParseError,
            Self::Invalid { .. } => ErrorCode::InvalidRequest,
        }
    }

    /// Reply a server sends for this line.
    #[must_use]
    pub fn to_response(&self) -> JsonRpcResponse {
        match self {
            Self::Syntax(_) => JsonRpcResponse::parse_error(),
            Self::Invalid { id, .. } => JsonRpcResponse::invalid_request(id.clone()),
        }
    }
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax(detail) => write!(f, "malformed JSON: {detail}"),
            Self::Invalid { reason, .. } => write!(f, "invalid JSON-RPC message: {reason}"),
        }
    }
}

impl std::error::Error for FrameError {}

fn read_id(fields: &Map<String, Value>) -> Result<Option<RequestId>, FrameError> {
    match fields.get("id") {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|_| FrameError::invalid(None, "id must be a string or an integer")),
    }
}

fn read_params(fields: &mut Map<String, Value>) -> Option<Value> {
    fields.remove("params")
}

/// Classifies one line of text.
///
/// # Errors
///
/// [`FrameError::Syntax`] when the text is not JSON, [`FrameError::Invalid`]
/// when it is JSON but not a JSON-RPC 2.0 message.
pub fn parse_message(text: &str) -> Result<Message, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(|e| FrameError::Syntax(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(FrameError::invalid(None, "message must be a JSON object"));
    };

    let id = read_id(&fields)?;
    match fields.get("jsonrpc").and_then(Value::as_str) {
        Some(VERSION) => {}
        Some(_) => return Err(FrameError::invalid(id, "jsonrpc field must be \"2.0\"")),
        None => return Err(FrameError::invalid(id, "missing jsonrpc field")),
    }

    if let Some(method) = fields.remove("method") {
        let Value::String(method) = method else {
            return Err(FrameError::invalid(id, "method must be a string"));
        };
        if method.is_empty() {
            return Err(FrameError::invalid(id, "method must not be empty"));
        }
        let params = read_params(&mut fields);
        return Ok(match id {
            Some(id) => Message::Request(JsonRpcRequest::new(id, method, params)),
            None => Message::Notification(JsonRpcNotification::new(method, params)),
        });
    }

    let outcome = match (fields.remove("result"), fields.remove("error")) {
        (Some(result), None) => Ok(result),
        (None, Some(error)) => match serde_json::from_value::<JsonRpcErrorData>(error) {
            Ok(error) => Err(error),
            Err(e) => {
                let reason = format!("malformed error object: {e}");
                return Err(FrameError::invalid(id, reason));
            }
        },
        (Some(_), Some(_)) => {
            return Err(FrameError::invalid(id, "response carries both result and error"));
        }
        (None, None) => {
            return Err(FrameError::invalid(id, "message has neither method, result nor error"));
        }
    };

    if id.is_none() && outcome.is_ok() {
        return Err(FrameError::invalid(None, "success response without id"));
    }
    Ok(Message::Response(JsonRpcResponse { id, outcome }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(text: &str) -> JsonRpcResponse {
        match parse_message(text) {
            Ok(Message::Response(response)) => response,
            other => panic!("not a response: {other:?}"),
        }
    }

    #[test]
    fn requests_and_notifications_split_on_id() {
        let request =
            parse_message(r#"{"jsonrpc":"2.0","id":"call-7","method":"tools/list"}"#).unwrap();
        assert_eq!(request.id(), Some(&RequestId::String("call-7".into())));
        assert_eq!(request.method(), Some("tools/list"));

        let text = r#"{"jsonrpc":"2.0","id":null,"method":"notifications/message"}"#;
        let notification = parse_message(text).unwrap();
        assert!(matches!(notification, Message::Notification(_)));
        assert_eq!(notification.id(), None);
    }

    #[test]
    fn params_are_kept_verbatim() {
        let text = r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"add"}}"#;
        let Message::Request(request) = parse_message(text).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(request.params, Some(json!({"name": "add"})));
    }

    #[test]
    fn null_result_counts_as_success() {
        let reply = response(r#"{"jsonrpc":"2.0","id":4,"result":null}"#);
        assert_eq!(reply.outcome, Ok(Value::Null));
    }

    #[test]
    fn error_reply_may_have_null_id() {
        let reply =
            response(r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"bad"}}"#);
        assert_eq!(reply.id, None);
        assert_eq!(reply.outcome.unwrap_err().kind(), ErrorCode::ParseError);
    }

    #[test]
    fn success_reply_needs_an_id() {
        let err = parse_message(r#"{"jsonrpc":"2.0","result":{}}"#).unwrap_err();
        assert_eq!(err, FrameError::invalid(None, "success response without id"));
    }

    #[test]
    fn invalid_messages_keep_salvaged_id() {
        for text in [
            r#"{"id":11,"method":"ping"}"#,
            r#"{"jsonrpc":"1.0","id":11,"method":"ping"}"#,
            r#"{"jsonrpc":"2.0","id":11,"method":42}"#,
            r#"{"jsonrpc":"2.0","id":11,"result":1,"error":{"code":1,"message":"x"}}"#,
        ] {
            let err = parse_message(text).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidRequest, "{text}");
            assert_eq!(err.to_response().id, Some(RequestId::Number(11)), "{text}");
        }
    }

    #[test]
    fn non_json_maps_to_parse_error_reply() {
        let err = parse_message("ok then").unwrap_err();
        let reply = err.to_response().to_value();
        assert_eq!(reply["id"], Value::Null);
        assert_eq!(reply["error"]["code"], -32700);
    }

    #[test]
    fn replies_carry_only_one_outcome_member() {
        let ok = JsonRpcResponse::success(RequestId::Number(3), json!({"tools": []})).to_value();
        assert_eq!(ok, json!({"jsonrpc": "2.0", "id": 3, "result": {"tools": []}}));

        let failed =
            JsonRpcResponse::method_not_found(RequestId::Number(3), "tools/frobnicate").to_value();
        assert!(failed.get("result").is_none());
        assert_eq!(failed["error"]["code"], -32601);
        assert_eq!(failed["error"]["message"], "Method not found: tools/frobnicate");
    }

    #[test]
    fn encoded_request_parses_back() {
        let original = JsonRpcRequest::new(
            RequestId::Number(9),
            "tools/call",
            Some(json!({"name": "add"})),
        );
        let text = serde_json::to_string(&Message::Request(original.clone()).to_value()).unwrap();
        assert_eq!(parse_message(&text).unwrap(), Message::Request(original));
    }

    #[test]
    fn error_codes_classify_numbers() {
        assert_eq!(ErrorCode::from_code(-32002), ErrorCode::ResourceNotFound);
        assert_eq!(ErrorCode::from_code(-32000), ErrorCode::ServerError(-32000));
        assert_eq!(ErrorCode::InvalidParams.code(), -32602);
        assert_eq!(ErrorCode::ServerError(-1).code(), -1);
        assert_eq!(ErrorCode::ServerError(-1).default_message(), "Server error");
        assert_eq!(RequestId::Number(42).to_string(), "42");
    }
}
