//! Model Context Protocol (MCP) client side, plus a reference server.
//!
//! The harness drives a server under test over stdio using JSON-RPC 2.0
//! messages, one per line.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Harness                             │
//! │                                                              │
//! │   ┌─────────────┐    ┌─────────────┐    ┌───────────────┐    │
//! │   │  McpClient  │───▶│  Transport  │───▶│  FrameCodec   │    │
//! │   │ (operations)│    │ (in-flight) │    │ (line framing)│    │
//! │   └─────────────┘    └─────────────┘    └───────────────┘    │
//! │                             │                  │             │
//! │                             ▼                  ▼             │
//! │                    ┌─────────────────────────────────┐       │
//! │                    │  child process stdin / stdout   │       │
//! │                    └─────────────────────────────────┘       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol Version
//!
//! The handshake requests MCP protocol version 2024-11-05.

pub mod client;
pub mod codec;
pub mod protocol;
pub mod schema;
pub mod server;
pub mod transport;
pub mod types;

pub use client::McpClient;
pub use codec::{Frame, FrameCodec};
pub use protocol::{JsonRpcRequest, JsonRpcResponse, Message, MCP_PROTOCOL_VERSION};
pub use transport::{PendingRequest, ProcessExit, ProcessTransport, ProtocolViolation};
pub use types::{CallResult, Content, ReadResult, Resource, Tool};
