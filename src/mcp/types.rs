//! Typed payloads exchanged with the server under test.
//!
//! Tool arguments and structured results stay as opaque [`serde_json::Value`]s;
//! only the envelopes the harness needs to inspect are typed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{HarnessError, HarnessResult};

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// A tool exposed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's input parameters.
    #[serde(default = "empty_object")]
    pub input_schema: Value,
    /// Any further fields the server sent (annotations, output schema, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A resource exposed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Unique resource URI.
    pub uri: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Remaining metadata.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// One content item in a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// Text content.
    Text {
        /// The text.
        text: String,
    },
    /// Base64-encoded image.
    Image {
        /// Base64 data.
        data: String,
        /// MIME type.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Base64-encoded audio.
    Audio {
        /// Base64 data.
        data: String,
        /// MIME type.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Embedded resource contents.
    Resource {
        /// The embedded resource.
        resource: ResourceContents,
    },
    /// Link to a resource.
    ResourceLink {
        /// Linked URI.
        uri: String,
        /// Remaining fields.
        #[serde(flatten)]
        metadata: Map<String, Value>,
    },
}

impl Content {
    /// Returns the text of a text item.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Result of a `tools/call` request.
///
/// A result with `is_error` set is a tool-level failure reported by the
/// server, distinct from a transport failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResult {
    /// Content returned by the tool.
    #[serde(default)]
    pub content: Vec<Content>,
    /// Whether the tool reported an error.
    #[serde(default)]
    pub is_error: bool,
    /// Optional structured result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl CallResult {
    /// Concatenates all text items, one per line.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(Content::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Converts a tool-reported error into [`HarnessError::ToolExecution`].
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::ToolExecution`] if the server flagged the result as an error.
    pub fn into_success(self, tool: &str) -> HarnessResult<Vec<Content>> {
        if self.is_error {
            return Err(HarnessError::ToolExecution {
                tool: tool.to_string(),
                message: self.text(),
            });
        }
        Ok(self.content)
    }
}

/// Contents of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    /// Resource URI.
    pub uri: String,
    /// MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Text contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 binary contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// Result of a `resources/read` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadResult {
    /// The contents (a resource may expand to several parts).
    pub contents: Vec<ResourceContents>,
}

impl ReadResult {
    /// Returns the text of the first text part.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.contents.iter().find_map(|c| c.text.as_deref())
    }
}

/// Name and version of a protocol peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Peer name.
    pub name: String,
    /// Peer version.
    #[serde(default)]
    pub version: String,
}

/// Server reply to `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol version chosen by the server.
    pub protocol_version: String,
    /// Advertised capabilities.
    #[serde(default)]
    pub capabilities: Value,
    /// Server identification.
    pub server_info: Implementation,
    /// Optional usage instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// One page of `tools/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListToolsPage {
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// One page of `resources/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListResourcesPage {
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}
