//! Explicit validation of tool arguments against a declared input schema.
//!
//! Validation never runs implicitly on `tools/call`; callers opt in through
//! [`crate::mcp::McpClient::validate_tool_arguments`] or [`validate_arguments`].

use jsonschema::draft202012;
use serde_json::Value;

use crate::error::{HarnessError, HarnessResult};
use crate::mcp::types::Tool;

/// Validates `arguments` against the tool's input schema (JSON Schema draft 2020-12).
///
/// # Errors
///
/// - [`HarnessError::InvalidArguments`] listing every validation failure.
/// - [`HarnessError::Protocol`] if the server declared a schema that does not compile.
pub fn validate_arguments(tool: &Tool, arguments: &Value) -> HarnessResult<()> {
    let validator = draft202012::new(&tool.input_schema).map_err(|error| {
        HarnessError::protocol(format!(
            "tool '{}' declares an invalid input schema: {error}",
            tool.name
        ))
    })?;

    let errors: Vec<String> = validator
        .iter_errors(arguments)
        .map(|error| {
            let path = error.instance_path.to_string();
            if path.is_empty() {
                error.to_string()
            } else {
                format!("{path}: {error}")
            }
        })
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(HarnessError::InvalidArguments {
            tool: tool.name.clone(),
            errors,
        })
    }
}
