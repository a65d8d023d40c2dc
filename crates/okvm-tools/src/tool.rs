use async_trait::async_trait;
use okvm_core::{OkvmError, OkvmResult};
use serde::{Deserialize, Serialize};

/// Metadata describing a tool's interface, as shown to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// A capability the agent can invoke by name.
///
/// Tools receive the raw JSON arguments and return a JSON value. Errors are
/// not fatal to the turn: the registry turns them into `{error: {kind,
/// message}}` payloads for the model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn invoke(&self, arguments: &serde_json::Value) -> OkvmResult<serde_json::Value>;
}

/// Fetches a required string argument.
pub fn required_str<'a>(arguments: &'a serde_json::Value, key: &str) -> OkvmResult<&'a str> {
    arguments
        .get(key)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| OkvmError::ToolExecution(format!("missing required string argument '{key}'")))
}

/// Fetches an optional string argument.
pub fn optional_str<'a>(arguments: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    arguments.get(key).and_then(serde_json::Value::as_str)
}

/// Fetches an optional boolean argument, defaulting to `false`.
pub fn flag(arguments: &serde_json::Value, key: &str) -> bool {
    arguments
        .get(key)
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

/// Fetches an optional non-negative integer argument.
pub fn optional_usize(arguments: &serde_json::Value, key: &str) -> OkvmResult<Option<usize>> {
    match arguments.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| OkvmError::ToolExecution(format!("'{key}' must be a non-negative integer"))),
    }
}
