use crate::error::OkvmError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A request from the model to invoke a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier assigned to this call (by the model, or generated).
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// JSON object passed to the tool.
    pub arguments: serde_json::Value,
}

/// Error payload of a failed tool call: `{kind, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    /// Stable snake_case error kind.
    pub kind: String,
    /// Human readable description, shown to the model.
    pub message: String,
}

impl ToolFailure {
    /// Creates a failure with an explicit kind.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&OkvmError> for ToolFailure {
    fn from(err: &OkvmError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

/// Either the JSON value a tool produced or the reason it failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    /// The tool completed; the value is handed back to the model.
    Result(serde_json::Value),
    /// The tool failed; the turn continues with this error visible to the model.
    Error(ToolFailure),
}

/// The result of executing one [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The ID of the [`ToolCall`] this result corresponds to.
    pub call_id: String,
    /// Result value or error payload.
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

impl ToolResult {
    /// Creates a successful tool result.
    pub fn success(call_id: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            call_id: call_id.into(),
            outcome: ToolOutcome::Result(value),
        }
    }

    /// Creates an error tool result.
    pub fn failure(
        call_id: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            outcome: ToolOutcome::Error(ToolFailure::new(kind, message)),
        }
    }

    /// Creates an error tool result from a runtime error.
    pub fn from_error(call_id: impl Into<String>, err: &OkvmError) -> Self {
        Self {
            call_id: call_id.into(),
            outcome: ToolOutcome::Error(ToolFailure::from(err)),
        }
    }

    /// Whether the tool execution ended in an error.
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }

    /// The `{result}` / `{error: {kind, message}}` payload without the call id.
    pub fn to_payload(&self) -> serde_json::Value {
        match &self.outcome {
            ToolOutcome::Result(value) => serde_json::json!({ "result": value }),
            ToolOutcome::Error(failure) => serde_json::json!({ "error": failure }),
        }
    }
}

/// One tool invocation as recorded in an execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Call identifier.
    pub call_id: String,
    /// Tool name.
    pub name: String,
    /// Arguments the tool was invoked with.
    pub arguments: serde_json::Value,
    /// What came back.
    pub outcome: ToolOutcome,
    /// When dispatch started.
    pub started_at: DateTime<Utc>,
    /// When the result (or error) was available.
    pub ended_at: DateTime<Utc>,
}

impl ToolInvocation {
    /// Builds a record from the call, its result and the dispatch window.
    pub fn new(
        call: &ToolCall,
        result: &ToolResult,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            outcome: result.outcome.clone(),
            started_at,
            ended_at,
        }
    }

    /// Wall-clock duration of the invocation in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_result_success_payload() {
        let result = ToolResult::success("call_1", serde_json::json!("output"));
        assert!(!result.is_error());
        assert_eq!(result.to_payload(), serde_json::json!({"result": "output"}));
    }

    #[test]
    fn test_tool_result_error_payload() {
        let result = ToolResult::failure("call_1", "quota_exceeded", "too big");
        assert!(result.is_error());
        let payload = result.to_payload();
        assert_eq!(payload["error"]["kind"], "quota_exceeded");
        assert_eq!(payload["error"]["message"], "too big");
    }

    #[test]
    fn test_tool_result_wire_shape_is_flat() {
        let result = ToolResult::success("c9", serde_json::json!({"bytes": 2}));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["call_id"], "c9");
        assert_eq!(json["result"]["bytes"], 2);

        let back: ToolResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_failure_from_error_uses_kind() {
        let err = OkvmError::SandboxViolation("../etc/passwd".into());
        let result = ToolResult::from_error("c1", &err);
        match result.outcome {
            ToolOutcome::Error(f) => {
                assert_eq!(f.kind, "sandbox_violation");
                assert!(f.message.contains("../etc/passwd"));
            }
            ToolOutcome::Result(_) => panic!("expected error outcome"),
        }
    }
}
