#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::Utc;
use okvm_core::*;

// ---------------------------------------------------------------------------
// 1. Message serialization roundtrip
// ---------------------------------------------------------------------------

#[test]
fn message_serialization_roundtrip() {
    let mut msg = Message::user("Hello, okvm!");
    msg.metadata.insert(
        "source".to_string(),
        serde_json::Value::String("test".to_string()),
    );

    let json = serde_json::to_string(&msg).unwrap();
    let deserialized: Message = serde_json::from_str(&json).unwrap();

    assert_eq!(deserialized.id, msg.id);
    assert_eq!(deserialized.role, Role::User);
    assert_eq!(deserialized.content, "Hello, okvm!");
    assert_eq!(deserialized.timestamp, msg.timestamp);
    assert_eq!(
        deserialized.metadata.get("source"),
        Some(&serde_json::Value::String("test".to_string()))
    );
}

// ---------------------------------------------------------------------------
// 2. ToolCall -> ToolResult -> history message
// ---------------------------------------------------------------------------

#[test]
fn tool_call_to_history_flow() {
    let call = ToolCall {
        id: "call_abc123".to_string(),
        name: "write_file".to_string(),
        arguments: serde_json::json!({"path": "notes.txt", "content": "hi"}),
    };
    let request = Message::tool_request("", call.clone());
    assert_eq!(request.role, Role::Assistant);
    assert_eq!(request.tool_call.as_ref().unwrap().name, "write_file");

    let ok = ToolResult::success(&call.id, serde_json::json!({"path": "notes.txt"}));
    let reply = Message::tool_result(&ok);
    assert_eq!(reply.tool_call_id.as_deref(), Some("call_abc123"));
    assert!(reply.content.contains("\"result\""));

    let err = OkvmError::QuotaExceeded {
        requested: 2048,
        quota: 1024,
    };
    let failed = ToolResult::from_error(&call.id, &err);
    let payload = failed.to_payload();
    assert_eq!(payload["error"]["kind"], "quota_exceeded");
    assert!(payload.get("result").is_none());
}

// ---------------------------------------------------------------------------
// 3. Execution trace carries invocations
// ---------------------------------------------------------------------------

#[test]
fn trace_records_invocation_window() {
    let call = ToolCall {
        id: "c1".into(),
        name: "read_file".into(),
        arguments: serde_json::json!({"path": "a"}),
    };
    let result = ToolResult::failure("c1", "not_found", "a");
    let start = Utc::now();
    let end = start + chrono::Duration::milliseconds(15);

    let mut trace = ExecutionTrace::default();
    trace.push(TraceStep::ToolCall(ToolInvocation::new(
        &call, &result, start, end,
    )));

    let inv = trace.tool_calls().next().unwrap();
    assert_eq!(inv.duration_ms(), 15);
    assert!(matches!(inv.outcome, ToolOutcome::Error(ref f) if f.kind == "not_found"));
}

// ---------------------------------------------------------------------------
// 4. Error kinds are stable on the wire
// ---------------------------------------------------------------------------

#[test]
fn error_kinds_cover_taxonomy() {
    let cases = [
        (OkvmError::SandboxViolation("x".into()), "sandbox_violation"),
        (OkvmError::ToolExecution("x".into()), "tool_execution_error"),
        (OkvmError::TurnInProgress("x".into()), "turn_in_progress"),
        (OkvmError::Interrupted("x".into()), "interrupted"),
        (OkvmError::ResourceExhausted("x".into()), "resource_exhausted"),
        (OkvmError::Persistence("x".into()), "persistence_error"),
    ];
    for (err, kind) in cases {
        assert_eq!(err.kind(), kind);
    }
}
