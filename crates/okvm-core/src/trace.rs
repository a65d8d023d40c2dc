use crate::tool::ToolInvocation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal status of one conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// The model produced a final answer.
    Completed,
    /// The caller disconnected, aborted, or the turn hit its deadline.
    Interrupted,
    /// The turn could not run (model unavailable, lock violation, ...).
    Failed,
}

impl TurnStatus {
    /// Completed and interrupted turns are persisted; failed turns are not.
    pub fn is_persisted(self) -> bool {
        !matches!(self, TurnStatus::Failed)
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TurnStatus::Completed => "completed",
            TurnStatus::Interrupted => "interrupted",
            TurnStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One entry in an [`ExecutionTrace`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum TraceStep {
    /// A round trip to the model capability.
    ModelExchange {
        /// Zero-based position of this call within the turn.
        index: usize,
        /// How many tool calls the reply asked for.
        tool_calls_requested: usize,
        /// Characters of assistant text the reply carried.
        text_chars: usize,
        /// When the request was sent.
        started_at: DateTime<Utc>,
        /// When the reply (or failure) came back.
        ended_at: DateTime<Utc>,
    },
    /// A dispatched tool call.
    ToolCall(ToolInvocation),
}

/// Ordered record of everything a single turn did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    /// Trace identifier, reported to the caller as `trace_id`.
    pub id: Uuid,
    /// Model exchanges and tool calls in execution order.
    pub steps: Vec<TraceStep>,
    /// When the turn started.
    pub started_at: DateTime<Utc>,
    /// When the turn reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionTrace {
    /// Starts an empty trace stamped with the current time.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            steps: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Appends a step.
    pub fn push(&mut self, step: TraceStep) {
        self.steps.push(step);
    }

    /// Stamps the end of the turn.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Iterator over the tool invocations in order.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.steps.iter().filter_map(|step| match step {
            TraceStep::ToolCall(inv) => Some(inv),
            TraceStep::ModelExchange { .. } => None,
        })
    }

    /// Number of tool calls dispatched during the turn.
    pub fn tool_call_count(&self) -> usize {
        self.tool_calls().count()
    }

    /// Number of model round trips.
    pub fn model_exchange_count(&self) -> usize {
        self.steps.len() - self.tool_call_count()
    }
}

impl Default for ExecutionTrace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::tool::{ToolCall, ToolResult};

    fn invocation(id: &str) -> ToolInvocation {
        let call = ToolCall {
            id: id.into(),
            name: "write_file".into(),
            arguments: serde_json::json!({"path": "a.txt", "content": "x"}),
        };
        let result = ToolResult::success(id, serde_json::json!({"bytes_written": 1}));
        let now = Utc::now();
        ToolInvocation::new(&call, &result, now, now)
    }

    #[test]
    fn counts_tool_calls_and_exchanges() {
        let mut trace = ExecutionTrace::new();
        let now = Utc::now();
        trace.push(TraceStep::ModelExchange {
            index: 0,
            tool_calls_requested: 2,
            text_chars: 0,
            started_at: now,
            ended_at: now,
        });
        trace.push(TraceStep::ToolCall(invocation("c1")));
        trace.push(TraceStep::ToolCall(invocation("c2")));
        trace.finish();

        assert_eq!(trace.tool_call_count(), 2);
        assert_eq!(trace.model_exchange_count(), 1);
        let ids: Vec<_> = trace.tool_calls().map(|i| i.call_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert!(trace.finished_at.is_some());
    }

    #[test]
    fn trace_serializes_with_step_tags() {
        let mut trace = ExecutionTrace::new();
        trace.push(TraceStep::ToolCall(invocation("c1")));
        let json = serde_json::to_value(&trace).unwrap();
        assert_eq!(json["steps"][0]["step"], "tool_call");
        assert_eq!(json["steps"][0]["name"], "write_file");

        let back: ExecutionTrace = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, trace.id);
        assert_eq!(back.tool_call_count(), 1);
    }

    #[test]
    fn failed_turns_are_not_persisted() {
        assert!(TurnStatus::Completed.is_persisted());
        assert!(TurnStatus::Interrupted.is_persisted());
        assert!(!TurnStatus::Failed.is_persisted());
        assert_eq!(TurnStatus::Interrupted.to_string(), "interrupted");
    }
}
