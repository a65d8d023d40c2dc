use crate::tool::{Tool, ToolDescriptor};
use okvm_core::{ToolCall, ToolResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The tool catalog bound to one session's workspace.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.descriptor().name.clone();
        info!(tool = %name, "Registered tool");
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Descriptors sorted by name, so the catalog the model sees is stable.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> =
            self.tools.values().map(|t| t.descriptor().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Runs a call under `timeout`.
    ///
    /// Never fails: unknown tools, bad arguments, timeouts and tool errors
    /// all come back as error results the model can react to.
    pub async fn invoke(&self, call: &ToolCall, timeout: Duration) -> ToolResult {
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "Unknown tool requested");
            return ToolResult::failure(
                &call.id,
                "unknown_tool",
                format!("Unknown tool: {}", call.name),
            );
        };
        if !call.arguments.is_object() {
            return ToolResult::failure(
                &call.id,
                "invalid_arguments",
                "tool arguments must be a JSON object",
            );
        }

        match tokio::time::timeout(timeout, tool.invoke(&call.arguments)).await {
            Ok(Ok(value)) => ToolResult::success(&call.id, value),
            Ok(Err(err)) => {
                warn!(tool = %call.name, kind = err.kind(), error = %err, "Tool call failed");
                ToolResult::from_error(&call.id, &err)
            }
            Err(_) => {
                warn!(tool = %call.name, timeout_secs = timeout.as_secs_f64(), "Tool call timed out");
                ToolResult::failure(
                    &call.id,
                    "timeout",
                    format!("{} did not finish within {:?}", call.name, timeout),
                )
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
