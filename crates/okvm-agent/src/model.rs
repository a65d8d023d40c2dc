use async_trait::async_trait;
use okvm_core::{Message, OkvmResult, ToolCall};
use okvm_tools::ToolDescriptor;
use tokio::sync::mpsc;

/// Everything the model sees for one exchange.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub tools: Vec<ToolDescriptor>,
    /// Full history, ending with the new user input and any tool results.
    pub history: Vec<Message>,
}

/// What the model answered.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    /// A final assistant message; the turn is done.
    Final(String),
    /// A request to run tools, optionally with some text first.
    ToolCalls {
        content: Option<String>,
        calls: Vec<ToolCall>,
    },
}

impl ModelReply {
    /// Assistant text carried by the reply, if any.
    pub fn text(&self) -> &str {
        match self {
            ModelReply::Final(text) => text,
            ModelReply::ToolCalls { content, .. } => content.as_deref().unwrap_or_default(),
        }
    }
}

/// The language-model capability.
///
/// Implementations stream partial text through `deltas` as it is generated
/// and return the aggregated reply. Sending on `deltas` is optional; a
/// backend that cannot stream may return the whole text at once.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        request: ModelRequest,
        deltas: mpsc::Sender<String>,
    ) -> OkvmResult<ModelReply>;

    /// Short name used in logs.
    fn name(&self) -> &str {
        "model"
    }
}
