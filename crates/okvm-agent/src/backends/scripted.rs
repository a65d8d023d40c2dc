use crate::model::{ModelClient, ModelReply, ModelRequest};
use async_trait::async_trait;
use okvm_core::{OkvmError, OkvmResult, ToolCall};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// One canned model exchange.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Stream `tokens`, then return `reply`.
    Reply {
        tokens: Vec<String>,
        reply: ModelReply,
    },
    /// Stream `tokens`, then never answer.
    Stall { tokens: Vec<String> },
    /// Fail the exchange.
    Fail(String),
}

impl ScriptStep {
    /// A final answer streamed word by word.
    pub fn text(text: &str) -> Self {
        Self::Reply {
            tokens: split_tokens(text),
            reply: ModelReply::Final(text.to_string()),
        }
    }

    /// A final answer returned in one piece, with nothing streamed.
    pub fn silent_text(text: &str) -> Self {
        Self::Reply {
            tokens: Vec::new(),
            reply: ModelReply::Final(text.to_string()),
        }
    }

    /// A single tool call with no accompanying text.
    pub fn tool(id: &str, name: &str, arguments: serde_json::Value) -> Self {
        Self::tools(
            None,
            vec![ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            }],
        )
    }

    /// Several tool calls, optionally preceded by streamed text.
    pub fn tools(content: Option<&str>, calls: Vec<ToolCall>) -> Self {
        Self::Reply {
            tokens: content.map(split_tokens).unwrap_or_default(),
            reply: ModelReply::ToolCalls {
                content: content.map(str::to_string),
                calls,
            },
        }
    }

    pub fn stall(tokens: &[&str]) -> Self {
        Self::Stall {
            tokens: tokens.iter().map(|t| (*t).to_string()).collect(),
        }
    }
}

/// Splits on spaces but keeps them, so the pieces concatenate back exactly.
fn split_tokens(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}

/// Deterministic [`ModelClient`] that plays back a fixed script.
///
/// Useful for offline runs and for tests that need exact control over what
/// the model says. Every request is recorded for later inspection.
pub struct ScriptedModel {
    steps: Mutex<VecDeque<ScriptStep>>,
    requests: Mutex<Vec<ModelRequest>>,
    calls: AtomicUsize,
    token_delay: Duration,
}

impl ScriptedModel {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            token_delay: Duration::ZERO,
        }
    }

    /// Pauses between streamed tokens.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Appends more steps to the script.
    pub fn push(&self, step: ScriptStep) {
        self.steps.lock().push_back(step);
    }

    /// Number of exchanges served so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Copies of every request received, in order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    async fn stream(&self, tokens: Vec<String>, deltas: &mpsc::Sender<String>) {
        for token in tokens {
            if !self.token_delay.is_zero() {
                tokio::time::sleep(self.token_delay).await;
            }
            if deltas.send(token).await.is_err() {
                break;
            }
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(
        &self,
        request: ModelRequest,
        deltas: mpsc::Sender<String>,
    ) -> OkvmResult<ModelReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);
        let step = self.steps.lock().pop_front();
        match step {
            Some(ScriptStep::Reply { tokens, reply }) => {
                self.stream(tokens, &deltas).await;
                Ok(reply)
            }
            Some(ScriptStep::Stall { tokens }) => {
                self.stream(tokens, &deltas).await;
                std::future::pending::<()>().await;
                Err(OkvmError::Model("stalled exchange resumed".into()))
            }
            Some(ScriptStep::Fail(message)) => Err(OkvmError::Model(message)),
            None => Err(OkvmError::Model("script exhausted".into())),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
