use crate::config::ExecutorConfig;
use crate::model::{ModelClient, ModelReply, ModelRequest};
use crate::stream::{EventSink, StreamEvent, ToolState};
use chrono::Utc;
use okvm_core::{
    ExecutionTrace, Message, OkvmError, Role, ToolCall, ToolInvocation, ToolResult, TraceStep,
    TurnStatus,
};
use okvm_tools::ToolRegistry;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Text emitted between the answers of successive model calls in one turn.
pub const SEGMENT_SEPARATOR: &str = "\n\n";

/// Phases of the per-turn state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Started,
    ModelCall,
    ToolDispatch,
    Completed,
    Interrupted,
    Failed,
}

/// Everything a finished turn produced.
#[derive(Debug)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    /// New history entries: the user input, tool traffic and the assistant
    /// answer. Text spoken alongside a tool request stays on that request;
    /// the answer carries only what followed the last tool round. Empty for
    /// failed turns.
    pub messages: Vec<Message>,
    /// Concatenation of every token emitted during the turn.
    pub content: String,
    pub trace: ExecutionTrace,
    /// Why the turn failed or was interrupted.
    pub error: Option<OkvmError>,
}

/// How the inner loop stopped.
enum LoopEnd {
    Completed,
    Failed(OkvmError),
}

/// Mutable record of a turn in progress.
///
/// Lives outside the driving future so that an interrupted turn still has
/// everything produced up to the moment it was stopped.
struct TurnState {
    messages: Vec<Message>,
    content: String,
    /// Where in `content` the text not yet stored on a tool request begins.
    answer_from: usize,
    trace: ExecutionTrace,
    tool_calls: usize,
    limit_reached: bool,
}

impl TurnState {
    fn new(input: &str) -> Self {
        Self {
            messages: vec![Message::user(input)],
            content: String::new(),
            answer_from: 0,
            trace: ExecutionTrace::new(),
            tool_calls: 0,
            limit_reached: false,
        }
    }

    /// Emits `text` as a token and records it as turn content.
    async fn emit(&mut self, sink: &EventSink, text: String) {
        if text.is_empty() {
            return;
        }
        self.content.push_str(&text);
        sink.send(StreamEvent::token(text)).await;
    }

    /// Content produced since the last tool round.
    fn answer(&self) -> String {
        let tail = self.content.get(self.answer_from..).unwrap_or_default();
        tail.strip_prefix(SEGMENT_SEPARATOR).unwrap_or(tail).to_string()
    }

    /// Emits the separator when this is the first text of a later model call.
    async fn begin_segment(&mut self, sink: &EventSink, streamed_this_call: bool) {
        if !streamed_this_call && !self.content.is_empty() {
            self.emit(sink, SEGMENT_SEPARATOR.to_string()).await;
        }
    }
}

/// Runs one conversational turn against a model and a tool catalog.
///
/// `Started -> ModelCall -> (ToolDispatch -> ModelCall)* -> Completed |
/// Interrupted | Failed`. Tool errors never end the turn; they go back to
/// the model as error results.
pub struct TurnExecutor {
    model: Arc<dyn ModelClient>,
    config: ExecutorConfig,
}

impl TurnExecutor {
    pub fn new(model: Arc<dyn ModelClient>, config: ExecutorConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Executes a turn for `input` on top of `history`.
    ///
    /// Tokens and tool events go to `sink`; terminal events are left to the
    /// caller, which decides what to persist first. Cancelling `cancel` or
    /// exceeding the turn timeout interrupts the turn.
    pub async fn run(
        &self,
        history: &[Message],
        input: &str,
        tools: &ToolRegistry,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let mut state = TurnState::new(input);
        debug!(phase = ?TurnPhase::Started, model = self.model.name(), "Turn phase");

        let end = tokio::select! {
            end = self.drive(history, tools, sink, &mut state) => Ok(end),
            _ = cancel.cancelled() => Err("cancelled by caller"),
            _ = tokio::time::sleep(self.config.turn_timeout()) => Err("turn timeout"),
        };

        state.trace.finish();
        match end {
            Ok(LoopEnd::Completed) => {
                info!(
                    phase = ?TurnPhase::Completed,
                    turn_status = ?TurnStatus::Completed,
                    tool_calls = state.tool_calls,
                    trace_id = %state.trace.id,
                    "Turn completed"
                );
                let answer = state.answer();
                let TurnState {
                    mut messages,
                    content,
                    trace,
                    ..
                } = state;
                messages.push(Message::assistant(answer));
                TurnOutcome {
                    status: TurnStatus::Completed,
                    messages,
                    content,
                    trace,
                    error: None,
                }
            }
            Ok(LoopEnd::Failed(err)) => {
                warn!(
                    phase = ?TurnPhase::Failed,
                    turn_status = ?TurnStatus::Failed,
                    error = %err,
                    "Turn failed"
                );
                TurnOutcome {
                    status: TurnStatus::Failed,
                    messages: Vec::new(),
                    content: state.content,
                    trace: state.trace,
                    error: Some(err),
                }
            }
            Err(reason) => {
                info!(
                    phase = ?TurnPhase::Interrupted,
                    turn_status = ?TurnStatus::Interrupted,
                    reason,
                    partial_chars = state.content.len(),
                    "Turn interrupted"
                );
                let answer = state.answer();
                let TurnState {
                    mut messages,
                    content,
                    trace,
                    ..
                } = state;
                close_dangling_calls(&mut messages);
                if !answer.is_empty() {
                    messages.push(Message::assistant(answer).mark_interrupted());
                }
                TurnOutcome {
                    status: TurnStatus::Interrupted,
                    messages,
                    content,
                    trace,
                    error: Some(OkvmError::Interrupted(reason.to_string())),
                }
            }
        }
    }

    async fn drive(
        &self,
        history: &[Message],
        tools: &ToolRegistry,
        sink: &EventSink,
        state: &mut TurnState,
    ) -> LoopEnd {
        let catalog = tools.descriptors();
        let mut exchange = 0usize;

        loop {
            debug!(phase = ?TurnPhase::ModelCall, exchange, "Turn phase");
            let request = ModelRequest {
                system_prompt: self.config.system_prompt.clone(),
                tools: catalog.clone(),
                history: history.iter().chain(state.messages.iter()).cloned().collect(),
            };
            let started_at = Utc::now();
            let reply = match self.call_model(request, sink, state).await {
                Ok(reply) => reply,
                Err(err) => return LoopEnd::Failed(err),
            };

            let calls = match &reply {
                ModelReply::Final(_) => Vec::new(),
                ModelReply::ToolCalls { calls, .. } => calls.clone(),
            };
            state.trace.push(TraceStep::ModelExchange {
                index: exchange,
                tool_calls_requested: calls.len(),
                text_chars: reply.text().chars().count(),
                started_at,
                ended_at: Utc::now(),
            });
            exchange += 1;

            if calls.is_empty() {
                return LoopEnd::Completed;
            }
            if state.limit_reached {
                warn!(
                    max_tool_calls = self.config.max_tool_calls,
                    "Model kept requesting tools past the limit; ending turn"
                );
                state.begin_segment(sink, false).await;
                let notice = format!(
                    "[Stopped after reaching the limit of {} tool calls for this turn.]",
                    self.config.max_tool_calls
                );
                state.emit(sink, notice).await;
                return LoopEnd::Completed;
            }

            let text = reply.text().to_string();
            for (i, call) in calls.iter().enumerate() {
                let content = if i == 0 { text.clone() } else { String::new() };
                state.messages.push(Message::tool_request(content, call.clone()));
            }
            state.answer_from = state.content.len();

            debug!(phase = ?TurnPhase::ToolDispatch, count = calls.len(), "Turn phase");
            for call in &calls {
                self.dispatch(call, tools, sink, state).await;
            }
        }
    }

    /// One model exchange, forwarding streamed text as it arrives.
    async fn call_model(
        &self,
        request: ModelRequest,
        sink: &EventSink,
        state: &mut TurnState,
    ) -> Result<ModelReply, OkvmError> {
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let call = tokio::time::timeout(self.config.model_timeout(), self.model.complete(request, tx));
        tokio::pin!(call);

        let mut streamed = false;
        let result = loop {
            tokio::select! {
                Some(delta) = rx.recv() => {
                    state.begin_segment(sink, streamed).await;
                    streamed = true;
                    state.emit(sink, delta).await;
                }
                result = &mut call => break result,
            }
        };
        // Deltas sent right before the reply resolved.
        while let Ok(delta) = rx.try_recv() {
            state.begin_segment(sink, streamed).await;
            streamed = true;
            state.emit(sink, delta).await;
        }

        let reply = match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(OkvmError::Timeout(format!(
                    "{}s waiting for the model",
                    self.config.model_timeout_secs
                )))
            }
        };

        // Backends that do not stream deliver their text only in the reply.
        if !streamed && !reply.text().is_empty() {
            state.begin_segment(sink, false).await;
            state.emit(sink, reply.text().to_string()).await;
        }
        Ok(reply)
    }

    async fn dispatch(
        &self,
        call: &ToolCall,
        tools: &ToolRegistry,
        sink: &EventSink,
        state: &mut TurnState,
    ) {
        let started_at = Utc::now();
        let result = if state.tool_calls >= self.config.max_tool_calls {
            state.limit_reached = true;
            sink.send(StreamEvent::ToolStatus {
                call_id: call.id.clone(),
                name: call.name.clone(),
                state: ToolState::Rejected,
            })
            .await;
            ToolResult::failure(
                &call.id,
                "tool_limit",
                format!(
                    "tool call limit of {} reached for this turn; answer with what you have",
                    self.config.max_tool_calls
                ),
            )
        } else {
            state.tool_calls += 1;
            sink.send(StreamEvent::ToolStatus {
                call_id: call.id.clone(),
                name: call.name.clone(),
                state: ToolState::Started,
            })
            .await;
            let result = tools.invoke(call, self.config.tool_timeout()).await;
            sink.send(StreamEvent::ToolStatus {
                call_id: call.id.clone(),
                name: call.name.clone(),
                state: if result.is_error() {
                    ToolState::Failed
                } else {
                    ToolState::Completed
                },
            })
            .await;
            result
        };

        sink.send(StreamEvent::tool_result(&call.name, &result)).await;
        state
            .trace
            .push(TraceStep::ToolCall(ToolInvocation::new(call, &result, started_at, Utc::now())));
        state.messages.push(Message::tool_result(&result));
    }
}

/// Answers tool requests whose results never arrived, so the history stays
/// well formed for the next turn.
fn close_dangling_calls(messages: &mut Vec<Message>) {
    let answered: HashSet<String> = messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.clone())
        .collect();
    let dangling: Vec<String> = messages
        .iter()
        .filter_map(|m| m.tool_call.as_ref())
        .map(|c| c.id.clone())
        .filter(|id| !answered.contains(id))
        .collect();
    for id in dangling {
        messages.push(Message::tool_result(&ToolResult::failure(
            id,
            "interrupted",
            "the turn was interrupted before this tool call finished",
        )));
    }
}
