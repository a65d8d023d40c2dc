use futures_util::Stream;
use okvm_core::{ToolFailure, ToolOutcome, ToolResult, TurnStatus};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle state reported by a `tool_status` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Started,
    Completed,
    Failed,
    /// Not run because the per-turn tool-call limit was reached.
    Rejected,
}

/// Events pushed to the single consumer of a turn, in emission order.
///
/// Serialised as one JSON object per line with a `type` tag. Kinds this
/// version does not know deserialise to [`StreamEvent::Unknown`] so older
/// consumers can skip them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A chunk of assistant text.
    Token { text: String },

    /// A tool call changed state. Always precedes its `tool_result`.
    ToolStatus {
        call_id: String,
        name: String,
        state: ToolState,
    },

    /// What a tool call returned.
    ToolResult {
        call_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ToolFailure>,
    },

    /// The turn ended; `message` equals the concatenated tokens.
    Final {
        message: String,
        trace_id: Uuid,
        status: TurnStatus,
    },

    /// The turn or its persistence failed.
    Error { kind: String, message: String },

    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    pub fn token(text: impl Into<String>) -> Self {
        Self::Token { text: text.into() }
    }

    pub fn tool_result(name: &str, result: &ToolResult) -> Self {
        let (result_value, error) = match &result.outcome {
            ToolOutcome::Result(v) => (Some(v.clone()), None),
            ToolOutcome::Error(f) => (None, Some(f.clone())),
        };
        Self::ToolResult {
            call_id: result.call_id.clone(),
            name: name.to_string(),
            result: result_value,
            error,
        }
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// `final` and `error` close the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Final { .. } | Self::Error { .. })
    }

    /// One NDJSON line, newline included.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","kind":"json_error","message":"{e}"}}"#)
        });
        line.push('\n');
        line
    }
}

/// Producer half of a turn's event channel.
///
/// A send that fails because the consumer went away cancels the turn.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Delivers `event`; returns `false` once the consumer is gone.
    pub async fn send(&self, event: StreamEvent) -> bool {
        if self.tx.send(event).await.is_ok() {
            return true;
        }
        if !self.cancel.is_cancelled() {
            tracing::debug!("Stream consumer disconnected; cancelling turn");
            self.cancel.cancel();
        }
        false
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Consumer half: the one subscriber of a running turn.
///
/// Yields events until the first terminal event. Dropping the stream before
/// that cancels the turn, which then ends as interrupted.
#[derive(Debug)]
pub struct TurnStream {
    inner: ReceiverStream<StreamEvent>,
    cancel: CancellationToken,
    finished: bool,
}

impl TurnStream {
    /// Runs `producer` on its own task and returns the consuming end.
    pub fn spawn<F, Fut>(buffer: usize, cancel: CancellationToken, producer: F) -> Self
    where
        F: FnOnce(EventSink) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let sink = EventSink::new(tx, cancel.clone());
        tokio::spawn(producer(sink));
        Self {
            inner: ReceiverStream::new(rx),
            cancel,
            finished: false,
        }
    }

    /// Next event, or `None` once the turn has finished.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Drains the stream to the end.
    pub async fn collect_all(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    /// Requests cancellation; the stream still delivers the turn's final event.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for TurnStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let ev = StreamEvent::token("hi");
        assert_eq!(ev.to_line(), "{\"type\":\"token\",\"text\":\"hi\"}\n");

        let ev = StreamEvent::tool_result("write_file", &ToolResult::failure("c1", "quota_exceeded", "full"));
        let json: serde_json::Value = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["error"]["kind"], "quota_exceeded");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_unknown_kind_is_ignorable() {
        let ev: StreamEvent =
            serde_json::from_str(r#"{"type":"progress_bar","percent":40}"#).unwrap();
        assert_eq!(ev, StreamEvent::Unknown);
        assert!(!ev.is_terminal());
    }

    #[tokio::test]
    async fn test_stream_closes_after_terminal() {
        let stream = TurnStream::spawn(8, CancellationToken::new(), |sink| async move {
            sink.send(StreamEvent::token("a")).await;
            sink.send(StreamEvent::error("model_error", "down")).await;
            sink.send(StreamEvent::token("late")).await;
        });
        let events = stream.collect_all().await;
        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());
    }

    #[tokio::test]
    async fn test_drop_cancels_producer() {
        let cancel = CancellationToken::new();
        let observed = cancel.clone();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let mut stream = TurnStream::spawn(1, cancel, |sink| async move {
            sink.send(StreamEvent::token("first")).await;
            sink.cancel_token().cancelled().await;
            let _ = done_tx.send(());
        });
        assert_eq!(stream.next().await, Some(StreamEvent::token("first")));
        drop(stream);
        done_rx.await.unwrap();
        assert!(observed.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_send_cancels() {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = EventSink::new(tx, cancel.clone());
        assert!(!sink.send(StreamEvent::token("x")).await);
        assert!(cancel.is_cancelled());
    }
}
