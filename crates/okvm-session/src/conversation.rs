use async_trait::async_trait;
use chrono::{DateTime, Utc};
use okvm_core::{ExecutionTrace, Message, OkvmResult, Role, ToolCall, TurnStatus};
use serde::{Deserialize, Serialize};

/// Title used until a conversation has a user message to name it after.
pub const DEFAULT_TITLE: &str = "New conversation";

const TITLE_MAX_CHARS: usize = 60;

// ---------------------------------------------------------------------------
// Stored shapes
// ---------------------------------------------------------------------------

/// A message as it is kept in the durable record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Trace of the turn, attached to the message that closed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_trace: Option<ExecutionTrace>,
    /// Partial content left by an interrupted turn.
    #[serde(default)]
    pub interrupted: bool,
    pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
    pub fn from_message(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
            tool_call: message.tool_call.clone(),
            tool_call_id: message.tool_call_id.clone(),
            tool_trace: None,
            interrupted: message.interrupted,
            timestamp: message.timestamp,
        }
    }

    /// Rebuilds an in-memory message; the trace stays in the record.
    pub fn to_message(&self) -> Message {
        let mut message = Message::new(self.role, self.content.clone());
        message.tool_call = self.tool_call.clone();
        message.tool_call_id = self.tool_call_id.clone();
        message.interrupted = self.interrupted;
        message.timestamp = self.timestamp;
        message
    }
}

/// Everything a finished turn hands to the store.
#[derive(Debug, Clone)]
pub struct TurnAppend {
    pub client_key: String,
    pub workspace_ref: String,
    pub messages: Vec<Message>,
    pub trace: ExecutionTrace,
    pub status: TurnStatus,
}

/// One persisted turn. Both backends store a conversation as a sequence
/// of these and fold them into a [`ConversationRecord`] on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnEntry {
    pub client_key: String,
    pub workspace_ref: String,
    pub status: TurnStatus,
    pub appended_at: DateTime<Utc>,
    pub messages: Vec<StoredMessage>,
}

impl From<TurnAppend> for TurnEntry {
    fn from(append: TurnAppend) -> Self {
        let mut messages: Vec<StoredMessage> =
            append.messages.iter().map(StoredMessage::from_message).collect();
        if let Some(last) = messages.last_mut() {
            last.tool_trace = Some(append.trace);
        }
        Self {
            client_key: append.client_key,
            workspace_ref: append.workspace_ref,
            status: append.status,
            appended_at: Utc::now(),
            messages,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Durable history of one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub client_key: String,
    pub title: String,
    /// Workspace the latest turn ran in.
    pub workspace_ref: String,
    pub messages: Vec<StoredMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    /// Folds turns, oldest first, into a record. `None` when there are none.
    pub fn from_entries(conversation_id: &str, entries: Vec<TurnEntry>) -> Option<Self> {
        let first = entries.first()?;
        let mut record = Self {
            conversation_id: conversation_id.to_string(),
            client_key: first.client_key.clone(),
            title: DEFAULT_TITLE.to_string(),
            workspace_ref: first.workspace_ref.clone(),
            messages: Vec::new(),
            created_at: first.appended_at,
            updated_at: first.appended_at,
        };
        for entry in entries {
            record.workspace_ref = entry.workspace_ref;
            record.updated_at = entry.appended_at;
            record.messages.extend(entry.messages);
        }
        record.title = derive_title(&record.messages);
        Some(record)
    }

    /// The record as in-memory history.
    pub fn history(&self) -> Vec<Message> {
        self.messages.iter().map(StoredMessage::to_message).collect()
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            conversation_id: self.conversation_id.clone(),
            title: self.title.clone(),
            workspace_ref: self.workspace_ref.clone(),
            message_count: self.messages.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Listing entry for a client's conversations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub title: String,
    pub workspace_ref: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// First line of the first user message, capped at 60 characters.
pub fn derive_title(messages: &[StoredMessage]) -> String {
    let line = messages
        .iter()
        .find(|m| m.role == Role::User)
        .and_then(|m| m.content.lines().map(str::trim).find(|l| !l.is_empty()));
    let Some(line) = line else {
        return DEFAULT_TITLE.to_string();
    };
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line.to_string();
    }
    let mut title: String = line.chars().take(TITLE_MAX_CHARS - 3).collect();
    title.push_str("...");
    title
}

/// Error text for an append to someone else's conversation.
pub(crate) fn owner_mismatch(conversation_id: &str) -> okvm_core::OkvmError {
    okvm_core::OkvmError::Persistence(format!(
        "conversation owner mismatch for {conversation_id}"
    ))
}

// ---------------------------------------------------------------------------
// ConversationStore trait
// ---------------------------------------------------------------------------

/// Durable conversation history, independent of any live session.
///
/// `append` is the only mutation a turn performs. Appends to different
/// conversations never contend; appends to one conversation land in the
/// order they were made. Every failure is reported as
/// [`OkvmError::Persistence`](okvm_core::OkvmError::Persistence).
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Records one finished turn, creating the conversation on first use.
    async fn append(&self, conversation_id: &str, turn: TurnAppend) -> OkvmResult<()>;

    async fn load(&self, conversation_id: &str) -> OkvmResult<Option<ConversationRecord>>;

    /// Removes the record; `false` when there was nothing to remove.
    async fn delete(&self, conversation_id: &str) -> OkvmResult<bool>;

    /// Conversations owned by `client_key`, most recently updated first.
    async fn list(&self, client_key: &str) -> OkvmResult<Vec<ConversationSummary>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn stored(role: Role, content: &str) -> StoredMessage {
        StoredMessage::from_message(&Message::new(role, content))
    }

    #[test]
    fn test_title_from_first_user_line() {
        let msgs = vec![
            stored(Role::Assistant, "hello"),
            stored(Role::User, "\n  fix the build\nplease"),
        ];
        assert_eq!(derive_title(&msgs), "fix the build");
        assert_eq!(derive_title(&[]), DEFAULT_TITLE);
    }

    #[test]
    fn test_long_title_is_capped() {
        let long = "x".repeat(200);
        let title = derive_title(&[stored(Role::User, &long)]);
        assert_eq!(title.chars().count(), 60);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_trace_attached_to_last_message() {
        let trace = ExecutionTrace::new();
        let trace_id = trace.id;
        let entry = TurnEntry::from(TurnAppend {
            client_key: "abc".into(),
            workspace_ref: "ws".into(),
            messages: vec![Message::user("hi"), Message::assistant("hello")],
            trace,
            status: TurnStatus::Completed,
        });
        assert!(entry.messages[0].tool_trace.is_none());
        assert_eq!(entry.messages[1].tool_trace.as_ref().unwrap().id, trace_id);
    }

    #[test]
    fn test_record_folds_entries() {
        let entry = |text: &str, ws: &str| TurnEntry {
            client_key: "abc".into(),
            workspace_ref: ws.into(),
            status: TurnStatus::Completed,
            appended_at: Utc::now(),
            messages: vec![stored(Role::User, text)],
        };
        let record =
            ConversationRecord::from_entries("c1", vec![entry("first", "w1"), entry("second", "w2")])
                .unwrap();
        assert_eq!(record.title, "first");
        assert_eq!(record.workspace_ref, "w2");
        assert_eq!(record.messages.len(), 2);
        assert!(record.created_at <= record.updated_at);
        assert!(ConversationRecord::from_entries("c2", Vec::new()).is_none());
    }
}
