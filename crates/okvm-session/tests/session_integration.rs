#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Session store end to end: real workspaces and conversation files, a
//! scripted model.

use async_trait::async_trait;
use okvm_agent::{ExecutorConfig, ScriptStep, ScriptedModel, StreamEvent, ToolState, TurnExecutor};
use okvm_core::{OkvmError, OkvmResult, Role, TurnStatus};
use okvm_session::*;
use okvm_workspace::{WorkspaceConfig, WorkspaceManager, WriteMode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    _tmp: tempfile::TempDir,
    store: Arc<SessionStore>,
    model: Arc<ScriptedModel>,
    conversations: Arc<dyn ConversationStore>,
}

async fn fixture_with(
    steps: Vec<ScriptStep>,
    workspace: impl FnOnce(&mut WorkspaceConfig),
    session: SessionConfig,
    conversations: Option<Arc<dyn ConversationStore>>,
) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let mut ws_config = WorkspaceConfig::with_base_dir(tmp.path().join("workspaces"));
    workspace(&mut ws_config);
    let workspaces = Arc::new(WorkspaceManager::new(ws_config).unwrap());
    let model = Arc::new(ScriptedModel::new(steps));
    let executor = Arc::new(TurnExecutor::new(model.clone(), ExecutorConfig::default()));
    let conversations: Arc<dyn ConversationStore> = match conversations {
        Some(c) => c,
        None => Arc::new(
            FileConversationStore::new(tmp.path().join("conversations"))
                .await
                .unwrap(),
        ),
    };
    let store = Arc::new(SessionStore::new(
        workspaces,
        executor,
        conversations.clone(),
        session,
    ));
    Fixture {
        _tmp: tmp,
        store,
        model,
        conversations,
    }
}

async fn fixture(steps: Vec<ScriptStep>) -> Fixture {
    fixture_with(steps, |_| {}, SessionConfig::default(), None).await
}

fn key(raw: &str) -> ClientKey {
    ClientKey::parse(raw).unwrap()
}

fn tokens(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Token { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

fn final_of(events: &[StreamEvent]) -> (String, TurnStatus) {
    match events.last().unwrap() {
        StreamEvent::Final {
            message, status, ..
        } => (message.clone(), *status),
        other => panic!("expected final event, got {other:?}"),
    }
}

/// Waits until the conversation has at least `turns` user messages.
async fn wait_for_record(
    conversations: &Arc<dyn ConversationStore>,
    id: &str,
    user_messages: usize,
) -> ConversationRecord {
    for _ in 0..200 {
        if let Some(record) = conversations.load(id).await.unwrap() {
            if record.messages.iter().filter(|m| m.role == Role::User).count() >= user_messages {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("conversation {id} never reached {user_messages} turns");
}

// ---------------------------------------------------------------------------
// 1. Write, snapshot, delete, snapshot, restore
// ---------------------------------------------------------------------------

#[tokio::test]
async fn notes_file_snapshot_and_restore() {
    let f = fixture(vec![
        ScriptStep::tool(
            "call_1",
            "write_file",
            json!({"path": "notes.txt", "content": "hi"}),
        ),
        ScriptStep::text("Created notes.txt with content hi."),
        ScriptStep::tool("call_2", "delete_file", json!({"path": "notes.txt"})),
        ScriptStep::text("Deleted notes.txt."),
    ])
    .await;
    let abc = key("abc123");

    let events = f
        .store
        .start_turn(&abc, "create a file named notes.txt with content hi".into())
        .await
        .unwrap()
        .collect_all()
        .await;
    let (message, status) = final_of(&events);
    assert_eq!(status, TurnStatus::Completed);
    assert_eq!(message, "Created notes.txt with content hi.");
    assert_eq!(tokens(&events), message);

    let session = f.store.get(&abc).unwrap();
    let workspace = session.workspace();
    assert_eq!(workspace.read_file("notes.txt").await.unwrap(), b"hi");

    // No implicit snapshot.
    assert!(f.store.list_snapshots(&abc).await.unwrap().is_empty());
    let h1 = f.store.snapshot(&abc, Some("before-edit")).await.unwrap();
    assert!(h1.parent.is_none());

    let events = f
        .store
        .start_turn(&abc, "delete notes.txt".into())
        .await
        .unwrap()
        .collect_all()
        .await;
    assert_eq!(final_of(&events).1, TurnStatus::Completed);
    assert!(workspace.read_file("notes.txt").await.is_err());

    let h2 = f.store.snapshot(&abc, Some("after-delete")).await.unwrap();
    assert_eq!(h2.parent.as_ref(), Some(&h1.id));
    let listed = f.store.list_snapshots(&abc).await.unwrap();
    let ids: Vec<_> = listed.iter().map(|s| s.id.clone()).collect();
    assert_eq!(ids, vec![h2.id.clone(), h1.id.clone()]);

    f.store.restore(&abc, h1.id.as_str()).await.unwrap();
    assert_eq!(workspace.read_file("notes.txt").await.unwrap(), b"hi");

    // Both turns are on record, in order.
    let record = f
        .conversations
        .load(&session.conversation_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.client_key, "abc123");
    assert_eq!(record.title, "create a file named notes.txt with content hi");
    let users: Vec<&str> = record
        .messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(users, vec!["create a file named notes.txt with content hi", "delete notes.txt"]);
    assert_eq!(session.history_len(), record.messages.len());
    assert_eq!(f.model.call_count(), 4);
}

// ---------------------------------------------------------------------------
// 2. One turn at a time
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_turn_is_rejected_while_one_is_in_flight() {
    let f = fixture(vec![ScriptStep::stall(&[])]).await;
    let k = key("busy");

    let first = f.store.start_turn(&k, "long task".into()).await.unwrap();
    let err = f.store.start_turn(&k, "impatient".into()).await.unwrap_err();
    assert!(matches!(err, OkvmError::TurnInProgress(_)));
    assert_eq!(f.store.get(&k).unwrap().history_len(), 0);

    assert!(f.store.abort_turn(&k));
    let events = first.collect_all().await;
    assert_eq!(final_of(&events).1, TurnStatus::Interrupted);

    // Only the first turn's input made it into history.
    let history = f.store.get(&k).unwrap().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "long task");
    assert!(!f.store.abort_turn(&k));
}

// ---------------------------------------------------------------------------
// 3. Disconnect mid-turn
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnect_persists_partial_content() {
    let f = fixture(vec![
        ScriptStep::tools(
            Some("Let me write"),
            vec![okvm_core::ToolCall {
                id: "w".into(),
                name: "write_file".into(),
                arguments: json!({"path": "a.txt", "content": "a"}),
            }],
        ),
        ScriptStep::stall(&[]),
    ])
    .await;
    let k = key("flaky-client");

    let mut stream = f.store.start_turn(&k, "write a.txt".into()).await.unwrap();
    let conversation_id = f.store.get(&k).unwrap().conversation_id();
    let (mut token_count, mut status_count) = (0, 0);
    while token_count < 3 || status_count < 1 {
        match stream.next().await.unwrap() {
            StreamEvent::Token { .. } => token_count += 1,
            StreamEvent::ToolStatus { .. } => status_count += 1,
            _ => {}
        }
    }
    drop(stream);

    let record = wait_for_record(&f.conversations, &conversation_id, 1).await;
    let last = record.messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.interrupted);
    assert_eq!(last.content, "Let me write");
    assert!(last.tool_trace.is_some());

    // Every tool request got an answer, real or synthetic.
    let requests = record.messages.iter().filter(|m| m.tool_call.is_some()).count();
    let results = record.messages.iter().filter(|m| m.role == Role::Tool).count();
    assert_eq!(requests, results);
}

// ---------------------------------------------------------------------------
// 4. Quota
// ---------------------------------------------------------------------------

#[tokio::test]
async fn quota_failure_is_reported_and_leaves_nothing() {
    let f = fixture_with(
        vec![
            ScriptStep::tool(
                "big",
                "write_file",
                json!({"path": "big.bin", "content": "0123456789abcdef"}),
            ),
            ScriptStep::text("I could not save big.bin because the workspace quota was exceeded."),
        ],
        |c| c.default_quota_bytes = 8,
        SessionConfig::default(),
        None,
    )
    .await;
    let k = key("tight");

    let events = f
        .store
        .start_turn(&k, "save a big file".into())
        .await
        .unwrap()
        .collect_all()
        .await;
    let (message, status) = final_of(&events);
    assert_eq!(status, TurnStatus::Completed);
    assert!(message.contains("quota"));

    let failure = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::ToolResult { error: Some(err), .. } => Some(err.kind.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(failure, "quota_exceeded");
    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::ToolStatus { state: ToolState::Failed, .. }
    )));

    let workspace = f.store.get(&k).unwrap().workspace();
    assert!(!workspace.root().join("big.bin").exists());
    assert_eq!(workspace.usage(), 0);
}

// ---------------------------------------------------------------------------
// 5. Idle eviction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn idle_eviction_gives_a_fresh_workspace() {
    let f = fixture_with(
        vec![ScriptStep::stall(&[])],
        |_| {},
        SessionConfig {
            idle_timeout_secs: 0,
            ..SessionConfig::default()
        },
        None,
    )
    .await;
    let k = key("sleepy");

    let session = f.store.resolve(&k).await.unwrap();
    let old = session.workspace();
    old.write_file("keep.txt", b"data".to_vec(), WriteMode::Overwrite)
        .await
        .unwrap();
    let old_root = old.root().to_path_buf();

    // A session with a turn in flight is never swept.
    let busy = key("busy-one");
    let stream = f.store.start_turn(&busy, "wait".into()).await.unwrap();

    assert_eq!(f.store.sweep_idle().await, 1);
    assert!(f.store.get(&k).is_none());
    assert!(f.store.get(&busy).is_some());
    assert!(!old_root.exists());
    assert_eq!(f.store.workspaces().live_count(), 1);

    let fresh = f.store.resolve(&k).await.unwrap().workspace();
    assert_ne!(fresh.id(), old.id());
    assert!(fresh.list_directory(".").await.unwrap().is_empty());

    stream.cancel();
    drop(stream);
}

#[tokio::test]
async fn explicit_eviction_cancels_the_turn() {
    let f = fixture(vec![ScriptStep::stall(&["thinking"])]).await;
    let k = key("leaving");

    let mut stream = f.store.start_turn(&k, "go".into()).await.unwrap();
    assert_eq!(stream.next().await, Some(StreamEvent::token("thinking")));
    let conversation_id = f.store.get(&k).unwrap().conversation_id();

    assert!(f.store.evict(&k).await.unwrap());
    assert!(f.store.get(&k).is_none());
    assert!(!f.store.evict(&k).await.unwrap());

    let rest = stream.collect_all().await;
    assert_eq!(final_of(&rest).1, TurnStatus::Interrupted);
    let record = f.conversations.load(&conversation_id).await.unwrap().unwrap();
    assert!(record.messages.last().unwrap().interrupted);
}

// ---------------------------------------------------------------------------
// 6. Failures
// ---------------------------------------------------------------------------

struct BrokenStore;

#[async_trait]
impl ConversationStore for BrokenStore {
    async fn append(&self, _: &str, _: TurnAppend) -> OkvmResult<()> {
        Err(OkvmError::Persistence("database unavailable".into()))
    }
    async fn load(&self, _: &str) -> OkvmResult<Option<ConversationRecord>> {
        Err(OkvmError::Persistence("database unavailable".into()))
    }
    async fn delete(&self, _: &str) -> OkvmResult<bool> {
        Err(OkvmError::Persistence("database unavailable".into()))
    }
    async fn list(&self, _: &str) -> OkvmResult<Vec<ConversationSummary>> {
        Err(OkvmError::Persistence("database unavailable".into()))
    }
}

#[tokio::test]
async fn persistence_failure_keeps_memory_history() {
    let f = fixture_with(
        vec![ScriptStep::text("hello"), ScriptStep::text("still here")],
        |_| {},
        SessionConfig::default(),
        Some(Arc::new(BrokenStore)),
    )
    .await;
    let k = key("offline-db");

    let events = f
        .store
        .start_turn(&k, "hi".into())
        .await
        .unwrap()
        .collect_all()
        .await;
    match events.last().unwrap() {
        StreamEvent::Error { kind, .. } => assert_eq!(kind, "persistence_error"),
        other => panic!("expected error event, got {other:?}"),
    }
    assert_eq!(f.store.get(&k).unwrap().history_len(), 2);

    // The next turn sees the earlier exchange.
    f.store
        .start_turn(&k, "again".into())
        .await
        .unwrap()
        .collect_all()
        .await;
    let seen = &f.model.requests()[1].history;
    assert_eq!(seen[0].content, "hi");
    assert_eq!(seen[1].content, "hello");
}

#[tokio::test]
async fn model_failure_changes_nothing() {
    let f = fixture(vec![ScriptStep::Fail("upstream 503".into())]).await;
    let k = key("unlucky");

    let events = f
        .store
        .start_turn(&k, "hello".into())
        .await
        .unwrap()
        .collect_all()
        .await;
    match events.last().unwrap() {
        StreamEvent::Error { kind, message } => {
            assert_eq!(kind, "model_error");
            assert!(message.contains("upstream 503"));
        }
        other => panic!("expected error event, got {other:?}"),
    }
    let session = f.store.get(&k).unwrap();
    assert_eq!(session.history_len(), 0);
    assert!(f
        .conversations
        .load(&session.conversation_id())
        .await
        .unwrap()
        .is_none());
    assert!(!session.is_busy());
}

// ---------------------------------------------------------------------------
// 7. Concurrency and housekeeping
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_resolves_create_one_workspace() {
    let f = fixture(Vec::new()).await;
    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = Arc::clone(&f.store);
        handles.push(tokio::spawn(async move {
            store.resolve(&key("same-client")).await.unwrap()
        }));
    }
    let mut sessions = Vec::new();
    for h in handles {
        sessions.push(h.await.unwrap());
    }
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    assert_eq!(f.store.workspaces().live_count(), 1);
    assert_eq!(f.store.len(), 1);
}

#[tokio::test]
async fn reset_starts_over() {
    let f = fixture(vec![ScriptStep::text("noted")]).await;
    let k = key("fresh-start");

    f.store
        .start_turn(&k, "remember this".into())
        .await
        .unwrap()
        .collect_all()
        .await;
    let session = f.store.get(&k).unwrap();
    let before = session.binding();
    before
        .workspace
        .write_file("old.txt", b"x".to_vec(), WriteMode::Overwrite)
        .await
        .unwrap();

    f.store.reset(&k).await.unwrap();
    let after = session.binding();
    assert_ne!(after.workspace.id(), before.workspace.id());
    assert_ne!(after.conversation_id, before.conversation_id);
    assert!(before.workspace.is_destroyed());
    assert!(after.workspace.list_directory(".").await.unwrap().is_empty());
    assert_eq!(session.history_len(), 0);

    // The earlier conversation is still on record until deleted.
    assert_eq!(f.store.list_conversations(&k).await.unwrap().len(), 1);
}

#[tokio::test]
async fn conversations_are_listed_and_deleted_per_client() {
    let f = fixture(vec![ScriptStep::text("one"), ScriptStep::text("two")]).await;
    let alice = key("alice");
    let bob = key("bob");

    for k in [&alice, &bob] {
        f.store
            .start_turn(k, "hello".into())
            .await
            .unwrap()
            .collect_all()
            .await;
    }
    let listed = f.store.list_conversations(&alice).await.unwrap();
    assert_eq!(listed.len(), 1);
    let id = listed[0].conversation_id.clone();

    // Bob cannot delete Alice's conversation.
    assert!(!f.store.delete_conversation(&bob, &id).await.unwrap());
    assert!(f.conversations.load(&id).await.unwrap().is_some());

    assert!(f.store.delete_conversation(&alice, &id).await.unwrap());
    assert!(f.store.list_conversations(&alice).await.unwrap().is_empty());
    let session = f.store.get(&alice).unwrap();
    assert_eq!(session.history_len(), 0);
    assert_ne!(session.conversation_id(), id);
}

#[tokio::test]
async fn sweeper_stops_on_shutdown() {
    let f = fixture(Vec::new()).await;
    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = f.store.spawn_sweeper(shutdown.clone());
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

// ---------------------------------------------------------------------------
// 8. Regenerating the last answer and reading a conversation back
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replace_last_answers_in_place_of_the_previous_turn() {
    let f = fixture(vec![
        ScriptStep::text("first answer"),
        ScriptStep::text("better answer"),
    ])
    .await;
    let k = key("rephraser");

    f.store
        .start_turn(&k, "what is rust".into())
        .await
        .unwrap()
        .collect_all()
        .await;
    let events = f
        .store
        .start_turn_with(&k, "what is rust, briefly".into(), true)
        .await
        .unwrap()
        .collect_all()
        .await;
    assert_eq!(final_of(&events).0, "better answer");

    // The model never saw the replaced exchange.
    let seen = &f.model.requests()[1].history;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].content, "what is rust, briefly");

    let session = f.store.get(&k).unwrap();
    let history: Vec<String> = session.history().into_iter().map(|m| m.content).collect();
    assert_eq!(history, vec!["what is rust, briefly", "better answer"]);

    // The record keeps both turns.
    let record = wait_for_record(&f.conversations, &session.conversation_id(), 2).await;
    assert_eq!(record.messages.len(), 4);
}

#[tokio::test]
async fn replace_last_on_empty_history_is_a_plain_turn() {
    let f = fixture(vec![ScriptStep::text("hello")]).await;
    let k = key("first-timer");
    let events = f
        .store
        .start_turn_with(&k, "hi".into(), true)
        .await
        .unwrap()
        .collect_all()
        .await;
    assert_eq!(final_of(&events), ("hello".to_string(), TurnStatus::Completed));
    assert_eq!(f.store.get(&k).unwrap().history_len(), 2);
}

#[tokio::test]
async fn conversations_are_loaded_only_by_their_owner() {
    let f = fixture(vec![ScriptStep::text("noted")]).await;
    let alice = key("alice");
    let bob = key("bob");

    f.store
        .start_turn(&alice, "remember the milk".into())
        .await
        .unwrap()
        .collect_all()
        .await;
    let id = f.store.get(&alice).unwrap().conversation_id();

    let record = f.store.load_conversation(&alice, &id).await.unwrap().unwrap();
    assert_eq!(record.title, "remember the milk");
    assert_eq!(record.messages.len(), 2);
    assert_eq!(record.messages[1].content, "noted");

    assert!(f.store.load_conversation(&bob, &id).await.unwrap().is_none());
    assert!(f
        .store
        .load_conversation(&alice, "no-such-conversation")
        .await
        .unwrap()
        .is_none());
}
