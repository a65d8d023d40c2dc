use crate::config::SessionConfig;
use crate::conversation::{ConversationRecord, ConversationStore, ConversationSummary, TurnAppend};
use crate::identity::ClientKey;
use crate::session::{Binding, Session};
use okvm_agent::{EventSink, StreamEvent, TurnExecutor, TurnStream};
use okvm_core::{OkvmError, OkvmResult};
use okvm_tools::{register_workspace_tools, Tool, ToolRegistry};
use okvm_workspace::{Snapshot, Workspace, WorkspaceManager, WorkspaceState};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long teardown waits for a cancelled turn to commit its outcome.
const TURN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How often a request re-resolves a session evicted underneath it.
const RESOLVE_ATTEMPTS: usize = 3;

/// Per-key creation slot. The map lock is only held to find or insert a
/// slot; building the session happens inside the slot's own `OnceCell`.
type Slot = Arc<OnceCell<Arc<Session>>>;

fn new_conversation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn evicted_again(key: &ClientKey) -> OkvmError {
    OkvmError::Workspace(format!(
        "session for '{key}' kept being evicted; try again"
    ))
}

/// Maps client keys to live sessions.
///
/// Resolving a key creates its session (and workspace) exactly once even
/// under concurrent requests, and work on different keys never waits on a
/// shared lock. Sessions that stay idle past the configured threshold are
/// evicted together with their workspace.
pub struct SessionStore {
    sessions: parking_lot::Mutex<HashMap<ClientKey, Slot>>,
    workspaces: Arc<WorkspaceManager>,
    executor: Arc<TurnExecutor>,
    conversations: Arc<dyn ConversationStore>,
    shared_tools: Vec<Arc<dyn Tool>>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        executor: Arc<TurnExecutor>,
        conversations: Arc<dyn ConversationStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions: parking_lot::Mutex::new(HashMap::new()),
            workspaces,
            executor,
            conversations,
            shared_tools: Vec::new(),
            config,
        }
    }

    /// Tools every session gets next to its workspace tools.
    pub fn with_shared_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.shared_tools = tools;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.workspaces
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Returns the session for `key`, creating it and its workspace on first
    /// use.
    pub async fn resolve(&self, key: &ClientKey) -> OkvmResult<Arc<Session>> {
        let slot = {
            let mut sessions = self.sessions.lock();
            Arc::clone(
                sessions
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        let created = slot
            .get_or_try_init(|| async {
                let binding = self.bind(key, new_conversation_id()).await?;
                info!(
                    client_key = %key,
                    workspace_id = %binding.workspace.id(),
                    conversation_id = %binding.conversation_id,
                    "Session created"
                );
                Ok::<_, OkvmError>(Arc::new(Session::new(key.clone(), binding)))
            })
            .await;

        match created {
            Ok(session) => {
                session.touch();
                Ok(Arc::clone(session))
            }
            Err(e) => {
                let mut sessions = self.sessions.lock();
                if sessions
                    .get(key)
                    .is_some_and(|s| Arc::ptr_eq(s, &slot) && !s.initialized())
                {
                    sessions.remove(key);
                }
                error!(client_key = %key, error = %e, "Session creation failed");
                Err(e)
            }
        }
    }

    /// The live session for `key`, without creating one.
    pub fn get(&self, key: &ClientKey) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .get(key)
            .and_then(|slot| slot.get().cloned())
    }

    /// Allocates a workspace and the tool catalog bound to it.
    async fn bind(&self, key: &ClientKey, conversation_id: String) -> OkvmResult<Binding> {
        let workspace = if self.workspaces.is_durable() {
            self.workspaces.open_or_create(key.as_str(), None).await?
        } else {
            self.workspaces.create(None).await?
        };
        let mut tools = ToolRegistry::new();
        register_workspace_tools(&mut tools, Arc::clone(&workspace));
        for tool in &self.shared_tools {
            tools.register(Arc::clone(tool));
        }
        Ok(Binding {
            conversation_id,
            workspace,
            tools: Arc::new(tools),
        })
    }

    /// Removes the session for `key` and releases its workspace.
    ///
    /// A turn in flight is cancelled first and given a short grace period
    /// to commit its partial outcome.
    pub async fn evict(&self, key: &ClientKey) -> OkvmResult<bool> {
        let slot = self.sessions.lock().remove(key);
        let Some(slot) = slot else {
            return Ok(false);
        };
        // Waits out a creation that is still in progress; never creates.
        let session = slot
            .get_or_try_init(|| async { Err::<Arc<Session>, ()>(()) })
            .await
            .ok()
            .cloned();
        let Some(session) = session else {
            return Ok(false);
        };

        session.mark_evicted();
        session.cancel_turn();
        let _turn = match tokio::time::timeout(TURN_DRAIN_TIMEOUT, session.wait_turn()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!(client_key = %key, "Turn did not finish before eviction");
                None
            }
        };
        let _ops = session.exclusive().await;
        self.workspaces.release(&session.workspace()).await?;
        info!(client_key = %key, "Session evicted");
        Ok(true)
    }

    /// Evicts every live session; used on shutdown.
    pub async fn evict_all(&self) -> usize {
        let keys: Vec<ClientKey> = self.sessions.lock().keys().cloned().collect();
        let mut evicted = 0;
        for key in keys {
            match self.evict(&key).await {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => warn!(client_key = %key, error = %e, "Eviction failed"),
            }
        }
        evicted
    }

    /// Evicts sessions idle past the threshold. Sessions with a turn in
    /// flight are skipped whatever their age.
    pub async fn sweep_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let candidates: Vec<(ClientKey, Arc<Session>)> = self
            .sessions
            .lock()
            .iter()
            .filter_map(|(key, slot)| slot.get().map(|s| (key.clone(), Arc::clone(s))))
            .collect();

        let mut evicted = 0;
        for (key, session) in candidates {
            let Some(_turn) = session.try_begin_turn() else {
                continue;
            };
            if session.idle_for() < idle_timeout {
                continue;
            }
            let removed = {
                let mut sessions = self.sessions.lock();
                let current = sessions
                    .get(&key)
                    .and_then(|slot| slot.get())
                    .is_some_and(|s| Arc::ptr_eq(s, &session));
                if current {
                    sessions.remove(&key);
                }
                current
            };
            if !removed {
                continue;
            }
            session.mark_evicted();
            let _ops = session.exclusive().await;
            if let Err(e) = self.workspaces.release(&session.workspace()).await {
                warn!(client_key = %key, error = %e, "Workspace release failed during sweep");
            }
            info!(
                client_key = %key,
                idle_secs = session.idle_for().as_secs(),
                "Idle session evicted"
            );
            evicted += 1;
        }
        evicted
    }

    /// Runs [`sweep_idle`](Self::sweep_idle) periodically until `shutdown`
    /// is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = store.sweep_idle().await;
                        if evicted > 0 {
                            info!(evicted, live = store.len(), "Idle sweep finished");
                        }
                    }
                }
            }
            debug!("Session sweeper stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Turns
    // -----------------------------------------------------------------------

    /// Starts a turn for `key` and returns its event stream.
    ///
    /// Fails with `TurnInProgress` if the session already has a turn in
    /// flight; nothing about the session changes in that case.
    pub async fn start_turn(&self, key: &ClientKey, input: String) -> OkvmResult<TurnStream> {
        self.start_turn_with(key, input, false).await
    }

    /// Like [`start_turn`](Self::start_turn). With `replace_last`, the
    /// previous turn's messages leave the in-memory history first, so the
    /// model answers `input` in place of that turn. The persisted record
    /// keeps both.
    pub async fn start_turn_with(
        &self,
        key: &ClientKey,
        input: String,
        replace_last: bool,
    ) -> OkvmResult<TurnStream> {
        for _ in 0..RESOLVE_ATTEMPTS {
            let session = self.resolve(key).await?;
            let Some(turn) = session.try_begin_turn() else {
                if session.is_evicted() {
                    continue;
                }
                warn!(client_key = %key, "Turn rejected: another turn is in flight");
                return Err(OkvmError::TurnInProgress(key.to_string()));
            };

            let cancel = CancellationToken::new();
            session.set_active_turn(Some(cancel.clone()));
            // Eviction marks before it cancels, so either this sees the mark
            // or the eviction sees the token.
            if session.is_evicted() {
                session.set_active_turn(None);
                debug!(client_key = %key, "Session evicted before the turn began");
                continue;
            }

            if replace_last {
                let removed = session.drop_last_turn();
                debug!(client_key = %key, removed, "Last turn dropped from history");
            }
            info!(
                client_key = %key,
                conversation_id = %session.conversation_id(),
                replace_last,
                "Turn started"
            );

            let executor = Arc::clone(&self.executor);
            let conversations = Arc::clone(&self.conversations);
            let token = cancel.clone();
            return Ok(TurnStream::spawn(
                self.config.event_buffer,
                cancel,
                move |sink| async move {
                    run_turn(session, executor, conversations, input, sink, token, turn).await;
                },
            ));
        }
        Err(evicted_again(key))
    }

    /// Cancels the in-flight turn for `key`; `false` when there is none.
    pub fn abort_turn(&self, key: &ClientKey) -> bool {
        let aborted = self.get(key).is_some_and(|s| s.cancel_turn());
        if aborted {
            info!(client_key = %key, "Turn abort requested");
        }
        aborted
    }

    // -----------------------------------------------------------------------
    // Workspace operations
    // -----------------------------------------------------------------------

    /// Runs `op` on the client's live workspace. Eviction waits for it to
    /// finish; a session already evicted is resolved afresh.
    async fn with_workspace<T, F, Fut>(&self, key: &ClientKey, op: F) -> OkvmResult<T>
    where
        F: Fn(Arc<Workspace>) -> Fut,
        Fut: Future<Output = OkvmResult<T>>,
    {
        for _ in 0..RESOLVE_ATTEMPTS {
            let session = self.resolve(key).await?;
            let Some(_gate) = session.enter().await else {
                debug!(client_key = %key, "Session evicted underneath the request");
                continue;
            };
            return op(session.workspace()).await;
        }
        Err(evicted_again(key))
    }

    pub async fn snapshot(&self, key: &ClientKey, label: Option<&str>) -> OkvmResult<Snapshot> {
        self.with_workspace(key, |ws| async move { ws.snapshot(label).await })
            .await
    }

    /// Snapshots, newest first, capped at the configured listing limit.
    pub async fn list_snapshots(&self, key: &ClientKey) -> OkvmResult<Vec<Snapshot>> {
        let limit = self.workspaces.config().snapshot_list_limit;
        self.with_workspace(key, |ws| async move { ws.list_snapshots(limit).await })
            .await
    }

    pub async fn restore(&self, key: &ClientKey, snapshot_id: &str) -> OkvmResult<Snapshot> {
        self.with_workspace(key, |ws| async move { ws.restore(snapshot_id).await })
            .await
    }

    pub async fn workspace_state(&self, key: &ClientKey) -> OkvmResult<WorkspaceState> {
        let limit = self.workspaces.config().snapshot_list_limit;
        self.with_workspace(key, |ws| async move { ws.state_summary(limit).await })
            .await
    }

    /// Clears history and replaces the workspace with an empty one.
    ///
    /// The old workspace is destroyed even when workspaces are durable, and
    /// later turns go to a new conversation record.
    pub async fn reset(&self, key: &ClientKey) -> OkvmResult<()> {
        for _ in 0..RESOLVE_ATTEMPTS {
            let session = self.resolve(key).await?;
            let Some(_turn) = session.try_begin_turn() else {
                if session.is_evicted() {
                    continue;
                }
                return Err(OkvmError::TurnInProgress(key.to_string()));
            };
            let _ops = session.exclusive().await;
            if session.is_evicted() {
                continue;
            }
            self.workspaces.purge(&session.workspace()).await?;
            return match self.bind(key, new_conversation_id()).await {
                Ok(binding) => {
                    let workspace_id = binding.workspace.id().to_string();
                    session.rebind(binding);
                    info!(client_key = %key, workspace_id = %workspace_id, "Session reset");
                    Ok(())
                }
                Err(e) => {
                    // The session has no workspace left; the next request starts over.
                    session.mark_evicted();
                    self.sessions.lock().remove(key);
                    error!(client_key = %key, error = %e, "Session reset failed");
                    Err(e)
                }
            };
        }
        Err(evicted_again(key))
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    pub async fn list_conversations(&self, key: &ClientKey) -> OkvmResult<Vec<ConversationSummary>> {
        self.conversations.list(key.as_str()).await
    }

    /// One of the client's conversations; another client's record is
    /// reported as absent.
    pub async fn load_conversation(
        &self,
        key: &ClientKey,
        conversation_id: &str,
    ) -> OkvmResult<Option<ConversationRecord>> {
        let record = self.conversations.load(conversation_id).await?;
        Ok(record.filter(|r| r.client_key == key.as_str()))
    }

    /// Deletes one of the client's conversations.
    ///
    /// Deleting the conversation the live session is writing to also clears
    /// its in-memory history. Conversations owned by other clients are
    /// reported as absent.
    pub async fn delete_conversation(
        &self,
        key: &ClientKey,
        conversation_id: &str,
    ) -> OkvmResult<bool> {
        let owned = self
            .conversations
            .load(conversation_id)
            .await?
            .is_some_and(|record| record.client_key == key.as_str());

        let live = self
            .get(key)
            .filter(|s| s.conversation_id() == conversation_id);
        if let Some(session) = &live {
            let Some(_turn) = session.try_begin_turn() else {
                return Err(OkvmError::TurnInProgress(key.to_string()));
            };
            session.start_conversation(new_conversation_id());
        }

        if !owned {
            return Ok(live.is_some());
        }
        let removed = self.conversations.delete(conversation_id).await?;
        info!(client_key = %key, conversation_id, "Conversation deleted");
        Ok(removed)
    }
}

/// Body of a turn task: run, commit, then close the stream.
///
/// Completed and interrupted turns extend the in-memory history before
/// the durable append, so a persistence failure costs the user nothing but
/// an `error` event. Failed turns leave both untouched. The turn lock is
/// released before the terminal event goes out, so a client can start its
/// next turn as soon as it sees one.
async fn run_turn(
    session: Arc<Session>,
    executor: Arc<TurnExecutor>,
    conversations: Arc<dyn ConversationStore>,
    input: String,
    sink: EventSink,
    cancel: CancellationToken,
    turn: OwnedMutexGuard<()>,
) {
    let binding = session.binding();
    let history = session.history();
    let outcome = executor
        .run(&history, &input, &binding.tools, &sink, &cancel)
        .await;
    session.set_active_turn(None);
    session.touch();

    let status = outcome.status;
    if !status.is_persisted() {
        let err = outcome
            .error
            .unwrap_or_else(|| OkvmError::Model("turn failed".into()));
        drop(turn);
        sink.send(StreamEvent::error(err.kind(), err.to_string()))
            .await;
        return;
    }

    session.extend_history(outcome.messages.iter().cloned());
    let trace_id = outcome.trace.id;
    let append = TurnAppend {
        client_key: session.key().to_string(),
        workspace_ref: binding.workspace.id().to_string(),
        messages: outcome.messages,
        trace: outcome.trace,
        status,
    };
    let persisted = conversations.append(&binding.conversation_id, append).await;
    drop(turn);
    match persisted {
        Ok(()) => {
            debug!(
                client_key = %session.key(),
                conversation_id = %binding.conversation_id,
                turn_status = ?status,
                "Turn persisted"
            );
            sink.send(StreamEvent::Final {
                message: outcome.content,
                trace_id,
                status,
            })
            .await;
        }
        Err(e) => {
            error!(
                client_key = %session.key(),
                conversation_id = %binding.conversation_id,
                error = %e,
                "Turn could not be persisted"
            );
            sink.send(StreamEvent::error(e.kind(), e.to_string())).await;
        }
    }
}
