use crate::identity::ClientKey;
use chrono::{DateTime, Utc};
use okvm_core::{Message, Role};
use okvm_tools::ToolRegistry;
use okvm_workspace::Workspace;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedMutexGuard, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

/// The parts of a session that a reset swaps out together.
pub struct Binding {
    pub conversation_id: String,
    pub workspace: Arc<Workspace>,
    /// Tool catalog bound to `workspace`.
    pub tools: Arc<ToolRegistry>,
}

/// Live binding between a client key, its workspace and its history.
///
/// At most one turn runs at a time; the turn lock is held by the turn task
/// from start until its outcome is committed. Workspace operations outside
/// a turn hold the operations gate shared; eviction and reset take it
/// exclusively. Once evicted, a session is never used again, even by a
/// request that resolved it before the eviction.
pub struct Session {
    key: ClientKey,
    binding: RwLock<Arc<Binding>>,
    history: Mutex<Vec<Message>>,
    last_activity: Mutex<Instant>,
    turn_lock: Arc<tokio::sync::Mutex<()>>,
    active_turn: Mutex<Option<CancellationToken>>,
    ops: tokio::sync::RwLock<()>,
    evicted: AtomicBool,
    created_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn new(key: ClientKey, binding: Binding) -> Self {
        Self {
            key,
            binding: RwLock::new(Arc::new(binding)),
            history: Mutex::new(Vec::new()),
            last_activity: Mutex::new(Instant::now()),
            turn_lock: Arc::new(tokio::sync::Mutex::new(())),
            active_turn: Mutex::new(None),
            ops: tokio::sync::RwLock::new(()),
            evicted: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> &ClientKey {
        &self.key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn binding(&self) -> Arc<Binding> {
        self.binding.read().clone()
    }

    pub fn conversation_id(&self) -> String {
        self.binding.read().conversation_id.clone()
    }

    pub fn workspace(&self) -> Arc<Workspace> {
        Arc::clone(&self.binding.read().workspace)
    }

    /// Copy of the in-memory history.
    pub fn history(&self) -> Vec<Message> {
        self.history.lock().clone()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Whether a turn is in flight.
    pub fn is_busy(&self) -> bool {
        self.turn_lock.try_lock().is_err()
    }

    /// Takes the turn lock without waiting.
    pub(crate) fn try_begin_turn(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.turn_lock).try_lock_owned().ok()
    }

    /// Waits for the turn lock, for teardown paths.
    pub(crate) async fn wait_turn(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.turn_lock).lock_owned().await
    }

    pub(crate) fn set_active_turn(&self, cancel: Option<CancellationToken>) {
        *self.active_turn.lock() = cancel;
    }

    /// Cancels the in-flight turn, if any.
    pub fn cancel_turn(&self) -> bool {
        match self.active_turn.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::SeqCst);
    }

    /// Enters the operations gate; `None` once the session is evicted.
    pub(crate) async fn enter(&self) -> Option<RwLockReadGuard<'_, ()>> {
        let guard = self.ops.read().await;
        (!self.is_evicted()).then_some(guard)
    }

    /// Waits for workspace operations in flight and keeps new ones out.
    pub(crate) async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.ops.write().await
    }

    pub(crate) fn extend_history(&self, messages: impl IntoIterator<Item = Message>) {
        self.history.lock().extend(messages);
    }

    /// Drops the most recent turn, from its user message on. Returns how
    /// many messages were removed.
    pub(crate) fn drop_last_turn(&self) -> usize {
        let mut history = self.history.lock();
        match history.iter().rposition(|m| m.role == Role::User) {
            Some(start) => {
                let removed = history.len() - start;
                history.truncate(start);
                removed
            }
            None => 0,
        }
    }

    /// Installs a new binding and starts an empty history.
    pub(crate) fn rebind(&self, binding: Binding) -> Arc<Binding> {
        self.history.lock().clear();
        std::mem::replace(&mut *self.binding.write(), Arc::new(binding))
    }

    /// Moves to a new conversation on the same workspace.
    pub(crate) fn start_conversation(&self, conversation_id: String) {
        self.history.lock().clear();
        let mut binding = self.binding.write();
        let next = Binding {
            conversation_id,
            workspace: Arc::clone(&binding.workspace),
            tools: Arc::clone(&binding.tools),
        };
        *binding = Arc::new(next);
    }
}
