use crate::conversation::{
    owner_mismatch, ConversationRecord, ConversationStore, ConversationSummary, TurnAppend,
    TurnEntry,
};
use async_trait::async_trait;
use okvm_core::{OkvmError, OkvmResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::Arc;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id          TEXT PRIMARY KEY,
    client_key  TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS conversations_by_client ON conversations (client_key, updated_at);
CREATE TABLE IF NOT EXISTS turns (
    conversation_id TEXT NOT NULL REFERENCES conversations (id) ON DELETE CASCADE,
    seq             INTEGER NOT NULL,
    entry           TEXT NOT NULL,
    PRIMARY KEY (conversation_id, seq)
);
";

/// What a blocking store call can fail with.
enum StoreError {
    Sql(rusqlite::Error),
    Json(serde_json::Error),
    OwnerMismatch,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sql(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// Conversation store in a single SQLite database.
///
/// Every turn is one row in `turns`, written in the same transaction that
/// creates or touches its `conversations` row. The connection sits behind
/// a mutex and all queries run on the blocking pool.
#[derive(Clone)]
pub struct SqliteConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConversationStore {
    /// Opens (or creates) the database at `path` and applies the schema.
    pub async fn open(path: PathBuf) -> OkvmResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| OkvmError::Persistence(format!("cannot create database directory: {e}")))?;
        }
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, rusqlite::Error> {
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| OkvmError::Persistence(format!("open task failed: {e}")))?
        .map_err(|e| OkvmError::Persistence(format!("cannot open database: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// An in-memory database, for tests and throwaway runs.
    pub fn in_memory() -> OkvmResult<Self> {
        let conn = Connection::open_in_memory()
            .and_then(|c| {
                c.execute_batch("PRAGMA foreign_keys = ON;")?;
                c.execute_batch(SCHEMA)?;
                Ok(c)
            })
            .map_err(|e| OkvmError::Persistence(format!("cannot open database: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run_blocking<F, R>(&self, conversation_id: &str, f: F) -> OkvmResult<R>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| OkvmError::Persistence(format!("store task failed: {e}")))?;
        result.map_err(|e| match e {
            StoreError::Sql(e) => OkvmError::Persistence(format!("sqlite: {e}")),
            StoreError::Json(e) => OkvmError::Persistence(format!("corrupt turn entry: {e}")),
            StoreError::OwnerMismatch => owner_mismatch(conversation_id),
        })
    }
}

fn load_record(conn: &Connection, id: &str) -> Result<Option<ConversationRecord>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT entry FROM turns WHERE conversation_id = ?1 ORDER BY seq")?;
    let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(serde_json::from_str::<TurnEntry>(&row?)?);
    }
    Ok(ConversationRecord::from_entries(id, entries))
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn append(&self, conversation_id: &str, turn: TurnAppend) -> OkvmResult<()> {
        let id = conversation_id.to_string();
        let entry = TurnEntry::from(turn);
        self.run_blocking(conversation_id, move |conn| {
            let now = entry.appended_at.to_rfc3339();
            let json = serde_json::to_string(&entry)?;
            let tx = conn.transaction()?;
            let owner: Option<String> = tx
                .query_row(
                    "SELECT client_key FROM conversations WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match owner {
                Some(owner) if owner != entry.client_key => return Err(StoreError::OwnerMismatch),
                Some(_) => {
                    tx.execute(
                        "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                        params![now, id],
                    )?;
                }
                None => {
                    tx.execute(
                        "INSERT INTO conversations (id, client_key, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?3)",
                        params![id, entry.client_key, now],
                    )?;
                }
            }
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM turns WHERE conversation_id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO turns (conversation_id, seq, entry) VALUES (?1, ?2, ?3)",
                params![id, seq, json],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn load(&self, conversation_id: &str) -> OkvmResult<Option<ConversationRecord>> {
        let id = conversation_id.to_string();
        self.run_blocking(conversation_id, move |conn| load_record(conn, &id))
            .await
    }

    async fn delete(&self, conversation_id: &str) -> OkvmResult<bool> {
        let id = conversation_id.to_string();
        self.run_blocking(conversation_id, move |conn| {
            let removed = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn list(&self, client_key: &str) -> OkvmResult<Vec<ConversationSummary>> {
        let key = client_key.to_string();
        let mut summaries = self
            .run_blocking("", move |conn| {
                let ids: Vec<String> = {
                    let mut stmt =
                        conn.prepare("SELECT id FROM conversations WHERE client_key = ?1")?;
                    let rows = stmt.query_map(params![key], |row| row.get(0))?;
                    rows.collect::<Result<_, _>>()?
                };
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(record) = load_record(conn, &id)? {
                        out.push(record.summary());
                    }
                }
                Ok(out)
            })
            .await?;
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}
