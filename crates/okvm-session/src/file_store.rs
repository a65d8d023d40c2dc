use crate::conversation::{
    owner_mismatch, ConversationRecord, ConversationStore, ConversationSummary, TurnAppend,
    TurnEntry,
};
use async_trait::async_trait;
use okvm_core::{OkvmError, OkvmResult};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

fn persistence(context: &str, e: impl std::fmt::Display) -> OkvmError {
    OkvmError::Persistence(format!("{context}: {e}"))
}

/// Ids double as file names, so only a conservative alphabet is accepted.
fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Conversation store backed by one JSONL file per conversation.
///
/// Each line is one appended turn. Writes to a conversation are serialised
/// by a lock of its own, so different conversations never wait on each
/// other. A lock lives in the map only while someone holds or waits for it.
///
/// A crash in the middle of an append can leave a torn last line. Readers
/// skip it and the next append starts on a fresh line.
pub struct FileConversationStore {
    dir: PathBuf,
    locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileConversationStore {
    pub async fn new(dir: PathBuf) -> OkvmResult<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| persistence("cannot create conversation directory", e))?;
        Ok(Self {
            dir,
            locks: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    fn conversation_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.jsonl"))
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the map entry for `id` once nobody else holds a clone.
    fn unlock(&self, id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(id);
        }
    }

    async fn read_entries(path: &Path) -> OkvmResult<Vec<TurnEntry>> {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(persistence("cannot read conversation", e)),
        };
        let lines: Vec<&str> = data.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut entries = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if i + 1 == lines.len() => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping torn last line");
                }
                Err(e) => return Err(persistence("corrupt conversation line", e)),
            }
        }
        Ok(entries)
    }

    async fn load_locked(&self, id: &str) -> OkvmResult<Option<ConversationRecord>> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            Self::read_entries(&self.conversation_path(id))
                .await
                .map(|entries| ConversationRecord::from_entries(id, entries))
        };
        self.unlock(id, lock);
        result
    }

    async fn append_locked(&self, conversation_id: &str, turn: TurnAppend) -> OkvmResult<()> {
        let path = self.conversation_path(conversation_id);

        let existing = Self::read_entries(&path).await?;
        if let Some(first) = existing.first() {
            if first.client_key != turn.client_key {
                return Err(owner_mismatch(conversation_id));
            }
        }

        let entry = TurnEntry::from(turn);
        let mut line = serde_json::to_string(&entry)
            .map_err(|e| persistence("cannot encode turn", e))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| persistence("cannot open conversation", e))?;
        if ends_mid_line(&mut file)
            .await
            .map_err(|e| persistence("cannot read conversation", e))?
        {
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| persistence("cannot write conversation", e))?;
        file.flush()
            .await
            .map_err(|e| persistence("cannot flush conversation", e))?;
        tracing::debug!(
            conversation_id,
            messages = entry.messages.len(),
            status = %entry.status,
            "Turn appended"
        );
        Ok(())
    }
}

/// Whether the file's last byte is something other than a newline.
async fn ends_mid_line(file: &mut tokio::fs::File) -> std::io::Result<bool> {
    if file.metadata().await?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn append(&self, conversation_id: &str, turn: TurnAppend) -> OkvmResult<()> {
        if !valid_id(conversation_id) {
            return Err(OkvmError::Persistence(format!(
                "invalid conversation id '{conversation_id}'"
            )));
        }
        let lock = self.lock_for(conversation_id);
        let result = {
            let _guard = lock.lock().await;
            self.append_locked(conversation_id, turn).await
        };
        self.unlock(conversation_id, lock);
        result
    }

    async fn load(&self, conversation_id: &str) -> OkvmResult<Option<ConversationRecord>> {
        if !valid_id(conversation_id) {
            return Ok(None);
        }
        self.load_locked(conversation_id).await
    }

    async fn delete(&self, conversation_id: &str) -> OkvmResult<bool> {
        if !valid_id(conversation_id) {
            return Ok(false);
        }
        let lock = self.lock_for(conversation_id);
        let removed = {
            let _guard = lock.lock().await;
            match tokio::fs::remove_file(self.conversation_path(conversation_id)).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(persistence("cannot delete conversation", e)),
            }
        };
        self.unlock(conversation_id, lock);
        removed
    }

    async fn list(&self, client_key: &str) -> OkvmResult<Vec<ConversationSummary>> {
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| persistence("cannot list conversations", e))?;
        let mut ids = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| persistence("cannot list conversations", e))?
        {
            if let Some(stem) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(".jsonl"))
            {
                if valid_id(stem) {
                    ids.push(stem.to_string());
                }
            }
        }

        let mut summaries = Vec::new();
        for id in ids {
            match self.load_locked(&id).await {
                Ok(Some(record)) if record.client_key == client_key => {
                    summaries.push(record.summary());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(conversation_id = %id, error = %e, "Skipping unreadable conversation");
                }
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}
