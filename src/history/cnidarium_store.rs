use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cnidarium::{StateDelta, StateRead, StateWrite, Storage};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{default_title, ConversationSummary, HistoryStore, SessionKey, Turn};

// Key prefixes (no trailing slashes, as cnidarium substores expect)
const TURN_PREFIX: &str = "chat/turn";
const META_PREFIX: &str = "chat/meta";

/// Ids are hashed so separators inside user or channel ids cannot collide.
fn id_hex(id: &str) -> String {
    blake3::hash(id.as_bytes()).to_hex().to_string()
}

fn session_path(key: &SessionKey) -> String {
    format!("{}/{}", id_hex(&key.user_id), id_hex(&key.conversation_id))
}

fn turn_prefix(key: &SessionKey) -> String {
    format!("{}/{}/", TURN_PREFIX, session_path(key))
}

fn turn_key(key: &SessionKey, sequence: u64) -> String {
    // Zero padding keeps lexicographic order equal to sequence order
    format!("{}{:020}", turn_prefix(key), sequence)
}

fn meta_key(key: &SessionKey) -> String {
    format!("{}/{}", META_PREFIX, session_path(key))
}

fn user_meta_prefix(user_id: &str) -> String {
    format!("{}/{}/", META_PREFIX, id_hex(user_id))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConversationMeta {
    user_id: String,
    conversation_id: String,
    title: String,
    next_sequence: u64,
    /// Sequence of the oldest retained turn.
    first_sequence: u64,
    updated_at: DateTime<Utc>,
}

impl ConversationMeta {
    fn key(&self) -> SessionKey {
        SessionKey::new(self.user_id.clone(), self.conversation_id.clone())
    }

    fn retained(&self) -> usize {
        (self.next_sequence - self.first_sequence) as usize
    }
}

/// Durable history in a cnidarium (RocksDB-backed) store.
pub struct CnidariumHistoryStore {
    storage: Storage,
    k: usize,
    /// Serializes read-modify-write commits; each delta forks the latest snapshot.
    write_lock: Mutex<()>,
}

impl CnidariumHistoryStore {
    pub async fn new(data_dir: &Path, k: usize) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let prefixes = vec![TURN_PREFIX.to_string(), META_PREFIX.to_string()];
        let storage = Storage::load(data_dir.to_path_buf(), prefixes)
            .await
            .context("Failed to init cnidarium history storage")?;
        Ok(Self {
            storage,
            k: k.max(1),
            write_lock: Mutex::new(()),
        })
    }

    async fn meta(&self, key: &SessionKey) -> Result<Option<ConversationMeta>> {
        let snapshot = self.storage.latest_snapshot();
        let Some(bytes) = snapshot.get_raw(&meta_key(key)).await? else {
            return Ok(None);
        };
        Ok(Some(
            serde_json::from_slice(&bytes).context("deserialize conversation meta")?,
        ))
    }

    async fn user_metas(&self, user_id: &str) -> Result<Vec<ConversationMeta>> {
        let snapshot = self.storage.latest_snapshot();
        let prefix = user_meta_prefix(user_id);
        let mut stream = snapshot.prefix_raw(&prefix);
        let mut results = Vec::new();

        while let Some(entry) = stream.next().await {
            match entry {
                Ok((_key, value)) => match serde_json::from_slice::<ConversationMeta>(&value) {
                    Ok(meta) => results.push(meta),
                    Err(e) => warn!(error = %e, "skipping unreadable conversation meta"),
                },
                Err(e) => warn!(error = %e, "error reading conversation meta stream"),
            }
        }
        Ok(results)
    }

    /// Delete the turns and meta entry of one conversation.
    fn delete_conversation(delta: &mut StateDelta<cnidarium::Snapshot>, meta: &ConversationMeta) {
        let key = meta.key();
        for sequence in meta.first_sequence..meta.next_sequence {
            delta.delete(turn_key(&key, sequence));
        }
        delta.delete(meta_key(&key));
    }
}

#[async_trait]
impl HistoryStore for CnidariumHistoryStore {
    fn capacity(&self) -> usize {
        self.k
    }

    async fn get(&self, key: &SessionKey) -> Result<Vec<Turn>> {
        let snapshot = self.storage.latest_snapshot();
        let mut stream = snapshot.prefix_raw(&turn_prefix(key));
        let mut turns = Vec::new();

        while let Some(entry) = stream.next().await {
            match entry {
                Ok((_key, value)) => match serde_json::from_slice::<Turn>(&value) {
                    Ok(turn) => turns.push(turn),
                    Err(e) => warn!(session = %key, error = %e, "skipping unreadable turn"),
                },
                Err(e) => warn!(session = %key, error = %e, "error reading turn stream"),
            }
        }

        turns.sort_by_key(|t| t.sequence);
        // A crash between commits can leave extra turns behind
        if turns.len() > self.k {
            turns.drain(..turns.len() - self.k);
        }
        Ok(turns)
    }

    async fn append(&self, key: &SessionKey, mut turn: Turn) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut meta = self.meta(key).await?.unwrap_or_else(|| ConversationMeta {
            user_id: key.user_id.clone(),
            conversation_id: key.conversation_id.clone(),
            title: default_title(&turn.question),
            next_sequence: 0,
            first_sequence: 0,
            updated_at: turn.created_at,
        });

        turn.sequence = meta.next_sequence;
        meta.next_sequence += 1;
        meta.updated_at = turn.created_at;

        let snapshot = self.storage.latest_snapshot();
        let mut delta = StateDelta::new(snapshot);
        delta.put_raw(
            turn_key(key, turn.sequence),
            serde_json::to_vec(&turn).context("serialize turn")?,
        );
        while meta.retained() > self.k {
            delta.delete(turn_key(key, meta.first_sequence));
            meta.first_sequence += 1;
        }
        delta.put_raw(
            meta_key(key),
            serde_json::to_vec(&meta).context("serialize conversation meta")?,
        );
        self.storage.commit(delta).await?;

        debug!(session = %key, sequence = turn.sequence, retained = meta.retained(), "turn persisted");
        Ok(())
    }

    async fn clear(&self, key: &SessionKey) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let Some(meta) = self.meta(key).await? else {
            return Ok(());
        };
        let snapshot = self.storage.latest_snapshot();
        let mut delta = StateDelta::new(snapshot);
        Self::delete_conversation(&mut delta, &meta);
        self.storage.commit(delta).await?;
        debug!(session = %key, "conversation cleared");
        Ok(())
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>> {
        let mut out: Vec<ConversationSummary> = self
            .user_metas(user_id)
            .await?
            .into_iter()
            .map(|m| ConversationSummary {
                turns: m.retained().min(self.k),
                conversation_id: m.conversation_id,
                title: m.title,
                updated_at: m.updated_at,
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn rename(&self, key: &SessionKey, title: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let Some(mut meta) = self.meta(key).await? else {
            bail!("conversation not found: {}", key);
        };
        meta.title = title.trim().to_string();
        let snapshot = self.storage.latest_snapshot();
        let mut delta = StateDelta::new(snapshot);
        delta.put_raw(
            meta_key(key),
            serde_json::to_vec(&meta).context("serialize conversation meta")?,
        );
        self.storage.commit(delta).await?;
        Ok(())
    }

    async fn clear_user(&self, user_id: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let metas = self.user_metas(user_id).await?;
        if metas.is_empty() {
            return Ok(0);
        }
        let snapshot = self.storage.latest_snapshot();
        let mut delta = StateDelta::new(snapshot);
        for meta in &metas {
            Self::delete_conversation(&mut delta, meta);
        }
        self.storage.commit(delta).await?;
        debug!(user_id, conversations = metas.len(), "user history cleared");
        Ok(metas.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_persists_last_k_turns_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = CnidariumHistoryStore::new(dir.path(), 2).await.unwrap();
        let key = SessionKey::new("42", "channel-7");
        for i in 0..4 {
            store
                .append(&key, Turn::new(format!("q{}", i), format!("a{}", i)))
                .await
                .unwrap();
        }
        let turns = store.get(&key).await.unwrap();
        let questions: Vec<_> = turns.iter().map(|t| t.question.as_str()).collect();
        assert_eq!(questions, vec!["q2", "q3"]);
    }

    #[tokio::test]
    async fn test_clear_and_conversations() {
        let dir = tempfile::tempdir().unwrap();
        let store = CnidariumHistoryStore::new(dir.path(), 5).await.unwrap();
        let a = SessionKey::new("42", "c1");
        let b = SessionKey::new("42", "c2");
        store.append(&a, Turn::new("Apakah PBI 7/33/PBI/2005 masih berlaku?", "Tidak.")).await.unwrap();
        store.append(&b, Turn::new("Modal inti?", "Rp3 triliun.")).await.unwrap();

        let list = store.list_conversations("42").await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].conversation_id, "c2");

        store.rename(&a, "Rekam jejak PBI").await.unwrap();
        store.clear(&b).await.unwrap();
        assert!(store.get(&b).await.unwrap().is_empty());

        let list = store.list_conversations("42").await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].title, "Rekam jejak PBI");

        assert_eq!(store.clear_user("42").await.unwrap(), 1);
        assert!(store.get(&a).await.unwrap().is_empty());
    }
}
