//! Per-conversation chat history, bounded to the last `k` turns.

pub mod cnidarium_store;

use std::collections::{HashMap, VecDeque};
use std::fmt;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

pub use cnidarium_store::CnidariumHistoryStore;

const TITLE_MAX_CHARS: usize = 60;

/// One question/answer exchange. `sequence` is assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub sequence: u64,
    pub question: String,
    pub answer: String,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            question: question.into(),
            answer: answer.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub conversation_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.conversation_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub title: String,
    pub turns: usize,
    pub updated_at: DateTime<Utc>,
}

/// Conversation titles default to the first question, cut at a char boundary.
pub fn default_title(question: &str) -> String {
    let question = question.trim();
    if question.chars().count() <= TITLE_MAX_CHARS {
        return question.to_string();
    }
    let cut: String = question.chars().take(TITLE_MAX_CHARS).collect();
    format!("{}…", cut.trim_end())
}

/// Session history capability. Implementations keep at most `capacity()`
/// turns per key and evict the oldest first.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    fn capacity(&self) -> usize;

    /// Stored turns, oldest first.
    async fn get(&self, key: &SessionKey) -> Result<Vec<Turn>>;

    async fn append(&self, key: &SessionKey, turn: Turn) -> Result<()>;

    async fn clear(&self, key: &SessionKey) -> Result<()>;

    /// Conversations of one user, most recently updated first.
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>>;

    async fn rename(&self, key: &SessionKey, title: &str) -> Result<()>;

    /// Remove every conversation of a user. Returns how many were removed.
    async fn clear_user(&self, user_id: &str) -> Result<usize>;
}

#[derive(Debug, Default)]
struct Conversation {
    turns: VecDeque<Turn>,
    next_sequence: u64,
    title: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

/// Process-local store. History is lost on restart.
pub struct MemoryHistoryStore {
    k: usize,
    sessions: RwLock<HashMap<SessionKey, Conversation>>,
}

impl MemoryHistoryStore {
    pub fn new(k: usize) -> Self {
        Self {
            k: k.max(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    fn capacity(&self) -> usize {
        self.k
    }

    async fn get(&self, key: &SessionKey) -> Result<Vec<Turn>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(key)
            .map(|c| c.turns.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn append(&self, key: &SessionKey, mut turn: Turn) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let conversation = sessions.entry(key.clone()).or_default();
        turn.sequence = conversation.next_sequence;
        conversation.next_sequence += 1;
        if conversation.title.is_none() {
            conversation.title = Some(default_title(&turn.question));
        }
        conversation.updated_at = Some(turn.created_at);
        conversation.turns.push_back(turn);
        while conversation.turns.len() > self.k {
            conversation.turns.pop_front();
        }
        debug!(session = %key, stored = conversation.turns.len(), "turn appended");
        Ok(())
    }

    async fn clear(&self, key: &SessionKey) -> Result<()> {
        self.sessions.write().await.remove(key);
        Ok(())
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<ConversationSummary> = sessions
            .iter()
            .filter(|(key, _)| key.user_id == user_id)
            .map(|(key, c)| ConversationSummary {
                conversation_id: key.conversation_id.clone(),
                title: c.title.clone().unwrap_or_default(),
                turns: c.turns.len(),
                updated_at: c.updated_at.unwrap_or_else(Utc::now),
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn rename(&self, key: &SessionKey, title: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let Some(conversation) = sessions.get_mut(key) else {
            bail!("conversation not found: {}", key);
        };
        conversation.title = Some(title.trim().to_string());
        Ok(())
    }

    async fn clear_user(&self, user_id: &str) -> Result<usize> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|key, _| key.user_id != user_id);
        Ok(before - sessions.len())
    }
}

/// Render turns for the contextualization prompt.
pub fn format_history(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| format!("Human: {}\nAI: {}", t.question, t.answer))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keeps_exactly_last_k_turns() {
        let store = MemoryHistoryStore::new(3);
        let key = SessionKey::new("u1", "c1");
        for i in 0..5 {
            store
                .append(&key, Turn::new(format!("q{}", i), format!("a{}", i)))
                .await
                .unwrap();
        }
        let turns = store.get(&key).await.unwrap();
        let questions: Vec<_> = turns.iter().map(|t| t.question.as_str()).collect();
        assert_eq!(questions, vec!["q2", "q3", "q4"]);
        assert_eq!(turns[0].sequence, 2);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let store = MemoryHistoryStore::new(5);
        store.append(&SessionKey::new("u1", "c1"), Turn::new("a", "b")).await.unwrap();
        assert!(store.get(&SessionKey::new("u1", "c2")).await.unwrap().is_empty());
        assert!(store.get(&SessionKey::new("u2", "c1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conversation_management() {
        let store = MemoryHistoryStore::new(5);
        let first = SessionKey::new("u1", "c1");
        let second = SessionKey::new("u1", "c2");
        store
            .append(&first, Turn::new("Apa itu POJK 11/2022?", "..."))
            .await
            .unwrap();
        store.append(&second, Turn::new("Modal inti minimum?", "...")).await.unwrap();
        store.append(&SessionKey::new("u2", "c9"), Turn::new("x", "y")).await.unwrap();

        store.rename(&first, "Teknologi informasi").await.unwrap();
        let list = store.list_conversations("u1").await.unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().any(|c| c.title == "Teknologi informasi"));
        assert!(list.iter().any(|c| c.title == "Modal inti minimum?"));
        assert!(store.rename(&SessionKey::new("u1", "nope"), "t").await.is_err());

        assert_eq!(store.clear_user("u1").await.unwrap(), 2);
        assert!(store.list_conversations("u1").await.unwrap().is_empty());
        assert_eq!(store.list_conversations("u2").await.unwrap().len(), 1);
    }

    #[test]
    fn test_default_title_truncates() {
        let long = "a".repeat(100);
        let title = default_title(&long);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 1);
        assert_eq!(default_title("  pendek  "), "pendek");
    }
}
