use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::BoxFuture;
use crate::ports::messages::MessageStore;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub parent_message_id: Option<String>,
    pub role: String,
    pub body: String,
    pub created_at_ms: i64,
    /// Store-assigned per-conversation insertion sequence. Ordering within
    /// a conversation is always `(created_at_ms, seq)` so same-millisecond
    /// inserts still have a stable "most recent" answer.
    pub seq: i64,
    pub is_deleted: bool,
}

impl Message {
    pub fn position(&self) -> ChainPosition {
        ChainPosition {
            created_at_ms: self.created_at_ms,
            seq: self.seq,
        }
    }
}

/// Ordering key of a message within its conversation chain.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChainPosition {
    pub created_at_ms: i64,
    pub seq: i64,
}

#[derive(Default)]
struct MemoryInner {
    messages: HashMap<String, Message>,
    next_seq: HashMap<String, i64>,
}

/// Message store backed by process memory. Used by the memory data
/// backend and by tests.
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(inner: &Arc<Mutex<MemoryInner>>) -> DomainResult<std::sync::MutexGuard<'_, MemoryInner>> {
        inner
            .lock()
            .map_err(|_| DomainError::Store("memory store mutex poisoned".to_string()))
    }
}

impl MessageStore for InMemoryMessageStore {
    fn create_message(&self, message: &Message) -> BoxFuture<'_, DomainResult<Message>> {
        let message = message.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut inner = Self::lock(&inner)?;
            if inner.messages.contains_key(&message.message_id) {
                return Err(DomainError::Conflict);
            }
            let seq = inner
                .next_seq
                .entry(message.conversation_id.clone())
                .or_insert(0);
            *seq += 1;
            let message = Message {
                seq: *seq,
                ..message
            };
            inner
                .messages
                .insert(message.message_id.clone(), message.clone());
            Ok(message)
        })
    }

    fn get_message(&self, message_id: &str) -> BoxFuture<'_, DomainResult<Option<Message>>> {
        let message_id = message_id.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            let inner = Self::lock(&inner)?;
            Ok(inner.messages.get(&message_id).cloned())
        })
    }

    fn find_predecessor(
        &self,
        conversation_id: &str,
        exclude_message_id: &str,
        before: Option<ChainPosition>,
    ) -> BoxFuture<'_, DomainResult<Option<Message>>> {
        let conversation_id = conversation_id.to_string();
        let exclude_message_id = exclude_message_id.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            let inner = Self::lock(&inner)?;
            let candidate = inner
                .messages
                .values()
                .filter(|message| {
                    message.conversation_id == conversation_id
                        && message.message_id != exclude_message_id
                        && !message.is_deleted
                        && before.is_none_or(|position| message.position() < position)
                })
                .max_by_key(|message| message.position())
                .cloned();
            Ok(candidate)
        })
    }

    fn list_by_conversation(
        &self,
        conversation_id: &str,
        include_deleted: bool,
    ) -> BoxFuture<'_, DomainResult<Vec<Message>>> {
        let conversation_id = conversation_id.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            let inner = Self::lock(&inner)?;
            let mut messages: Vec<_> = inner
                .messages
                .values()
                .filter(|message| {
                    message.conversation_id == conversation_id
                        && (include_deleted || !message.is_deleted)
                })
                .cloned()
                .collect();
            messages.sort_by(|a, b| {
                a.position()
                    .cmp(&b.position())
                    .then_with(|| a.message_id.cmp(&b.message_id))
            });
            Ok(messages)
        })
    }

    fn update_parent(
        &self,
        message_id: &str,
        parent_message_id: Option<&str>,
    ) -> BoxFuture<'_, DomainResult<bool>> {
        let message_id = message_id.to_string();
        let parent_message_id = parent_message_id.map(str::to_string);
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut inner = Self::lock(&inner)?;
            let Some(message) = inner.messages.get_mut(&message_id) else {
                return Ok(false);
            };
            message.parent_message_id = parent_message_id;
            Ok(true)
        })
    }

    fn soft_delete_message(&self, message_id: &str) -> BoxFuture<'_, DomainResult<bool>> {
        let message_id = message_id.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut inner = Self::lock(&inner)?;
            let Some(message) = inner.messages.get_mut(&message_id) else {
                return Ok(false);
            };
            message.is_deleted = true;
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(message_id: &str, conversation_id: &str, created_at_ms: i64) -> Message {
        Message {
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            parent_message_id: None,
            role: "user".to_string(),
            body: "hello".to_string(),
            created_at_ms,
            seq: 0,
            is_deleted: false,
        }
    }

    #[tokio::test]
    async fn create_assigns_monotonic_seq_per_conversation() {
        let store = InMemoryMessageStore::new();
        let a = store.create_message(&draft("m-1", "c-1", 10)).await.unwrap();
        let b = store.create_message(&draft("m-2", "c-1", 10)).await.unwrap();
        let other = store.create_message(&draft("m-3", "c-2", 10)).await.unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(other.seq, 1);
    }

    #[tokio::test]
    async fn duplicate_message_id_is_a_conflict() {
        let store = InMemoryMessageStore::new();
        store.create_message(&draft("m-1", "c-1", 10)).await.unwrap();
        let err = store.create_message(&draft("m-1", "c-1", 11)).await.unwrap_err();
        assert!(matches!(err, DomainError::Conflict));
    }

    #[tokio::test]
    async fn find_predecessor_breaks_timestamp_ties_by_seq() {
        let store = InMemoryMessageStore::new();
        store.create_message(&draft("m-1", "c-1", 10)).await.unwrap();
        let second = store.create_message(&draft("m-2", "c-1", 10)).await.unwrap();
        let third = store.create_message(&draft("m-3", "c-1", 10)).await.unwrap();

        let before_third = store
            .find_predecessor("c-1", "m-3", Some(third.position()))
            .await
            .unwrap()
            .map(|message| message.message_id);
        assert_eq!(before_third.as_deref(), Some("m-2"));

        let before_second = store
            .find_predecessor("c-1", "m-2", Some(second.position()))
            .await
            .unwrap()
            .map(|message| message.message_id);
        assert_eq!(before_second.as_deref(), Some("m-1"));
    }

    #[tokio::test]
    async fn deleted_messages_are_not_predecessor_candidates() {
        let store = InMemoryMessageStore::new();
        store.create_message(&draft("m-1", "c-1", 10)).await.unwrap();
        store.soft_delete_message("m-1").await.unwrap();
        let second = store.create_message(&draft("m-2", "c-1", 20)).await.unwrap();

        let found = store
            .find_predecessor("c-1", "m-2", Some(second.position()))
            .await
            .unwrap();
        assert!(found.is_none());

        let all = store.list_by_conversation("c-1", true).await.unwrap();
        assert_eq!(all.len(), 2);
        let live = store.list_by_conversation("c-1", false).await.unwrap();
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn update_parent_reports_missing_rows() {
        let store = InMemoryMessageStore::new();
        assert!(!store.update_parent("m-missing", Some("m-1")).await.unwrap());
        store.create_message(&draft("m-1", "c-1", 10)).await.unwrap();
        assert!(store.update_parent("m-1", None).await.unwrap());
    }
}
