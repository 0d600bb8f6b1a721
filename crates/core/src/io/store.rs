//! Retrieval store seam: chat history, similarity search, user memories.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{Duration, Utc};

use crate::types::{ChatId, ContentKind, ContextItem, MessageId, UserId};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("retrieval store unavailable: {0}")]
    Unavailable(String),
}

/// Filters for [`RetrievalStore::search_similar`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub limit: usize,
    /// Empty means every kind.
    pub kinds: Vec<ContentKind>,
    /// Only items newer than `now - window`.
    pub window: Option<Duration>,
}

impl SearchOptions {
    pub fn new(limit: usize) -> Self {
        Self { limit, kinds: Vec::new(), window: None }
    }

    pub fn kinds(mut self, kinds: &[ContentKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn within(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    fn admits(&self, item: &ContextItem) -> bool {
        let kind_ok = self.kinds.is_empty()
            || item.content_kind().is_some_and(|k| self.kinds.contains(&k));
        let age_ok = match (self.window, item.at()) {
            (Some(window), Some(at)) => at >= Utc::now() - window,
            _ => true,
        };
        kind_ok && age_ok
    }
}

#[async_trait::async_trait]
pub trait RetrievalStore: Send + Sync {
    /// Up to `limit` most recent items, ending at `anchor` when it is known.
    async fn get_context(
        &self,
        chat_id: ChatId,
        anchor: MessageId,
        limit: usize,
    ) -> Result<Vec<ContextItem>, StoreError>;

    async fn search_similar(
        &self,
        chat_id: ChatId,
        query: &str,
        opts: SearchOptions,
    ) -> Result<Vec<ContextItem>, StoreError>;

    async fn get_user_memory(&self, user_id: UserId) -> Result<Option<String>, StoreError>;
}

/// Process-local store. Similarity is plain term overlap.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    chats: RwLock<HashMap<ChatId, Vec<ContextItem>>>,
    memories: RwLock<HashMap<UserId, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, chat_id: ChatId, item: ContextItem) -> Result<(), StoreError> {
        let mut chats = self.chats.write().map_err(poisoned)?;
        chats.entry(chat_id).or_default().push(item);
        Ok(())
    }

    pub fn set_user_memory(&self, user_id: UserId, memory: impl Into<String>) -> Result<(), StoreError> {
        let mut memories = self.memories.write().map_err(poisoned)?;
        memories.insert(user_id, memory.into());
        Ok(())
    }

    pub fn items(&self, chat_id: ChatId) -> Vec<ContextItem> {
        self.chats
            .read()
            .ok()
            .and_then(|c| c.get(&chat_id).cloned())
            .unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("in-memory store lock poisoned".into())
}

fn is_anchor(item: &ContextItem, anchor: MessageId) -> bool {
    matches!(item, ContextItem::Message { message_id, .. } if *message_id == anchor)
}

fn overlap(query: &str, text: &str) -> usize {
    let text = text.to_lowercase();
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|term| text.contains(term.as_str()))
        .count()
}

#[async_trait::async_trait]
impl RetrievalStore for InMemoryStore {
    async fn get_context(
        &self,
        chat_id: ChatId,
        anchor: MessageId,
        limit: usize,
    ) -> Result<Vec<ContextItem>, StoreError> {
        let chats = self.chats.read().map_err(poisoned)?;
        let Some(items) = chats.get(&chat_id) else {
            return Ok(Vec::new());
        };
        let end = items
            .iter()
            .rposition(|i| is_anchor(i, anchor))
            .map_or(items.len(), |pos| pos + 1);
        let start = end.saturating_sub(limit);
        Ok(items[start..end].to_vec())
    }

    async fn search_similar(
        &self,
        chat_id: ChatId,
        query: &str,
        opts: SearchOptions,
    ) -> Result<Vec<ContextItem>, StoreError> {
        let chats = self.chats.read().map_err(poisoned)?;
        let Some(items) = chats.get(&chat_id) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<(usize, usize)> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| opts.admits(item))
            .map(|(idx, item)| (overlap(query, item.text()), idx))
            .filter(|(score, _)| *score > 0)
            .collect();
        // best score first, newer first on ties
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        Ok(scored
            .into_iter()
            .take(opts.limit)
            .map(|(_, idx)| items[idx].clone())
            .collect())
    }

    async fn get_user_memory(&self, user_id: UserId) -> Result<Option<String>, StoreError> {
        let memories = self.memories.read().map_err(poisoned)?;
        Ok(memories.get(&user_id).cloned())
    }
}
