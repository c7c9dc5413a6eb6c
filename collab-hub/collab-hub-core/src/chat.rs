//! Bounded per-document chat log, keyed `chat:{document_id}`.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::model::ChatMessage;
use crate::policy::{BestEffort, DEFAULT_CACHE_TIMEOUT};
use crate::storage::CacheStore;

/// Entries kept per document.
pub const HISTORY_CAP: usize = 100;
/// Entries replayed to a session when it joins.
pub const REPLAY_ON_JOIN: usize = 50;

const POLICY: BestEffort = BestEffort::Chat;

pub struct ChatChannel {
    cache: Arc<dyn CacheStore>,
    timeout: Duration,
}

impl ChatChannel {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            cache,
            timeout: DEFAULT_CACHE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn key(document_id: Uuid) -> String {
        format!("chat:{document_id}")
    }

    /// Appends the message, keeping the newest [`HISTORY_CAP`] entries.
    /// Returns whether the message was stored.
    pub async fn post(&self, document_id: Uuid, message: &ChatMessage) -> bool {
        let encoded = match serde_json::to_string(message) {
            Ok(encoded) => encoded,
            Err(e) => {
                POLICY.absorb::<()>("post", document_id, Err(e.into()));
                return false;
            }
        };
        let key = Self::key(document_id);
        let push = self.cache.list_push_capped(&key, &encoded, HISTORY_CAP);
        POLICY.run("post", document_id, self.timeout, push).await.is_some()
    }

    /// The newest `n` messages, oldest first. Empty when the cache is down.
    pub async fn recent(&self, document_id: Uuid, n: usize) -> Vec<ChatMessage> {
        let key = Self::key(document_id);
        POLICY
            .run("recent", document_id, self.timeout, self.cache.list_tail(&key, n))
            .await
            .unwrap_or_default()
            .into_iter()
            .filter_map(|raw| match serde_json::from_str(&raw) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!(document = %document_id, "skipping malformed chat entry: {e}");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCache;

    #[tokio::test]
    async fn log_is_capped_and_replays_the_tail() {
        let cache = Arc::new(MemoryCache::new());
        let chat = ChatChannel::new(cache.clone());
        let doc = Uuid::new_v4();
        for i in 1..=120 {
            assert!(chat.post(doc, &ChatMessage::now("ann", &format!("m{i}"))).await);
        }
        assert_eq!(cache.list_len(&ChatChannel::key(doc)), HISTORY_CAP);

        let recent = chat.recent(doc, REPLAY_ON_JOIN).await;
        let contents: Vec<String> = recent.into_iter().map(|m| m.content).collect();
        let expected: Vec<String> = (71..=120).map(|i| format!("m{i}")).collect();
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let cache = Arc::new(MemoryCache::new());
        let chat = ChatChannel::new(cache.clone());
        let doc = Uuid::new_v4();
        cache
            .list_push_capped(&ChatChannel::key(doc), "{not json", HISTORY_CAP)
            .await
            .unwrap();
        chat.post(doc, &ChatMessage::now("bob", "hi")).await;
        let recent = chat.recent(doc, 10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].username, "bob");
    }
}
