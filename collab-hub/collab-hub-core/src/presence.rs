//! Who is currently in each document room.
//!
//! One cache set per document, keyed `presence:{document_id}`, holding
//! usernames. No TTL: membership changes only through join, leave and
//! disconnect of sessions on that document.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::policy::{BestEffort, DEFAULT_CACHE_TIMEOUT};
use crate::storage::CacheStore;

const POLICY: BestEffort = BestEffort::Presence;

pub struct PresenceTracker {
    cache: Arc<dyn CacheStore>,
    timeout: Duration,
}

impl PresenceTracker {
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
        format!("presence:{document_id}")
    }

    pub async fn join(&self, document_id: Uuid, username: &str) {
        let key = Self::key(document_id);
        POLICY
            .run("join", document_id, self.timeout, self.cache.set_add(&key, username))
            .await;
    }

    pub async fn leave(&self, document_id: Uuid, username: &str) {
        let key = Self::key(document_id);
        POLICY
            .run("leave", document_id, self.timeout, self.cache.set_remove(&key, username))
            .await;
    }

    /// Sorted usernames, or `None` when the cache could not be read.
    pub async fn list(&self, document_id: Uuid) -> Option<Vec<String>> {
        let key = Self::key(document_id);
        POLICY
            .run("list", document_id, self.timeout, self.cache.set_members(&key))
            .await
            .map(|mut users| {
                users.sort();
                users
            })
    }
}
